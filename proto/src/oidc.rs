//! OpenID Connect token and userinfo claim sets.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_with::formats::SpaceSeparator;
use serde_with::{serde_as, skip_serializing_none, StringWithSeparator};

/// The claims of an ID token as issued to a relying party, and the base
/// claim set that API tokens extend with an authorization map.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct IdTokenClaims {
    pub iss: String,
    /// `str(user.uuid)`.
    pub sub: String,
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    pub auth_time: Option<i64>,
    pub nonce: Option<String>,
    pub at_hash: Option<String>,
    /// The client the token was issued to.
    pub azp: Option<String>,
    /// The upstream provider that authenticated the user.
    pub amr: Option<String>,
    /// Level of assurance carried from the upstream session.
    pub loa: Option<String>,
    /// The Tunnistamo session id.
    pub sid: Option<String>,
    /// Scope claims (profile, email, ...) and API authorization maps.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// The userinfo document. `preferred_username` is always present and always
/// null - clients must key on `sub`. Session and authorisation claims (loa,
/// azp, amr, sid) are deliberately never part of this document.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct UserInfoResponse {
    pub sub: String,
    pub email: Option<String>,
    pub email_verified: Option<bool>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub name: Option<String>,
    /// The short human name, never the opaque derived username.
    pub nickname: Option<String>,
    // Not skipped: must serialize as an explicit null.
    #[serde(skip_serializing_if = "always_serialize")]
    pub preferred_username: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn always_serialize(_: &Option<String>) -> bool {
    false
}

/// An OIDC back-channel logout token, both as we mint them for downstream
/// APIs and as we validate them from upstream providers.
/// <https://openid.net/specs/openid-connect-backchannel-1_0.html#LogoutToken>
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LogoutTokenClaims {
    pub iss: String,
    pub sub: Option<String>,
    pub aud: String,
    pub iat: i64,
    pub exp: Option<i64>,
    pub jti: String,
    pub events: BTreeMap<String, serde_json::Value>,
    pub sid: Option<String>,
    /// Must be ABSENT in a valid logout token. Deserialized so the validator
    /// can reject tokens that carry it.
    pub nonce: Option<String>,
}

impl LogoutTokenClaims {
    /// True when the events map carries the back-channel logout event URI.
    pub fn has_backchannel_event(&self) -> bool {
        self.events
            .contains_key(crate::constants::BACKCHANNEL_LOGOUT_EVENT)
    }
}

/// Claims of an access token as presented by an ADFS realm, post attribute
/// renaming. Kept permissive - realms differ in which claims they emit.
#[serde_as]
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AdfsTokenClaims {
    pub iss: Option<String>,
    pub aud: Option<String>,
    pub exp: Option<i64>,
    pub iat: Option<i64>,
    #[serde(rename = "primarysid")]
    pub primary_sid: Option<String>,
    #[serde(rename = "winaccountname")]
    pub win_account_name: Option<String>,
    pub unique_name: Option<String>,
    pub email: Option<String>,
    pub family_name: Option<String>,
    pub given_name: Option<String>,
    #[serde_as(as = "Option<StringWithSeparator::<SpaceSeparator, String>>")]
    pub group: Option<BTreeSet<String>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_userinfo_preferred_username_is_null() {
        let doc = UserInfoResponse {
            sub: "0000".to_string(),
            ..Default::default()
        };
        let value = serde_json::to_value(&doc).expect("serialise failed");
        assert!(value.get("preferred_username").is_some());
        assert!(value["preferred_username"].is_null());
        // skip_serializing_none holds for the others
        assert!(value.get("email").is_none());
    }

    #[test]
    fn test_logout_token_event_detection() {
        let raw = serde_json::json!({
            "iss": "https://upstream.example.com",
            "sub": "abc",
            "aud": "our-client",
            "iat": 1700000000,
            "jti": "xyz",
            "events": {
                "http://schemas.openid.net/event/backchannel-logout": {}
            }
        });
        let token: LogoutTokenClaims = serde_json::from_value(raw).expect("deserialise failed");
        assert!(token.has_backchannel_event());
        assert!(token.nonce.is_none());
    }
}
