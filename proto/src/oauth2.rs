//! OAuth2 RFC protocol definitions.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_with::formats::SpaceSeparator;
use serde_with::{
    rust::deserialize_ignore_any, serde_as, skip_serializing_none, DisplayFromStr,
    StringWithSeparator,
};
use url::Url;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
pub enum CodeChallengeMethod {
    /// `BASE64URL-ENCODE(SHA256(ASCII(code_verifier)))`
    S256,
    /// The verifier is the challenge. Permitted by RFC 7636 but discouraged.
    #[serde(rename = "plain")]
    Plain,
}

/// A PKCE request as it arrives flattened into the authorisation request.
/// The challenge is kept in its transmitted form; for `S256` that is the
/// unpadded url-safe base64 of the verifier digest.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PkceRequest {
    pub code_challenge: String,
    pub code_challenge_method: CodeChallengeMethod,
}

/// The set of artifacts an authorisation request asks for. OIDC allows
/// combinations (the hybrid flows), so this is a set rather than an enum:
/// `code`, `id_token`, `token`, `code id_token`, `code token`,
/// `id_token token`, `code id_token token`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResponseType {
    pub code: bool,
    pub token: bool,
    pub id_token: bool,
}

impl ResponseType {
    pub const CODE: ResponseType = ResponseType {
        code: true,
        token: false,
        id_token: false,
    };

    pub fn is_empty(&self) -> bool {
        !(self.code || self.token || self.id_token)
    }

    /// True when anything beside a plain authorisation code is issued at the
    /// authorisation endpoint - these flows default to fragment encoding.
    pub fn is_implicit_or_hybrid(&self) -> bool {
        self.token || self.id_token
    }
}

impl FromStr for ResponseType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut rt = ResponseType::default();
        for part in s.split_ascii_whitespace() {
            match part {
                "code" => rt.code = true,
                "token" => rt.token = true,
                "id_token" => rt.id_token = true,
                other => return Err(format!("unsupported response_type value {other}")),
            }
        }
        if rt.is_empty() {
            return Err("empty response_type".to_string());
        }
        Ok(rt)
    }
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::with_capacity(3);
        if self.code {
            parts.push("code");
        }
        if self.id_token {
            parts.push("id_token");
        }
        if self.token {
            parts.push("token");
        }
        f.write_str(&parts.join(" "))
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    Query,
    Fragment,
    FormPost,
    #[serde(other, deserialize_with = "deserialize_ignore_any")]
    Invalid,
}

/// An OAuth2 client redirects to the authorisation server with Authorisation
/// Request parameters.
#[serde_as]
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuthorisationRequest {
    #[serde_as(as = "DisplayFromStr")]
    pub response_type: ResponseType,
    /// Optional; defaults to `query` for the pure code flow and `fragment`
    /// for anything carrying a token or id_token.
    ///
    /// Reference:
    /// [OAuth 2.0 Multiple Response Type Encoding Practices: Response Modes](https://openid.net/specs/oauth-v2-multiple-response-types-1_0.html#ResponseModes)
    pub response_mode: Option<ResponseMode>,
    pub client_id: String,
    pub state: Option<String>,
    #[serde(flatten)]
    pub pkce_request: Option<PkceRequest>,
    pub redirect_uri: Url,
    #[serde_as(as = "StringWithSeparator::<SpaceSeparator, String>")]
    pub scope: BTreeSet<String>,
    // OIDC adds a nonce parameter that is optional.
    pub nonce: Option<String>,
    // OIDC also allows other optional params
    #[serde(flatten)]
    pub oidc_ext: AuthorisationRequestOidc,
    /// Preselects the upstream login method, passed through to the login view.
    pub idp_hint: Option<String>,
    /// Set by the server itself when re-authentication has already been forced
    /// once in this flow, so that `ALWAYS_REAUTHENTICATE_BACKENDS` does not
    /// loop.
    #[serde_as(as = "Option<DisplayFromStr>")]
    pub first_authz: Option<bool>,
    // Needs to be hoisted here due to serde flatten bug #3185
    pub max_age: Option<i64>,
    #[serde(flatten)]
    pub unknown_keys: BTreeMap<String, serde_json::value::Value>,
}

impl AuthorisationRequest {
    /// Get the `response_mode` appropriate for this request, taking into
    /// account defaults from the `response_type` parameter.
    ///
    /// Returns `None` if the selection is invalid.
    pub fn get_response_mode(&self) -> Option<ResponseMode> {
        match (self.response_mode, self.response_type.is_implicit_or_hybrid()) {
            // https://openid.net/specs/oauth-v2-multiple-response-types-1_0.html#Security
            // A response whose default mode is the fragment encoding must never
            // be downgraded to query encoding.
            (Some(ResponseMode::Query), true) => None,
            (Some(ResponseMode::Invalid), _) => None,
            (Some(mode), _) => Some(mode),
            (None, true) => Some(ResponseMode::Fragment),
            (None, false) => Some(ResponseMode::Query),
        }
    }

    /// The `prompt` parameter as a set of values.
    pub fn prompt_set(&self) -> BTreeSet<&str> {
        self.oidc_ext
            .prompt
            .as_deref()
            .map(|p| p.split_ascii_whitespace().collect())
            .unwrap_or_default()
    }

    /// The `ui_locales` values in preference order. Both space and dash
    /// separated lists are seen in the wild.
    pub fn ui_locale_candidates(&self) -> Vec<&str> {
        self.oidc_ext
            .ui_locales
            .as_deref()
            .map(|l| l.split([' ', '-']).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default()
    }
}

/// An OIDC client redirects to the authorisation server with Authorisation
/// Request parameters.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct AuthorisationRequestOidc {
    pub display: Option<String>,
    pub prompt: Option<String>,
    pub ui_locales: Option<String>,
    pub claims_locales: Option<String>,
    pub id_token_hint: Option<String>,
    pub login_hint: Option<String>,
    pub acr: Option<String>,
}

#[serde_as]
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "grant_type", rename_all = "snake_case")]
pub enum GrantTypeReq {
    AuthorizationCode {
        // As issued by the authorisation endpoint.
        code: String,
        // Must be the same as the original redirect uri.
        redirect_uri: Url,
        code_verifier: Option<String>,
    },
    RefreshToken {
        refresh_token: String,
        #[serde_as(as = "Option<StringWithSeparator::<SpaceSeparator, String>>")]
        scope: Option<BTreeSet<String>>,
    },
}

/// An Access Token request. This requires a set of grant-type parameters to
/// satisfy the request.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug)]
pub struct AccessTokenRequest {
    #[serde(flatten)]
    pub grant_type: GrantTypeReq,
    // REQUIRED, if the client is not authenticating via the Authorization
    // header as described in RFC 6749 Section 3.2.1.
    #[serde(flatten)]
    pub client_post_auth: ClientPostAuth,
}

impl From<GrantTypeReq> for AccessTokenRequest {
    fn from(req: GrantTypeReq) -> AccessTokenRequest {
        AccessTokenRequest {
            grant_type: req,
            client_post_auth: ClientPostAuth::default(),
        }
    }
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Default)]
/// <https://datatracker.ietf.org/doc/html/rfc6749#section-2.3.1>
pub struct ClientPostAuth {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

impl From<(&str, Option<&str>)> for ClientPostAuth {
    fn from((client_id, client_secret): (&str, Option<&str>)) -> Self {
        ClientPostAuth {
            client_id: Some(client_id.to_string()),
            client_secret: client_secret.map(|s| s.to_string()),
        }
    }
}

/// The response for an access token
#[serde_as]
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug)]
pub struct AccessTokenResponse {
    pub access_token: String,
    pub token_type: AccessTokenType,
    /// Expiration relative to `now` in seconds.
    pub expires_in: u32,
    pub refresh_token: Option<String>,
    /// Space separated list of scopes that were approved, if this differs
    /// from the original request.
    #[serde_as(as = "StringWithSeparator::<SpaceSeparator, String>")]
    pub scope: BTreeSet<String>,
    /// If the `openid` scope was requested, an `id_token` may be present in
    /// the response.
    pub id_token: Option<String>,
}

/// Access token types, per [IANA Registry - OAuth Access Token Types](https://www.iana.org/assignments/oauth-parameters/oauth-parameters.xhtml#token-types)
#[derive(Serialize, Deserialize, Debug, Eq, PartialEq)]
#[serde(try_from = "&str")]
pub enum AccessTokenType {
    Bearer,
}

impl TryFrom<&str> for AccessTokenType {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "bearer" => Ok(AccessTokenType::Bearer),
            _ => Err(format!("Unknown AccessTokenType: {s}")),
        }
    }
}

/// Request to introspect the state of the token and the identity of its
/// account. <https://datatracker.ietf.org/doc/html/rfc7662>
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug)]
pub struct AccessTokenIntrospectRequest {
    pub token: String,
    /// <https://datatracker.ietf.org/doc/html/rfc7009#section-4.1.2>
    pub token_type_hint: Option<String>,
    // For when they want to use POST auth
    #[serde(flatten)]
    pub client_post_auth: ClientPostAuth,
}

/// Response to an introspection request. If the token is inactive or revoked,
/// only `active` will be set to the value of `false`.
#[serde_as]
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug)]
pub struct AccessTokenIntrospectResponse {
    pub active: bool,
    #[serde_as(as = "StringWithSeparator::<SpaceSeparator, String>")]
    pub scope: BTreeSet<String>,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub token_type: Option<AccessTokenType>,
    pub exp: Option<i64>,
    pub iat: Option<i64>,
    pub nbf: Option<i64>,
    pub sub: Option<String>,
    pub aud: Option<String>,
    pub iss: Option<String>,
}

impl AccessTokenIntrospectResponse {
    pub fn inactive() -> Self {
        AccessTokenIntrospectResponse {
            active: false,
            scope: BTreeSet::default(),
            client_id: None,
            username: None,
            token_type: None,
            exp: None,
            iat: None,
            nbf: None,
            sub: None,
            aud: None,
            iss: None,
        }
    }
}

/// An RP-initiated logout request at the end-session endpoint.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct EndSessionRequest {
    pub id_token_hint: Option<String>,
    pub post_logout_redirect_uri: Option<Url>,
    pub state: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    #[serde(rename = "authorization_code")]
    AuthorisationCode,
    Implicit,
    RefreshToken,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubjectType {
    Pairwise,
    Public,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum PkceAlg {
    S256,
    #[serde(rename = "plain")]
    Plain,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
/// Algorithms supported for token signatures.
pub enum IdTokenSignAlg {
    // WE REFUSE TO SUPPORT NONE. DON'T EVEN ASK. IT WON'T HAPPEN.
    RS256,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TokenEndpointAuthMethod {
    ClientSecretPost,
    ClientSecretBasic,
}

fn token_endpoint_auth_methods_supported_default() -> Vec<TokenEndpointAuthMethod> {
    vec![TokenEndpointAuthMethod::ClientSecretBasic]
}

fn claims_parameter_supported_default() -> bool {
    false
}

fn backchannel_logout_supported_default() -> bool {
    false
}

/// A single entry in the discovery `response_types_supported` list, rendered
/// in its space separated string form.
fn response_types_supported_default() -> Vec<String> {
    vec!["code".to_string()]
}

/// The response to an OpenID connect discovery request
/// <https://openid.net/specs/openid-connect-discovery-1_0.html#ProviderMetadata>
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug)]
pub struct OidcDiscoveryResponse {
    pub issuer: Url,
    pub authorization_endpoint: Url,
    pub token_endpoint: Url,
    pub userinfo_endpoint: Option<Url>,
    pub end_session_endpoint: Option<Url>,
    pub introspection_endpoint: Option<Url>,
    pub jwks_uri: Url,
    pub registration_endpoint: Option<Url>,
    pub scopes_supported: Option<Vec<String>>,
    #[serde(default = "response_types_supported_default")]
    pub response_types_supported: Vec<String>,
    pub response_modes_supported: Vec<ResponseMode>,
    pub grant_types_supported: Vec<GrantType>,
    pub acr_values_supported: Option<Vec<String>>,
    pub subject_types_supported: Vec<SubjectType>,
    pub id_token_signing_alg_values_supported: Vec<IdTokenSignAlg>,
    pub userinfo_signing_alg_values_supported: Option<Vec<String>>,
    pub request_object_signing_alg_values_supported: Option<Vec<String>>,
    #[serde(default = "token_endpoint_auth_methods_supported_default")]
    pub token_endpoint_auth_methods_supported: Vec<TokenEndpointAuthMethod>,
    pub token_endpoint_auth_signing_alg_values_supported: Option<Vec<String>>,
    pub claims_supported: Option<Vec<String>>,
    pub service_documentation: Option<Url>,
    pub ui_locales_supported: Option<Vec<String>>,
    #[serde(default = "claims_parameter_supported_default")]
    pub claims_parameter_supported: bool,
    pub op_policy_uri: Option<Url>,
    pub op_tos_uri: Option<Url>,
    pub code_challenge_methods_supported: Vec<PkceAlg>,
    // https://openid.net/specs/openid-connect-backchannel-1_0.html#BCSupport
    #[serde(default = "backchannel_logout_supported_default")]
    pub backchannel_logout_supported: bool,
    #[serde(default = "backchannel_logout_supported_default")]
    pub backchannel_logout_session_supported: bool,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct ErrorResponse {
    pub error: String,
    pub error_description: Option<String>,
    pub error_uri: Option<Url>,
    pub state: Option<String>,
}

/// The api-tokens endpoint response: a map of API identifier to a compact
/// JWS minted for that API.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct ApiTokenResponse(pub BTreeMap<String, String>);

/// A device registration as accepted at the user_device endpoint.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UserDeviceRegistration {
    pub public_key: serde_json::Value,
    pub secret_key: serde_json::Value,
    pub os: Option<String>,
    pub os_version: Option<String>,
    pub app_version: Option<String>,
    pub device_model: Option<String>,
}

/// A row of the user_login_entry resource.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UserLoginEntryView {
    pub service: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: time::OffsetDateTime,
    pub ip_address: Option<String>,
    pub geo_location: Option<String>,
}

/// A row of the user_consent resource.
#[serde_as]
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UserConsentView {
    pub id: Uuid,
    pub client_id: String,
    #[serde_as(as = "StringWithSeparator::<SpaceSeparator, String>")]
    pub scope: BTreeSet<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub date_given: time::OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<time::OffsetDateTime>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_type_parse() {
        let rt: ResponseType = "code".parse().expect("parse failed");
        assert!(rt.code && !rt.token && !rt.id_token);

        let rt: ResponseType = "code id_token token".parse().expect("parse failed");
        assert!(rt.code && rt.token && rt.id_token);
        assert!(rt.is_implicit_or_hybrid());
        assert_eq!(rt.to_string(), "code id_token token");

        assert!("".parse::<ResponseType>().is_err());
        assert!("cheese".parse::<ResponseType>().is_err());
    }

    #[test]
    fn test_response_mode_defaults() {
        let query = "response_type=code&client_id=app&redirect_uri=https%3A%2F%2Ft%2Fcb&scope=openid";
        let req: AuthorisationRequest =
            serde_urlencoded::from_str(query).expect("failed to parse authorisation request");
        assert_eq!(req.get_response_mode(), Some(ResponseMode::Query));

        let query =
            "response_type=code+id_token&client_id=app&redirect_uri=https%3A%2F%2Ft%2Fcb&scope=openid&nonce=n";
        let req: AuthorisationRequest =
            serde_urlencoded::from_str(query).expect("failed to parse authorisation request");
        assert_eq!(req.get_response_mode(), Some(ResponseMode::Fragment));

        // A fragment-default flow must never be downgraded to query.
        let query = "response_type=id_token&response_mode=query&client_id=app&redirect_uri=https%3A%2F%2Ft%2Fcb&scope=openid&nonce=n";
        let req: AuthorisationRequest =
            serde_urlencoded::from_str(query).expect("failed to parse authorisation request");
        assert_eq!(req.get_response_mode(), None);
    }

    #[test]
    fn test_oauth2_access_token_req() {
        let atr: AccessTokenRequest = GrantTypeReq::AuthorizationCode {
            code: "demo code".to_string(),
            redirect_uri: Url::parse("http://[::1]").expect("invalid url"),
            code_verifier: None,
        }
        .into();

        let ser = serde_json::to_string(&atr).expect("JSON failure");
        assert!(ser.contains("\"grant_type\":\"authorization_code\""));
    }

    #[test]
    fn test_pkce_flattens_from_query() {
        let query = "response_type=code&client_id=app&redirect_uri=https%3A%2F%2Ft%2Fcb&scope=openid&code_challenge=abc&code_challenge_method=S256";
        let req: AuthorisationRequest =
            serde_urlencoded::from_str(query).expect("failed to parse authorisation request");
        let pkce = req.pkce_request.expect("pkce_request missing");
        assert_eq!(pkce.code_challenge, "abc");
        assert_eq!(pkce.code_challenge_method, CodeChallengeMethod::S256);
    }
}
