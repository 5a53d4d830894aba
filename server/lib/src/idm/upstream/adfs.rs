//! ADFS realm adapter.
//!
//! ADFS speaks plain OAuth2 and the access token itself is the claims JWT,
//! signed by a per-realm certificate we pin at configuration time. Identity
//! is the `primarysid` claim; the stable local uuid is a v5 uuid over the
//! realm's fixed namespace so every login of the same account maps to the
//! same user row.

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use openssl::x509::X509;
use serde::Deserialize;

use crate::prelude::*;

use tunnistamo_proto::oidc::AdfsTokenClaims;

use super::{CallbackParams, CleanedAttributes, FlowState, UpstreamError, UpstreamProvider};

#[derive(Debug, Clone)]
pub struct AdfsRealmConfig {
    pub provider_id: String,
    pub authorize_endpoint: Url,
    pub token_endpoint: Url,
    pub client_id: String,
    /// The ADFS relying-party identifier, sent as `resource`.
    pub resource: String,
    /// Pinned token signing certificate, PEM.
    pub cert_pem: String,
    /// Fixed per-realm namespace for the v5 uuid derivation. Never change
    /// this for a live realm.
    pub domain_uuid: Uuid,
    pub logout_url: Option<Url>,
}

pub struct AdfsProvider {
    config: AdfsRealmConfig,
    http: reqwest::Client,
    decoding: DecodingKey,
}

#[derive(Deserialize)]
struct AdfsTokenResponse {
    access_token: String,
}

impl AdfsProvider {
    pub fn new(config: AdfsRealmConfig, http: reqwest::Client) -> Result<Self, OperationError> {
        let cert = X509::from_pem(config.cert_pem.as_bytes()).map_err(|err| {
            admin_error!(?err, provider = %config.provider_id, "ADFS certificate does not parse");
            OperationError::CryptographyError
        })?;
        let public_pem = cert
            .public_key()
            .and_then(|k| k.public_key_to_pem())
            .map_err(|_| OperationError::CryptographyError)?;
        let decoding = DecodingKey::from_rsa_pem(&public_pem)
            .map_err(|_| OperationError::CryptographyError)?;
        Ok(AdfsProvider {
            config,
            http,
            decoding,
        })
    }

    pub fn derive_user_uuid(&self, primary_sid: &str) -> Uuid {
        Uuid::new_v5(&self.config.domain_uuid, primary_sid.as_bytes())
    }

    fn verify_access_token(&self, access_token: &str) -> Result<AdfsTokenClaims, UpstreamError> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = DEFAULT_JWT_LEEWAY;
        validation.set_audience(&[&self.config.resource]);
        decode::<AdfsTokenClaims>(access_token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|err| {
                security_error!(provider = %self.config.provider_id, ?err, "ADFS token rejected");
                UpstreamError::SignatureInvalid
            })
    }

    fn clean(&self, claims: AdfsTokenClaims) -> Result<CleanedAttributes, UpstreamError> {
        let primary_sid = claims.primary_sid.filter(|s| !s.is_empty()).ok_or_else(|| {
            UpstreamError::InvalidResponse("ADFS token without primarysid".to_string())
        })?;

        let mut first_name = claims.given_name;
        let mut last_name = claims.family_name;
        // unique_name carries "Lastname Firstname" and only backs up the
        // dedicated claims.
        if first_name.is_none() && last_name.is_none() {
            if let Some(unique_name) = claims.unique_name.as_deref() {
                let mut parts = unique_name.split_whitespace();
                last_name = parts.next().map(str::to_string);
                let rest = parts.collect::<Vec<_>>().join(" ");
                if !rest.is_empty() {
                    first_name = Some(rest);
                }
            }
        }

        Ok(CleanedAttributes {
            uid: primary_sid.clone(),
            email: claims.email.map(|e| e.to_lowercase()),
            first_name,
            last_name,
            uuid_hint: Some(self.derive_user_uuid(&primary_sid)),
            primary_sid: Some(primary_sid),
            ad_groups: claims
                .group
                .map(|groups| groups.into_iter().collect()),
            loa: None,
            github_username: None,
            extra: claims.extra,
        })
    }
}

#[async_trait]
impl UpstreamProvider for AdfsProvider {
    fn provider_id(&self) -> &str {
        &self.config.provider_id
    }

    async fn begin(&self, flow: &FlowState) -> Result<Url, UpstreamError> {
        let mut url = self.config.authorize_endpoint.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("resource", &self.config.resource)
            .append_pair("redirect_uri", flow.redirect_uri.as_str())
            .append_pair("state", &flow.state);
        Ok(url)
    }

    async fn complete(
        &self,
        params: &CallbackParams,
        flow: &FlowState,
    ) -> Result<CleanedAttributes, UpstreamError> {
        if let Some(error) = params.error.as_deref() {
            security_info!(provider = %self.config.provider_id, %error, "ADFS returned an error");
            return Err(UpstreamError::Denied);
        }
        if params.state.as_deref() != Some(flow.state.as_str()) {
            return Err(UpstreamError::InvalidResponse("state mismatch".to_string()));
        }
        let code = params
            .code
            .as_deref()
            .ok_or_else(|| UpstreamError::InvalidResponse("callback without code".to_string()))?;

        let token: AdfsTokenResponse = self
            .http
            .post(self.config.token_endpoint.clone())
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", flow.redirect_uri.as_str()),
                ("client_id", &self.config.client_id),
            ])
            .send()
            .await?
            .error_for_status()
            .map_err(|_| UpstreamError::Unavailable)?
            .json()
            .await
            .map_err(|_| {
                UpstreamError::InvalidResponse("token response did not parse".to_string())
            })?;

        let claims = self.verify_access_token(&token.access_token)?;
        self.clean(claims)
    }

    async fn end_session_redirect(&self, post_logout_redirect: &Url) -> Option<Url> {
        let mut url = self.config.logout_url.clone()?;
        url.query_pairs_mut()
            .append_pair("post_logout_redirect_uri", post_logout_redirect.as_str());
        Some(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;

    fn test_provider() -> AdfsProvider {
        // Self-signed cert for the pinned-key path.
        use openssl::asn1::Asn1Time;
        use openssl::bn::BigNum;

        let rsa = Rsa::generate(2048).expect("keygen failed");
        let pkey = PKey::from_rsa(rsa).expect("pkey failed");
        let mut name = openssl::x509::X509NameBuilder::new().expect("name failed");
        name.append_entry_by_text("CN", "test").expect("cn failed");
        let name = name.build();
        let mut builder = openssl::x509::X509Builder::new().expect("builder failed");
        builder.set_version(2).expect("version failed");
        let serial = BigNum::from_u32(1)
            .and_then(|bn| bn.to_asn1_integer())
            .expect("serial failed");
        builder.set_serial_number(&serial).expect("serial failed");
        builder.set_subject_name(&name).expect("subject failed");
        builder.set_issuer_name(&name).expect("issuer failed");
        builder
            .set_not_before(&Asn1Time::days_from_now(0).expect("time failed"))
            .expect("not before failed");
        builder
            .set_not_after(&Asn1Time::days_from_now(365).expect("time failed"))
            .expect("not after failed");
        builder.set_pubkey(&pkey).expect("pubkey failed");
        builder
            .sign(&pkey, openssl::hash::MessageDigest::sha256())
            .expect("sign failed");
        let cert = builder.build();

        AdfsProvider::new(
            AdfsRealmConfig {
                provider_id: "helsinki_adfs".to_string(),
                authorize_endpoint: Url::parse("https://fs.example.com/adfs/oauth2/authorize")
                    .expect("bad url"),
                token_endpoint: Url::parse("https://fs.example.com/adfs/oauth2/token")
                    .expect("bad url"),
                client_id: "cid".to_string(),
                resource: "https://sso.example.com".to_string(),
                cert_pem: String::from_utf8(cert.to_pem().expect("pem failed"))
                    .expect("utf8 failed"),
                domain_uuid: Uuid::parse_str("1c8974a1-1f86-41a0-85dd-94a643370621")
                    .expect("bad uuid"),
                logout_url: None,
            },
            reqwest::Client::new(),
        )
        .expect("provider failed")
    }

    #[test]
    fn test_uuid_derivation_is_stable() {
        let provider = test_provider();
        let a = provider.derive_user_uuid("S-1-5-21-1-2-3-1000");
        let b = provider.derive_user_uuid("S-1-5-21-1-2-3-1000");
        let c = provider.derive_user_uuid("S-1-5-21-1-2-3-1001");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.get_version_num(), 5);
    }

    #[test]
    fn test_unique_name_fallback() {
        let provider = test_provider();
        let claims: AdfsTokenClaims = serde_json::from_value(serde_json::json!({
            "primarysid": "S-1",
            "unique_name": "Meikalainen Matti Tapani",
            "email": "Matti.Meikalainen@Example.com",
        }))
        .expect("claims failed");
        let attrs = provider.clean(claims).expect("clean failed");
        assert_eq!(attrs.last_name.as_deref(), Some("Meikalainen"));
        assert_eq!(attrs.first_name.as_deref(), Some("Matti Tapani"));
        assert_eq!(
            attrs.email.as_deref(),
            Some("matti.meikalainen@example.com")
        );
        assert_eq!(attrs.uuid_hint, Some(provider.derive_user_uuid("S-1")));

        // Dedicated claims win over unique_name.
        let claims: AdfsTokenClaims = serde_json::from_value(serde_json::json!({
            "primarysid": "S-1",
            "unique_name": "Meikalainen Matti",
            "given_name": "Matti",
            "family_name": "Meikalainen",
        }))
        .expect("claims failed");
        let attrs = provider.clean(claims).expect("clean failed");
        assert_eq!(attrs.first_name.as_deref(), Some("Matti"));

        // Missing primarysid is a hard failure.
        let claims: AdfsTokenClaims =
            serde_json::from_value(serde_json::json!({"unique_name": "X Y"}))
                .expect("claims failed");
        assert!(provider.clean(claims).is_err());
    }
}
