//! Upstream identity provider adapters.
//!
//! Every supported login backend (generic OIDC, Keycloak, ADFS realms,
//! Suomi.fi SAML, the OAuth2 social providers) implements
//! [`UpstreamProvider`]. The pipeline only sees the trait and the cleaned
//! attribute set an adapter yields after a completed callback.

use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::idm::session::SessionData;
use crate::prelude::*;

use tunnistamo_proto::oauth2::OidcDiscoveryResponse;
use tunnistamo_proto::oidc::LogoutTokenClaims;

pub mod adfs;
pub mod oidc;
pub mod saml;
pub mod social;

pub use adfs::AdfsProvider;
pub use oidc::{KeycloakProvider, OidcProvider};
pub use saml::SamlProvider;
pub use social::SocialProvider;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    /// Network failure or non-success status from the upstream.
    Unavailable,
    Timeout,
    /// The user cancelled or the upstream denied the authentication.
    Denied,
    /// A response arrived but did not validate.
    InvalidResponse(String),
    SignatureInvalid,
    /// The adapter does not implement this operation.
    Unsupported,
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout
        } else {
            UpstreamError::Unavailable
        }
    }
}

impl From<UpstreamError> for OperationError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::Timeout => OperationError::Timeout,
            UpstreamError::Denied => OperationError::AccessDenied,
            _ => OperationError::UpstreamUnavailable,
        }
    }
}

/// Transient state of one in-flight upstream authentication, persisted in
/// the web session between redirect out and callback in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowState {
    pub state: String,
    pub nonce: String,
    /// Our callback url for this backend.
    pub redirect_uri: Url,
    /// The client_id of the outer authorise flow, when one started this
    /// login. Keycloak forwards it upstream.
    pub original_client_id: Option<String>,
}

/// Query parameters arriving at the callback endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
    /// SAML POST binding fields.
    #[serde(rename = "SAMLResponse")]
    pub saml_response: Option<String>,
    #[serde(rename = "RelayState")]
    pub relay_state: Option<String>,
}

/// What an adapter hands to the login pipeline after a verified callback.
/// Always cleaned: scalars that arrive as a list of one are unwrapped,
/// email and username lowercased.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanedAttributes {
    /// The upstream subject identifier, unique per provider.
    pub uid: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub primary_sid: Option<String>,
    pub ad_groups: Option<Vec<String>>,
    /// Upstream-declared level of assurance, untrusted until the pipeline
    /// checks the backend against the trust list.
    pub loa: Option<String>,
    pub github_username: Option<String>,
    /// Stable local uuid dictated by the adapter (ADFS uuidv5 derivation,
    /// Keycloak sub adoption). None means derive or generate downstream.
    pub uuid_hint: Option<Uuid>,
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Unwrap a json scalar that some upstreams deliver as a list of one.
pub(crate) fn coerce_scalar(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Array(items) if items.len() == 1 => coerce_scalar(&items[0]),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Coerce a value that may be absent, a single string, or a list into a
/// list of non-empty strings.
pub(crate) fn coerce_list(value: &serde_json::Value) -> Vec<String> {
    let items = match value {
        serde_json::Value::String(s) => vec![s.clone()],
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(coerce_scalar)
            .collect(),
        _ => Vec::new(),
    };
    items.into_iter().filter(|s| !s.is_empty()).collect()
}

#[async_trait]
pub trait UpstreamProvider: Send + Sync {
    fn provider_id(&self) -> &str;

    /// Pipeline failures redirect back to the relying party with an oauth2
    /// error instead of our login page.
    fn on_auth_error_redirect_to_client(&self) -> bool {
        false
    }

    /// Extra query parameters for a repeated authorise after a missing
    /// email (facebook rerequest).
    fn reauth_params(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Url to send the browser to, with the flow state already bound.
    async fn begin(&self, flow: &FlowState) -> Result<Url, UpstreamError>;

    /// Consume the callback, verify everything, yield cleaned attributes.
    async fn complete(
        &self,
        params: &CallbackParams,
        flow: &FlowState,
    ) -> Result<CleanedAttributes, UpstreamError>;

    /// Validate an upstream-sent back-channel logout token. Adapters
    /// without OIDC back-channel support reject.
    async fn validate_logout_token(
        &self,
        _logout_token: &str,
        _ct: Duration,
    ) -> Result<LogoutTokenClaims, UpstreamError> {
        Err(UpstreamError::Unsupported)
    }

    /// Front-channel logout url to redirect the browser to, with our return
    /// url attached.
    async fn end_session_redirect(&self, _post_logout_redirect: &Url) -> Option<Url> {
        None
    }

    /// Single logout with the session's login-time state available. SAML
    /// needs the NameID and session index recorded at login; everything else
    /// falls through to the stateless variant.
    async fn single_logout_redirect(
        &self,
        _session: &SessionData,
        post_logout_redirect: &Url,
        _relay_state: &str,
        _ct: Duration,
    ) -> Option<Url> {
        self.end_session_redirect(post_logout_redirect).await
    }
}

/// Claim checks shared by every back-channel logout receiver:
/// event uri present, nonce absent, iat fresh, sub or sid present.
pub(crate) fn check_logout_token_claims(
    claims: &LogoutTokenClaims,
    ct: Duration,
) -> Result<(), UpstreamError> {
    if !claims.has_backchannel_event() {
        return Err(UpstreamError::InvalidResponse(
            "logout token missing backchannel event".to_string(),
        ));
    }
    if claims.nonce.is_some() {
        return Err(UpstreamError::InvalidResponse(
            "logout token must not carry a nonce".to_string(),
        ));
    }
    let now = ct.as_secs() as i64;
    if claims.iat + LOGOUT_TOKEN_MAX_AGE_SECONDS as i64 <= now {
        return Err(UpstreamError::InvalidResponse(
            "logout token too old".to_string(),
        ));
    }
    if claims.sub.as_deref().map(str::is_empty).unwrap_or(true) && claims.sid.is_none() {
        return Err(UpstreamError::InvalidResponse(
            "logout token carries neither sub nor sid".to_string(),
        ));
    }
    Ok(())
}

/// Per-issuer discovery document and JWKS cache with a 24h default ttl.
pub struct DiscoveryCache {
    ttl: Duration,
    inner: tokio::sync::RwLock<HashMap<String, Arc<CachedIssuer>>>,
}

pub struct CachedIssuer {
    fetched_at: Duration,
    pub discovery: OidcDiscoveryResponse,
    pub jwks: tunnistamo_proto::jwk::JwkKeySet,
}

impl Default for DiscoveryCache {
    fn default() -> Self {
        DiscoveryCache {
            ttl: Duration::from_secs(DISCOVERY_CACHE_TTL_SECONDS),
            inner: tokio::sync::RwLock::new(HashMap::new()),
        }
    }
}

impl DiscoveryCache {
    pub fn with_ttl(ttl: Duration) -> Self {
        DiscoveryCache {
            ttl,
            inner: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(
        &self,
        client: &reqwest::Client,
        issuer: &str,
        ct: Duration,
    ) -> Result<Arc<CachedIssuer>, UpstreamError> {
        if let Some(cached) = self.inner.read().await.get(issuer) {
            if cached.fetched_at + self.ttl > ct {
                return Ok(cached.clone());
            }
        }

        let discovery_url = format!(
            "{}/.well-known/openid-configuration",
            issuer.trim_end_matches('/')
        );
        let discovery: OidcDiscoveryResponse = client
            .get(&discovery_url)
            .send()
            .await?
            .error_for_status()
            .map_err(|_| UpstreamError::Unavailable)?
            .json()
            .await
            .map_err(|_| {
                UpstreamError::InvalidResponse("discovery document did not parse".to_string())
            })?;
        let jwks: tunnistamo_proto::jwk::JwkKeySet = client
            .get(discovery.jwks_uri.clone())
            .send()
            .await?
            .error_for_status()
            .map_err(|_| UpstreamError::Unavailable)?
            .json()
            .await
            .map_err(|_| UpstreamError::InvalidResponse("jwks did not parse".to_string()))?;

        let cached = Arc::new(CachedIssuer {
            fetched_at: ct,
            discovery,
            jwks,
        });
        self.inner
            .write()
            .await
            .insert(issuer.to_string(), cached.clone());
        Ok(cached)
    }
}

/// The configured set of upstream backends, keyed by provider id.
#[derive(Default)]
pub struct UpstreamRegistry {
    providers: HashMap<String, Arc<dyn UpstreamProvider>>,
}

impl UpstreamRegistry {
    pub fn insert(&mut self, provider: Arc<dyn UpstreamProvider>) {
        self.providers
            .insert(provider.provider_id().to_string(), provider);
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn UpstreamProvider>> {
        self.providers.get(provider_id).cloned()
    }

    pub fn provider_ids(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }
}

/// Outbound client for upstream calls. Token exchange and jwks fetches get
/// a 10 second ceiling.
pub fn http_client() -> Result<reqwest::Client, OperationError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|err| {
            admin_error!(?err, "Unable to construct outbound http client");
            OperationError::Backend
        })
}

/// Back-channel logout fan-out client. Hard 2 second ceiling per target.
pub fn backchannel_client() -> Result<reqwest::Client, OperationError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(BACKCHANNEL_POST_TIMEOUT_SECONDS))
        .build()
        .map_err(|err| {
            admin_error!(?err, "Unable to construct backchannel http client");
            OperationError::Backend
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_coerce_scalar_and_list() {
        assert_eq!(coerce_scalar(&json!("x")), Some("x".to_string()));
        assert_eq!(coerce_scalar(&json!(["x"])), Some("x".to_string()));
        assert_eq!(coerce_scalar(&json!(["x", "y"])), None);
        assert_eq!(coerce_scalar(&json!(null)), None);

        assert_eq!(coerce_list(&json!("a")), vec!["a".to_string()]);
        assert_eq!(
            coerce_list(&json!(["a", "", "b"])),
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(coerce_list(&json!(null)).is_empty());
    }

    fn base_logout_claims() -> LogoutTokenClaims {
        LogoutTokenClaims {
            iss: "https://upstream.example.com".to_string(),
            sub: Some("abc".to_string()),
            aud: "us".to_string(),
            iat: 1000,
            exp: None,
            jti: "j".to_string(),
            events: [(BACKCHANNEL_LOGOUT_EVENT.to_string(), json!({}))]
                .into_iter()
                .collect(),
            sid: None,
            nonce: None,
        }
    }

    #[test]
    fn test_logout_token_claim_checks() {
        let ct = Duration::from_secs(1100);
        assert!(check_logout_token_claims(&base_logout_claims(), ct).is_ok());

        let mut claims = base_logout_claims();
        claims.nonce = Some("n".to_string());
        assert!(check_logout_token_claims(&claims, ct).is_err());

        let mut claims = base_logout_claims();
        claims.events.clear();
        assert!(check_logout_token_claims(&claims, ct).is_err());

        let mut claims = base_logout_claims();
        claims.sub = None;
        assert!(check_logout_token_claims(&claims, ct).is_err());
        claims.sid = Some("s".to_string());
        assert!(check_logout_token_claims(&claims, ct).is_ok());

        // Stale iat.
        let claims = base_logout_claims();
        let late = Duration::from_secs(1000 + LOGOUT_TOKEN_MAX_AGE_SECONDS);
        assert!(check_logout_token_claims(&claims, late).is_err());
    }
}
