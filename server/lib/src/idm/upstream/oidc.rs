//! Generic upstream OIDC adapter, and the Keycloak variant used for
//! Helsinki-Tunnistus.

use std::sync::Arc;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, Validation};
use serde::Deserialize;

use crate::idm::codec::JwsVerifier;
use crate::prelude::*;

use tunnistamo_proto::oidc::LogoutTokenClaims;

use super::{
    check_logout_token_claims, coerce_list, CallbackParams, CleanedAttributes, DiscoveryCache,
    FlowState, UpstreamError, UpstreamProvider,
};

#[derive(Debug, Clone)]
pub struct OidcProviderConfig {
    pub provider_id: String,
    pub issuer: String,
    pub client_id: String,
    pub client_secret: String,
    pub scopes: Vec<String>,
    /// Redirect the browser to the upstream end_session_endpoint during our
    /// own logout.
    pub redirect_logout_to_end_session: bool,
}

pub struct OidcProvider {
    config: OidcProviderConfig,
    http: reqwest::Client,
    discovery: Arc<DiscoveryCache>,
}

#[derive(Deserialize)]
struct UpstreamTokenResponse {
    access_token: String,
    id_token: Option<String>,
}

#[derive(Deserialize)]
struct UpstreamIdClaims {
    sub: String,
    nonce: Option<String>,
    email: Option<String>,
    given_name: Option<String>,
    family_name: Option<String>,
    loa: Option<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_json::Value>,
}

impl OidcProvider {
    pub fn new(
        config: OidcProviderConfig,
        http: reqwest::Client,
        discovery: Arc<DiscoveryCache>,
    ) -> Self {
        OidcProvider {
            config,
            http,
            discovery,
        }
    }

    async fn issuer_meta(&self) -> Result<Arc<super::CachedIssuer>, UpstreamError> {
        self.discovery
            .get(&self.http, &self.config.issuer, duration_from_epoch_now())
            .await
    }

    fn id_token_validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = DEFAULT_JWT_LEEWAY;
        validation.set_issuer(&[&self.config.issuer]);
        validation.set_audience(&[&self.config.client_id]);
        validation
    }

    /// Exchange and verify, shared with the Keycloak variant.
    async fn complete_inner(
        &self,
        params: &CallbackParams,
        flow: &FlowState,
    ) -> Result<CleanedAttributes, UpstreamError> {
        if let Some(error) = params.error.as_deref() {
            security_info!(provider = %self.config.provider_id, %error, "Upstream returned an error");
            return if error == "access_denied" {
                Err(UpstreamError::Denied)
            } else {
                Err(UpstreamError::InvalidResponse(error.to_string()))
            };
        }
        if params.state.as_deref() != Some(flow.state.as_str()) {
            return Err(UpstreamError::InvalidResponse("state mismatch".to_string()));
        }
        let code = params
            .code
            .as_deref()
            .ok_or_else(|| UpstreamError::InvalidResponse("callback without code".to_string()))?;

        let meta = self.issuer_meta().await?;
        let token: UpstreamTokenResponse = self
            .http
            .post(meta.discovery.token_endpoint.clone())
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", flow.redirect_uri.as_str()),
                ("client_id", &self.config.client_id),
                ("client_secret", &self.config.client_secret),
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

        let id_token = token.id_token.as_deref().ok_or_else(|| {
            UpstreamError::InvalidResponse("token response without id_token".to_string())
        })?;
        let verifier =
            JwsVerifier::from_jwks(&meta.jwks).map_err(|_| UpstreamError::SignatureInvalid)?;
        let claims: UpstreamIdClaims = verifier
            .verify(id_token, &self.id_token_validation())
            .map_err(|err| {
                security_error!(provider = %self.config.provider_id, ?err, "Upstream id token rejected");
                UpstreamError::SignatureInvalid
            })?;
        if claims.nonce.as_deref() != Some(flow.nonce.as_str()) {
            return Err(UpstreamError::InvalidResponse("nonce mismatch".to_string()));
        }

        // Userinfo is best-effort enrichment over the id token claims.
        let mut extra = claims.extra;
        if let Some(userinfo_endpoint) = meta.discovery.userinfo_endpoint.clone() {
            if let Ok(response) = self
                .http
                .get(userinfo_endpoint)
                .bearer_auth(&token.access_token)
                .send()
                .await
            {
                if let Ok(doc) = response.json::<BTreeMap<String, serde_json::Value>>().await {
                    for (key, value) in doc {
                        extra.entry(key).or_insert(value);
                    }
                }
            }
        }

        let ad_groups = extra
            .remove(OAUTH2_SCOPE_AD_GROUPS)
            .map(|value| coerce_list(&value));
        Ok(CleanedAttributes {
            uid: claims.sub,
            email: claims.email.map(|e| e.to_lowercase()),
            first_name: claims.given_name,
            last_name: claims.family_name,
            primary_sid: None,
            ad_groups,
            loa: claims.loa,
            github_username: None,
            uuid_hint: None,
            extra,
        })
    }
}

#[async_trait]
impl UpstreamProvider for OidcProvider {
    fn provider_id(&self) -> &str {
        &self.config.provider_id
    }

    async fn begin(&self, flow: &FlowState) -> Result<Url, UpstreamError> {
        let meta = self.issuer_meta().await?;
        let mut url = meta.discovery.authorization_endpoint.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", flow.redirect_uri.as_str())
            .append_pair("scope", &self.config.scopes.join(" "))
            .append_pair("state", &flow.state)
            .append_pair("nonce", &flow.nonce);
        Ok(url)
    }

    async fn complete(
        &self,
        params: &CallbackParams,
        flow: &FlowState,
    ) -> Result<CleanedAttributes, UpstreamError> {
        self.complete_inner(params, flow).await
    }

    async fn validate_logout_token(
        &self,
        logout_token: &str,
        ct: Duration,
    ) -> Result<LogoutTokenClaims, UpstreamError> {
        let meta = self.issuer_meta().await?;
        let verifier =
            JwsVerifier::from_jwks(&meta.jwks).map_err(|_| UpstreamError::SignatureInvalid)?;
        // Logout tokens need not carry exp; freshness is the iat check.
        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = DEFAULT_JWT_LEEWAY;
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        validation.set_issuer(&[&self.config.issuer]);
        validation.set_audience(&[&self.config.client_id]);
        let claims: LogoutTokenClaims = verifier
            .verify(logout_token, &validation)
            .map_err(|_| UpstreamError::SignatureInvalid)?;
        check_logout_token_claims(&claims, ct)?;
        Ok(claims)
    }

    async fn end_session_redirect(&self, post_logout_redirect: &Url) -> Option<Url> {
        if !self.config.redirect_logout_to_end_session {
            return None;
        }
        let meta = self.issuer_meta().await.ok()?;
        let mut url = meta.discovery.end_session_endpoint.clone()?;
        url.query_pairs_mut()
            .append_pair("post_logout_redirect_uri", post_logout_redirect.as_str());
        Some(url)
    }
}

/// Helsinki-Tunnistus: an OIDC upstream that wants to know which of our
/// clients started the flow, and whose subject uuid becomes the local user
/// uuid.
pub struct KeycloakProvider {
    inner: OidcProvider,
}

impl KeycloakProvider {
    pub fn new(
        config: OidcProviderConfig,
        http: reqwest::Client,
        discovery: Arc<DiscoveryCache>,
    ) -> Self {
        KeycloakProvider {
            inner: OidcProvider::new(config, http, discovery),
        }
    }
}

#[async_trait]
impl UpstreamProvider for KeycloakProvider {
    fn provider_id(&self) -> &str {
        self.inner.provider_id()
    }

    fn on_auth_error_redirect_to_client(&self) -> bool {
        true
    }

    async fn begin(&self, flow: &FlowState) -> Result<Url, UpstreamError> {
        let mut url = self.inner.begin(flow).await?;
        if let Some(original_client_id) = flow.original_client_id.as_deref() {
            url.query_pairs_mut()
                .append_pair("original_client_id", original_client_id);
        }
        Ok(url)
    }

    async fn complete(
        &self,
        params: &CallbackParams,
        flow: &FlowState,
    ) -> Result<CleanedAttributes, UpstreamError> {
        let mut attrs = self.inner.complete_inner(params, flow).await?;
        // The upstream keycloak owns identity: its sub is our user uuid.
        attrs.uuid_hint = Uuid::parse_str(&attrs.uid).ok();
        if attrs.uuid_hint.is_none() {
            return Err(UpstreamError::InvalidResponse(
                "keycloak sub is not a uuid".to_string(),
            ));
        }
        Ok(attrs)
    }

    async fn validate_logout_token(
        &self,
        logout_token: &str,
        ct: Duration,
    ) -> Result<LogoutTokenClaims, UpstreamError> {
        self.inner.validate_logout_token(logout_token, ct).await
    }

    async fn end_session_redirect(&self, post_logout_redirect: &Url) -> Option<Url> {
        self.inner.end_session_redirect(post_logout_redirect).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callback_error_mapping() {
        let config = OidcProviderConfig {
            provider_id: "upstream".to_string(),
            issuer: "https://upstream.example.com".to_string(),
            client_id: "us".to_string(),
            client_secret: "secret".to_string(),
            scopes: vec!["openid".to_string()],
            redirect_logout_to_end_session: false,
        };
        let provider = OidcProvider::new(
            config,
            reqwest::Client::new(),
            Arc::new(DiscoveryCache::default()),
        );
        let flow = FlowState {
            state: "st".to_string(),
            nonce: "n".to_string(),
            redirect_uri: Url::parse("https://sso.example.com/cb").expect("bad url"),
            original_client_id: None,
        };

        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime failed");

        // Explicit cancel maps to denied, other errors to invalid response.
        let params = CallbackParams {
            error: Some("access_denied".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            rt.block_on(provider.complete(&params, &flow)),
            Err(UpstreamError::Denied)
        ));

        let params = CallbackParams {
            error: Some("server_error".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            rt.block_on(provider.complete(&params, &flow)),
            Err(UpstreamError::InvalidResponse(_))
        ));

        // State mismatch never reaches the network.
        let params = CallbackParams {
            code: Some("c".to_string()),
            state: Some("other".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            rt.block_on(provider.complete(&params, &flow)),
            Err(UpstreamError::InvalidResponse(msg)) if msg == "state mismatch"
        ));
    }
}
