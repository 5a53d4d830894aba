//! OAuth2 social login providers: GitHub, Facebook, Google, Azure AD.
//!
//! These upstreams are plain OAuth2 with a profile API, no id token. Each
//! kind carries its fixed endpoints and its own attribute mapping.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::prelude::*;

use super::{
    coerce_scalar, CallbackParams, CleanedAttributes, FlowState, UpstreamError, UpstreamProvider,
};

#[derive(Debug, Clone)]
pub enum SocialKind {
    Github,
    Facebook,
    Google,
    AzureAd {
        /// Tenant id, or common endpoint when absent.
        tenant: Option<String>,
        /// Pull security-enabled group names from Microsoft Graph.
        fetch_groups: bool,
    },
}

#[derive(Debug, Clone)]
pub struct SocialProviderConfig {
    pub provider_id: String,
    pub kind: SocialKind,
    pub client_id: String,
    pub client_secret: String,
}

pub struct SocialProvider {
    config: SocialProviderConfig,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct SocialTokenResponse {
    access_token: String,
}

impl SocialProvider {
    pub fn new(config: SocialProviderConfig, http: reqwest::Client) -> Self {
        SocialProvider { config, http }
    }

    fn authorize_endpoint(&self) -> String {
        match &self.config.kind {
            SocialKind::Github => "https://github.com/login/oauth/authorize".to_string(),
            SocialKind::Facebook => "https://www.facebook.com/v3.2/dialog/oauth".to_string(),
            SocialKind::Google => "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            SocialKind::AzureAd { tenant, .. } => format!(
                "https://login.microsoftonline.com/{}/oauth2/v2.0/authorize",
                tenant.as_deref().unwrap_or("common")
            ),
        }
    }

    fn token_endpoint(&self) -> String {
        match &self.config.kind {
            SocialKind::Github => "https://github.com/login/oauth/access_token".to_string(),
            SocialKind::Facebook => {
                "https://graph.facebook.com/v3.2/oauth/access_token".to_string()
            }
            SocialKind::Google => "https://oauth2.googleapis.com/token".to_string(),
            SocialKind::AzureAd { tenant, .. } => format!(
                "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
                tenant.as_deref().unwrap_or("common")
            ),
        }
    }

    fn profile_endpoint(&self) -> &'static str {
        match &self.config.kind {
            SocialKind::Github => "https://api.github.com/user",
            SocialKind::Facebook => {
                "https://graph.facebook.com/v3.2/me?fields=id,email,first_name,last_name"
            }
            SocialKind::Google => "https://openidconnect.googleapis.com/v1/userinfo",
            SocialKind::AzureAd { .. } => "https://graph.microsoft.com/v1.0/me",
        }
    }

    fn scopes(&self) -> &'static str {
        match &self.config.kind {
            SocialKind::Github => "user:email",
            SocialKind::Facebook => "email",
            SocialKind::Google => "openid email profile",
            SocialKind::AzureAd { fetch_groups, .. } => {
                if *fetch_groups {
                    "User.Read Directory.Read.All"
                } else {
                    "User.Read"
                }
            }
        }
    }

    fn map_profile(&self, doc: &Value) -> Result<CleanedAttributes, UpstreamError> {
        let field = |name: &str| doc.get(name).and_then(coerce_scalar);
        let mut attrs = CleanedAttributes::default();

        match &self.config.kind {
            SocialKind::Github => {
                attrs.uid = field("id").ok_or_else(|| {
                    UpstreamError::InvalidResponse("github profile without id".to_string())
                })?;
                attrs.github_username = field("login");
                attrs.email = field("email");
                // Full name field, split on the first space.
                if let Some(name) = field("name") {
                    let mut parts = name.splitn(2, ' ');
                    attrs.first_name = parts.next().map(str::to_string);
                    attrs.last_name = parts.next().map(str::to_string);
                }
            }
            SocialKind::Facebook => {
                attrs.uid = field("id").ok_or_else(|| {
                    UpstreamError::InvalidResponse("facebook profile without id".to_string())
                })?;
                attrs.email = field("email");
                attrs.first_name = field("first_name");
                attrs.last_name = field("last_name");
            }
            SocialKind::Google => {
                attrs.uid = field("sub").ok_or_else(|| {
                    UpstreamError::InvalidResponse("google profile without sub".to_string())
                })?;
                attrs.email = field("email");
                attrs.first_name = field("given_name");
                attrs.last_name = field("family_name");
            }
            SocialKind::AzureAd { .. } => {
                attrs.uid = field("id").ok_or_else(|| {
                    UpstreamError::InvalidResponse("graph profile without id".to_string())
                })?;
                attrs.email = field("mail").or_else(|| field("userPrincipalName"));
                attrs.first_name = field("givenName");
                attrs.last_name = field("surname");
            }
        }

        attrs.email = attrs.email.map(|e| e.to_lowercase());
        Ok(attrs)
    }

    /// Security-enabled group names from Microsoft Graph.
    async fn fetch_azure_groups(
        &self,
        access_token: &str,
    ) -> Result<Vec<String>, UpstreamError> {
        #[derive(Deserialize)]
        struct GraphMemberOf {
            value: Vec<Value>,
        }
        let doc: GraphMemberOf = self
            .http
            .get("https://graph.microsoft.com/v1.0/me/memberOf?$select=displayName,securityEnabled")
            .bearer_auth(access_token)
            .send()
            .await?
            .error_for_status()
            .map_err(|_| UpstreamError::Unavailable)?
            .json()
            .await
            .map_err(|_| {
                UpstreamError::InvalidResponse("graph memberOf did not parse".to_string())
            })?;
        Ok(doc
            .value
            .iter()
            .filter(|g| g.get("securityEnabled").and_then(Value::as_bool) == Some(true))
            .filter_map(|g| g.get("displayName").and_then(coerce_scalar))
            .collect())
    }
}

#[async_trait]
impl UpstreamProvider for SocialProvider {
    fn provider_id(&self) -> &str {
        &self.config.provider_id
    }

    fn reauth_params(&self) -> Vec<(String, String)> {
        // Facebook only re-prompts for the declined email permission when
        // asked to.
        match self.config.kind {
            SocialKind::Facebook => vec![("auth_type".to_string(), "rerequest".to_string())],
            _ => Vec::new(),
        }
    }

    async fn begin(&self, flow: &FlowState) -> Result<Url, UpstreamError> {
        let mut url = Url::parse(&self.authorize_endpoint())
            .map_err(|_| UpstreamError::InvalidResponse("bad authorize endpoint".to_string()))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", flow.redirect_uri.as_str())
            .append_pair("scope", self.scopes())
            .append_pair("state", &flow.state);
        Ok(url)
    }

    async fn complete(
        &self,
        params: &CallbackParams,
        flow: &FlowState,
    ) -> Result<CleanedAttributes, UpstreamError> {
        if let Some(error) = params.error.as_deref() {
            security_info!(provider = %self.config.provider_id, %error, "Social upstream returned an error");
            return Err(UpstreamError::Denied);
        }
        if params.state.as_deref() != Some(flow.state.as_str()) {
            return Err(UpstreamError::InvalidResponse("state mismatch".to_string()));
        }
        let code = params
            .code
            .as_deref()
            .ok_or_else(|| UpstreamError::InvalidResponse("callback without code".to_string()))?;

        let token: SocialTokenResponse = self
            .http
            .post(self.token_endpoint())
            .header(reqwest::header::ACCEPT, "application/json")
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

        let doc: Value = self
            .http
            .get(self.profile_endpoint())
            .bearer_auth(&token.access_token)
            .header(reqwest::header::USER_AGENT, "tunnistamo")
            .send()
            .await?
            .error_for_status()
            .map_err(|_| UpstreamError::Unavailable)?
            .json()
            .await
            .map_err(|_| UpstreamError::InvalidResponse("profile did not parse".to_string()))?;

        let mut attrs = self.map_profile(&doc)?;
        if let SocialKind::AzureAd {
            fetch_groups: true, ..
        } = self.config.kind
        {
            attrs.ad_groups = Some(self.fetch_azure_groups(&token.access_token).await?);
        }
        Ok(attrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn provider(kind: SocialKind) -> SocialProvider {
        SocialProvider::new(
            SocialProviderConfig {
                provider_id: "social".to_string(),
                kind,
                client_id: "cid".to_string(),
                client_secret: "cs".to_string(),
            },
            reqwest::Client::new(),
        )
    }

    #[test]
    fn test_github_mapping() {
        let attrs = provider(SocialKind::Github)
            .map_profile(&json!({
                "id": 12345,
                "login": "octocat",
                "name": "Mona Lisa Octocat",
                "email": "Mona@Example.com",
            }))
            .expect("map failed");
        assert_eq!(attrs.uid, "12345");
        assert_eq!(attrs.github_username.as_deref(), Some("octocat"));
        assert_eq!(attrs.email.as_deref(), Some("mona@example.com"));
        assert_eq!(attrs.first_name.as_deref(), Some("Mona"));
        assert_eq!(attrs.last_name.as_deref(), Some("Lisa Octocat"));
    }

    #[test]
    fn test_azure_mapping_upn_fallback() {
        let attrs = provider(SocialKind::AzureAd {
            tenant: None,
            fetch_groups: false,
        })
        .map_profile(&json!({
            "id": "abc",
            "userPrincipalName": "User@Tenant.example.com",
            "givenName": "U",
            "surname": "Ser",
        }))
        .expect("map failed");
        assert_eq!(attrs.email.as_deref(), Some("user@tenant.example.com"));
    }

    #[test]
    fn test_facebook_rerequest_params() {
        let params = provider(SocialKind::Facebook).reauth_params();
        assert_eq!(
            params,
            vec![("auth_type".to_string(), "rerequest".to_string())]
        );
        assert!(provider(SocialKind::Github).reauth_params().is_empty());
    }

    #[test]
    fn test_missing_profile_id_is_rejected() {
        assert!(provider(SocialKind::Google)
            .map_profile(&json!({"email": "a@b.c"}))
            .is_err());
    }
}
