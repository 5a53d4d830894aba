//! The server configuration file.
//!
//! A single TOML document holds the bind address, database path, public
//! origin, policy knobs and every configured upstream backend. Key and
//! certificate material is referenced by path and read once at startup.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use tunnistamod_lib::idm::server::IdmConfig;
use tunnistamod_lib::idm::upstream::{
    self, AdfsProvider, DiscoveryCache, KeycloakProvider, OidcProvider, SamlProvider,
    SocialProvider, UpstreamRegistry,
};
use tunnistamod_lib::idm::upstream::adfs::AdfsRealmConfig;
use tunnistamod_lib::idm::upstream::oidc::OidcProviderConfig;
use tunnistamod_lib::idm::upstream::saml::SamlConfig;
use tunnistamod_lib::idm::upstream::social::{SocialKind, SocialProviderConfig};
use tunnistamod_lib::prelude::*;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct CspConfig {
    pub policy: Option<String>,
    #[serde(default)]
    pub report_only: bool,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct KeySettings {
    pub bits: Option<u32>,
    pub max_age_days: Option<u64>,
    pub retention_days: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OidcUpstreamEntry {
    pub provider_id: String,
    pub issuer: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_oidc_scopes")]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub redirect_logout_to_end_session: bool,
}

fn default_oidc_scopes() -> Vec<String> {
    vec![
        "openid".to_string(),
        "profile".to_string(),
        "email".to_string(),
    ]
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdfsRealmEntry {
    pub provider_id: String,
    pub authorize_endpoint: Url,
    pub token_endpoint: Url,
    pub client_id: String,
    pub resource: String,
    pub cert_path: PathBuf,
    pub domain_uuid: Uuid,
    pub logout_url: Option<Url>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SocialUpstreamEntry {
    pub provider_id: String,
    /// One of `github`, `facebook`, `google`, `azure_ad`.
    pub kind: String,
    pub client_id: String,
    pub client_secret: String,
    pub tenant: Option<String>,
    #[serde(default)]
    pub fetch_ad_groups: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginMethodEntry {
    pub provider_id: String,
    pub display: String,
    #[serde(default)]
    pub order: i64,
    pub logo_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuomifiEntry {
    #[serde(default = "default_suomifi_id")]
    pub provider_id: String,
    pub sp_entity_id: String,
    pub idp_entity_id: String,
    pub idp_sso_url: Url,
    pub idp_slo_url: Url,
    pub idp_cert_path: PathBuf,
    pub sp_key_path: PathBuf,
    pub sp_cert_path: PathBuf,
    #[serde(default)]
    pub service_names: BTreeMap<String, String>,
}

fn default_suomifi_id() -> String {
    "suomifi".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_bindaddress")]
    pub bindaddress: String,
    pub db_path: String,
    /// Public origin of this deployment, e.g. `https://sso.hel.fi`. Becomes
    /// the `iss` of everything signed.
    pub origin: String,
    /// Honour the `X-Scheme` header set by a TLS-terminating proxy when
    /// deciding whether cookies are Secure.
    #[serde(default)]
    pub trust_x_scheme: bool,
    pub log_level: Option<String>,
    #[serde(default)]
    pub csp: CspConfig,
    #[serde(default)]
    pub key: KeySettings,

    #[serde(default)]
    pub trusted_email_domains: Vec<String>,
    #[serde(default)]
    pub trusted_loa_backends: Vec<String>,
    #[serde(default)]
    pub always_reauthenticate_backends: Vec<String>,
    #[serde(default)]
    pub restricted_authentication_backends: Vec<String>,
    pub restricted_authentication_timeout: Option<u64>,
    #[serde(default)]
    pub email_exempt_auth_backends: Vec<String>,

    pub code_expiry: Option<u64>,
    pub token_expiry: Option<u64>,
    pub websession_ttl: Option<u64>,
    pub consent_lifetime: Option<u64>,
    #[serde(default)]
    pub ui_locales: Vec<String>,
    #[serde(default)]
    pub identity_validators: BTreeMap<String, Url>,

    #[serde(default)]
    pub login_methods: Vec<LoginMethodEntry>,

    #[serde(default)]
    pub oidc_providers: Vec<OidcUpstreamEntry>,
    #[serde(default)]
    pub keycloak_providers: Vec<OidcUpstreamEntry>,
    #[serde(default)]
    pub adfs_realms: Vec<AdfsRealmEntry>,
    #[serde(default)]
    pub social_providers: Vec<SocialUpstreamEntry>,
    pub suomifi: Option<SuomifiEntry>,
}

fn default_bindaddress() -> String {
    "127.0.0.1:8000".to_string()
}

impl ServerConfig {
    pub fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, std::io::Error> {
        let contents = fs::read_to_string(config_path.as_ref())?;
        toml::from_str(&contents).map_err(|err| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unable to parse config: {err}"),
            )
        })
    }

    /// The policy configuration for the IDM layer. Unset knobs keep the
    /// library defaults.
    pub fn idm_config(&self) -> IdmConfig {
        let mut config = IdmConfig {
            issuer: self.origin.trim_end_matches('/').to_string(),
            trusted_email_domains: self.trusted_email_domains.clone(),
            trusted_loa_backends: self.trusted_loa_backends.clone(),
            always_reauthenticate_backends: self.always_reauthenticate_backends.clone(),
            restricted_authentication_backends: self.restricted_authentication_backends.clone(),
            identity_validators: self.identity_validators.clone(),
            ..Default::default()
        };
        if !self.email_exempt_auth_backends.is_empty() {
            config.email_exempt_auth_backends = self.email_exempt_auth_backends.clone();
        }
        if let Some(secs) = self.restricted_authentication_timeout {
            config.restricted_authentication_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.code_expiry {
            config.code_expiry = Duration::from_secs(secs);
        }
        if let Some(secs) = self.token_expiry {
            config.token_expiry = Duration::from_secs(secs);
        }
        if let Some(secs) = self.websession_ttl {
            config.websession_ttl = Duration::from_secs(secs);
        }
        config.consent_lifetime = self.consent_lifetime.map(Duration::from_secs);
        if !self.ui_locales.is_empty() {
            config.supported_ui_locales = self.ui_locales.clone();
        }
        if let Some(bits) = self.key.bits {
            config.key_config.bits = bits;
        }
        if let Some(days) = self.key.max_age_days {
            config.key_config.max_age = Duration::from_secs(days * 86_400);
        }
        if let Some(days) = self.key.retention_days {
            config.key_config.retention = Duration::from_secs(days * 86_400);
        }
        config
    }

    /// Construct every configured upstream adapter. The SAML provider is
    /// also returned on its own because its metadata and SLS endpoints need
    /// the concrete type.
    pub fn build_upstreams(
        &self,
    ) -> Result<(UpstreamRegistry, Option<Arc<SamlProvider>>), OperationError> {
        let http = upstream::http_client()?;
        let discovery = Arc::new(DiscoveryCache::default());
        let mut registry = UpstreamRegistry::default();

        for entry in &self.oidc_providers {
            registry.insert(Arc::new(OidcProvider::new(
                self.oidc_config(entry),
                http.clone(),
                discovery.clone(),
            )));
        }
        for entry in &self.keycloak_providers {
            registry.insert(Arc::new(KeycloakProvider::new(
                self.oidc_config(entry),
                http.clone(),
                discovery.clone(),
            )));
        }
        for entry in &self.adfs_realms {
            let cert_pem = read_pem(&entry.cert_path)?;
            registry.insert(Arc::new(AdfsProvider::new(
                AdfsRealmConfig {
                    provider_id: entry.provider_id.clone(),
                    authorize_endpoint: entry.authorize_endpoint.clone(),
                    token_endpoint: entry.token_endpoint.clone(),
                    client_id: entry.client_id.clone(),
                    resource: entry.resource.clone(),
                    cert_pem,
                    domain_uuid: entry.domain_uuid,
                    logout_url: entry.logout_url.clone(),
                },
                http.clone(),
            )?));
        }
        for entry in &self.social_providers {
            let kind = match entry.kind.as_str() {
                "github" => SocialKind::Github,
                "facebook" => SocialKind::Facebook,
                "google" => SocialKind::Google,
                "azure_ad" => SocialKind::AzureAd {
                    tenant: entry.tenant.clone(),
                    fetch_groups: entry.fetch_ad_groups,
                },
                other => {
                    admin_error!(kind = %other, "Unknown social provider kind");
                    return Err(OperationError::InvalidState);
                }
            };
            registry.insert(Arc::new(SocialProvider::new(
                SocialProviderConfig {
                    provider_id: entry.provider_id.clone(),
                    kind,
                    client_id: entry.client_id.clone(),
                    client_secret: entry.client_secret.clone(),
                },
                http.clone(),
            )));
        }

        let saml = match &self.suomifi {
            Some(entry) => {
                let origin = self.origin.trim_end_matches('/');
                let acs = format!("{origin}/accounts/{}/acs/", entry.provider_id);
                let sls = format!("{origin}/accounts/{}/sls/", entry.provider_id);
                let provider = Arc::new(SamlProvider::new(SamlConfig {
                    provider_id: entry.provider_id.clone(),
                    sp_entity_id: entry.sp_entity_id.clone(),
                    acs_url: Url::parse(&acs).map_err(|_| OperationError::InvalidState)?,
                    slo_url: Url::parse(&sls).map_err(|_| OperationError::InvalidState)?,
                    idp_entity_id: entry.idp_entity_id.clone(),
                    idp_sso_url: entry.idp_sso_url.clone(),
                    idp_slo_url: entry.idp_slo_url.clone(),
                    idp_cert_pem: read_pem(&entry.idp_cert_path)?,
                    sp_key_pem: read_pem(&entry.sp_key_path)?,
                    sp_cert_pem: read_pem(&entry.sp_cert_path)?,
                    service_names: entry.service_names.clone(),
                })?);
                registry.insert(provider.clone());
                Some(provider)
            }
            None => None,
        };

        Ok((registry, saml))
    }

    fn oidc_config(&self, entry: &OidcUpstreamEntry) -> OidcProviderConfig {
        OidcProviderConfig {
            provider_id: entry.provider_id.clone(),
            issuer: entry.issuer.trim_end_matches('/').to_string(),
            client_id: entry.client_id.clone(),
            client_secret: entry.client_secret.clone(),
            scopes: entry.scopes.clone(),
            redirect_logout_to_end_session: entry.redirect_logout_to_end_session,
        }
    }
}

fn read_pem(path: &Path) -> Result<String, OperationError> {
    fs::read_to_string(path).map_err(|err| {
        admin_error!(?err, path = %path.display(), "Unable to read pem file");
        OperationError::InvalidState
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_parses() {
        let config: ServerConfig = toml::from_str(
            r#"
            db_path = "/var/lib/tunnistamo/db.sqlite"
            origin = "https://sso.hel.fi/"
            trusted_email_domains = ["hel.fi"]

            [[social_providers]]
            provider_id = "github"
            kind = "github"
            client_id = "gh-id"
            client_secret = "gh-secret"
            "#,
        )
        .expect("config did not parse");

        assert_eq!(config.bindaddress, "127.0.0.1:8000");
        let idm = config.idm_config();
        assert_eq!(idm.issuer, "https://sso.hel.fi");
        assert!(idm.email_domain_trusted("a@hel.fi"));

        let (registry, saml) = config.build_upstreams().expect("upstreams");
        assert!(registry.get("github").is_some());
        assert!(registry.get("suomifi").is_none());
        assert!(saml.is_none());
    }

    #[test]
    fn test_policy_knob_overrides() {
        let config: ServerConfig = toml::from_str(
            r#"
            db_path = ":memory:"
            origin = "https://sso.example.com"
            token_expiry = 600
            consent_lifetime = 86400
            restricted_authentication_backends = ["adfs_helsinki"]
            restricted_authentication_timeout = 900

            [key]
            bits = 2048
            max_age_days = 30
            "#,
        )
        .expect("config did not parse");

        let idm = config.idm_config();
        assert_eq!(idm.token_expiry, Duration::from_secs(600));
        assert_eq!(idm.consent_lifetime, Some(Duration::from_secs(86_400)));
        assert!(idm.backend_is_restricted("adfs_helsinki"));
        assert_eq!(
            idm.restricted_authentication_timeout,
            Duration::from_secs(900)
        );
        assert_eq!(idm.key_config.bits, 2048);
        assert_eq!(idm.key_config.max_age, Duration::from_secs(30 * 86_400));
    }
}
