//! The identity management server: owns the database, the client registry,
//! the upstream adapters and the policy configuration. Operation
//! implementations live beside their domain modules; this file holds the
//! aggregate, construction, and the periodic maintenance entry points.

use std::sync::Arc;

use rand::{thread_rng, Rng};

use crate::be::Db;
use crate::idm::clients::{self, Client, ClientRegistry, LoginMethod};
use crate::idm::keys::{self, KeyConfig, RotationOutcome};
use crate::idm::oauth2;
use crate::idm::upstream::{self, UpstreamProvider, UpstreamRegistry};
use crate::idm::websession;
use crate::prelude::*;

/// Policy knobs, all backend lists keyed by upstream provider id.
#[derive(Debug, Clone)]
pub struct IdmConfig {
    /// Public origin of this server, the `iss` of everything we sign.
    pub issuer: String,
    /// Email domains whose addresses may silently attach a new upstream
    /// login to an existing user.
    pub trusted_email_domains: Vec<String>,
    /// Backends whose upstream loa claim is believed. Everything else is
    /// forced to "low".
    pub trusted_loa_backends: Vec<String>,
    /// Backends forced through a fresh upstream authentication on every
    /// authorise request.
    pub always_reauthenticate_backends: Vec<String>,
    /// Backends whose logins never receive refresh tokens and idle out.
    pub restricted_authentication_backends: Vec<String>,
    pub restricted_authentication_timeout: Duration,
    /// Backends allowed to log in without an email address.
    pub email_exempt_auth_backends: Vec<String>,
    pub key_config: KeyConfig,
    pub code_expiry: Duration,
    pub token_expiry: Duration,
    pub websession_ttl: Duration,
    pub consent_lifetime: Option<Duration>,
    pub supported_ui_locales: Vec<String>,
    /// External credential validators for identity linkage, keyed by
    /// service name (e.g. the helmet library card endpoint).
    pub identity_validators: BTreeMap<String, Url>,
}

impl Default for IdmConfig {
    fn default() -> Self {
        IdmConfig {
            issuer: "https://localhost:8443".to_string(),
            trusted_email_domains: Vec::new(),
            trusted_loa_backends: Vec::new(),
            always_reauthenticate_backends: Vec::new(),
            restricted_authentication_backends: Vec::new(),
            restricted_authentication_timeout: Duration::from_secs(3600),
            email_exempt_auth_backends: vec!["suomifi".to_string()],
            key_config: KeyConfig::default(),
            code_expiry: Duration::from_secs(DEFAULT_CODE_EXPIRY_SECONDS),
            token_expiry: Duration::from_secs(DEFAULT_TOKEN_EXPIRY_SECONDS),
            websession_ttl: Duration::from_secs(14 * 86_400),
            consent_lifetime: None,
            supported_ui_locales: vec!["fi".to_string(), "sv".to_string(), "en".to_string()],
            identity_validators: BTreeMap::new(),
        }
    }
}

impl IdmConfig {
    pub fn backend_is_email_exempt(&self, provider_id: &str) -> bool {
        self.email_exempt_auth_backends
            .iter()
            .any(|b| b == provider_id)
    }

    pub fn backend_loa_trusted(&self, provider_id: &str) -> bool {
        self.trusted_loa_backends.iter().any(|b| b == provider_id)
    }

    pub fn backend_is_restricted(&self, provider_id: &str) -> bool {
        self.restricted_authentication_backends
            .iter()
            .any(|b| b == provider_id)
    }

    pub fn backend_always_reauthenticates(&self, provider_id: &str) -> bool {
        self.always_reauthenticate_backends
            .iter()
            .any(|b| b == provider_id)
    }

    pub fn email_domain_trusted(&self, email: &str) -> bool {
        match email.rsplit_once('@') {
            Some((_, domain)) => self
                .trusted_email_domains
                .iter()
                .any(|d| d.eq_ignore_ascii_case(domain)),
            None => false,
        }
    }
}

pub struct IdmServer {
    pub(crate) db: Db,
    pub(crate) config: IdmConfig,
    pub(crate) clients: ClientRegistry,
    pub(crate) upstreams: UpstreamRegistry,
    pub(crate) http: reqwest::Client,
    pub(crate) backchannel_http: reqwest::Client,
    /// Process-local secret for short-lived consent tickets. Regenerated at
    /// startup; pending consents do not survive a restart, which is fine.
    pub(crate) consent_secret: [u8; 32],
}

impl IdmServer {
    pub async fn new(
        db: Db,
        config: IdmConfig,
        upstreams: UpstreamRegistry,
    ) -> Result<Self, OperationError> {
        let mut consent_secret = [0u8; 32];
        thread_rng().fill(&mut consent_secret[..]);
        let idms = IdmServer {
            db,
            config,
            clients: ClientRegistry::default(),
            upstreams,
            http: upstream::http_client()?,
            backchannel_http: upstream::backchannel_client()?,
            consent_secret,
        };
        idms.reload_clients().await?;
        Ok(idms)
    }

    pub fn config(&self) -> &IdmConfig {
        &self.config
    }

    pub fn upstream(&self, provider_id: &str) -> Option<Arc<dyn UpstreamProvider>> {
        self.upstreams.get(provider_id)
    }

    pub fn client(&self, client_id: &str) -> Option<Arc<Client>> {
        self.clients.get(client_id)
    }

    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.clients.origin_allowed(origin)
    }

    /// Rebuild the in-memory client snapshot from the database.
    #[instrument(level = "debug", skip_all)]
    pub async fn reload_clients(&self) -> Result<(), OperationError> {
        let (clients, origins) = self
            .db
            .with_read(|txn| {
                let clients = clients::client_all(txn)?;
                let origins = clients::allowed_origins_all(txn)?;
                Ok((clients, origins))
            })
            .await?;
        self.clients.reload(clients, origins);
        Ok(())
    }

    /// Create or replace a client and republish the snapshot.
    pub async fn upsert_client(&self, client: Client) -> Result<(), OperationError> {
        self.db
            .with_write(move |txn| clients::client_upsert(txn, &client))
            .await?;
        self.reload_clients().await
    }

    pub async fn delete_client(&self, client_id: &str) -> Result<(), OperationError> {
        let client_id = client_id.to_string();
        self.db
            .with_write(move |txn| clients::client_delete(txn, &client_id))
            .await?;
        self.reload_clients().await
    }

    pub async fn login_methods(&self) -> Result<Vec<LoginMethod>, OperationError> {
        self.db.with_read(clients::login_methods_all).await
    }

    /// Create or update a login picker entry for a provider.
    pub async fn upsert_login_method(&self, method: LoginMethod) -> Result<(), OperationError> {
        self.db
            .with_write(move |txn| clients::login_method_upsert(txn, &method))
            .await
    }

    /// Advance the signing key lifecycle. Run at startup and on an interval.
    #[instrument(level = "info", skip_all)]
    pub async fn rotate_keys(&self, ct: Duration) -> Result<RotationOutcome, OperationError> {
        let cfg = self.config.key_config;
        self.db
            .with_write(move |txn| keys::key_rotate(txn, ct, &cfg))
            .await
    }

    /// Store an externally produced signing key. The next rotation adopts
    /// it, so it verifies existing tokens but never signs new ones.
    pub async fn import_signing_key(
        &self,
        pem: &str,
        ct: Duration,
    ) -> Result<String, OperationError> {
        let pem = pem.to_string();
        self.db
            .with_write(move |txn| keys::key_import(txn, ct, &pem))
            .await
    }

    /// Periodic cleanup of expired browser sessions and unredeemed
    /// authorisation codes.
    #[instrument(level = "debug", skip_all)]
    pub async fn purge_expired(&self, ct: Duration) -> Result<usize, OperationError> {
        self.db
            .with_write(move |txn| {
                let websessions = websession::websession_purge_expired(txn, ct)?;
                let codes = oauth2::code_purge_expired(txn, ct)?;
                if websessions + codes > 0 {
                    admin_info!(websessions, codes, "Purged expired records");
                }
                Ok(websessions + codes)
            })
            .await
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::idm::clients::{ClientOptions, ClientType};

    pub(crate) async fn test_idms() -> IdmServer {
        let db = Db::new(":memory:").expect("failed to open db");
        let mut config = IdmConfig {
            issuer: "https://sso.example.com".to_string(),
            ..Default::default()
        };
        config.key_config.bits = 2048;
        IdmServer::new(db, config, UpstreamRegistry::default())
            .await
            .expect("idms setup failed")
    }

    pub(crate) fn test_client(client_id: &str, redirect: &str) -> Client {
        Client {
            client_id: client_id.to_string(),
            client_secret: "s".to_string(),
            client_type: ClientType::Confidential,
            name: client_id.to_string(),
            response_types: ["code".to_string()].into_iter().collect(),
            redirect_uris: vec![Url::parse(redirect).expect("bad test uri")],
            post_logout_redirect_uris: Vec::new(),
            scope_allowlist: None,
            require_consent: false,
            options: ClientOptions::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_domain_trust() {
        let config = IdmConfig {
            trusted_email_domains: vec!["hel.fi".to_string()],
            ..Default::default()
        };
        assert!(config.email_domain_trusted("etunimi.sukunimi@Hel.Fi"));
        assert!(!config.email_domain_trusted("someone@gmail.com"));
        assert!(!config.email_domain_trusted("not-an-email"));
    }

    #[tokio::test]
    async fn test_client_snapshot_reload() {
        let idms = test_support::test_idms().await;
        assert!(idms.client("app").is_none());

        idms.upsert_client(test_support::test_client("app", "https://t/cb"))
            .await
            .expect("upsert failed");
        assert!(idms.client("app").is_some());
        assert!(idms.origin_allowed("https://t"));
        assert!(!idms.origin_allowed("https://elsewhere.example.com"));

        idms.delete_client("app").await.expect("delete failed");
        assert!(idms.client("app").is_none());
        assert!(!idms.origin_allowed("https://t"));
    }
}
