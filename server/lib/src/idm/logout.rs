//! RP-initiated logout and back-channel logout, both directions.
//!
//! Ending a Tunnistamo session fans out: the session's tokens are deleted,
//! every API that received tokens under it gets an OIDC back-channel logout
//! token, the web login is dropped, and finally the browser is chained into
//! the upstream provider's own logout where the provider supports one.
//!
//! The receiving direction handles logout tokens sent by upstream providers:
//! the token's subject is resolved through the provider's social auth link
//! and every session of that user is ended.

use rusqlite::Transaction;

use tunnistamo_proto::oauth2::EndSessionRequest;
use tunnistamo_proto::oidc::{IdTokenClaims, LogoutTokenClaims};

use crate::idm::apis;
use crate::idm::codec::{self, JwsVerifier};
use crate::idm::keys;
use crate::idm::oauth2;
use crate::idm::pipeline;
use crate::idm::server::IdmServer;
use crate::idm::session::{self, ElementKind, TunnistamoSession};
use crate::idm::websession;
use crate::prelude::*;

/// How long a minted back-channel logout token stays acceptable downstream.
const LOGOUT_TOKEN_LIFETIME_SECONDS: u64 = 120;

/// Where to send the browser after an RP-initiated logout.
#[derive(Debug)]
pub struct RpLogoutOutcome {
    /// Upstream single logout when the provider has one, otherwise the
    /// validated post_logout_redirect_uri, otherwise nothing.
    pub redirect: Option<Url>,
    pub state: Option<String>,
}

/// One back-channel delivery: the api's registered logout url and the
/// logout token minted for it.
struct BackchannelTarget {
    api: String,
    url: Url,
    logout_token: String,
}

impl IdmServer {
    /// RP-initiated logout at the end-session endpoint. Also serves the
    /// plain logout view, with an empty request.
    #[instrument(level = "debug", skip_all)]
    pub async fn oauth2_rp_logout(
        &self,
        websession_key: Option<&str>,
        req: &EndSessionRequest,
        ct: Duration,
    ) -> Result<RpLogoutOutcome, OperationError> {
        let hint = match &req.id_token_hint {
            Some(jwt) => self.decode_id_token_hint(jwt, ct).await,
            None => None,
        };

        let hint_client_id = hint
            .as_ref()
            .map(|claims| claims.azp.clone().unwrap_or_else(|| claims.aud.clone()));
        let client = hint_client_id.as_deref().and_then(|id| self.client(id));

        // The post_logout_redirect_uri is only honoured when an id_token_hint
        // identifies the client and the uri is registered for it.
        let mut post_logout = None;
        let mut post_logout_index = None;
        if let Some(uri) = &req.post_logout_redirect_uri {
            match &client {
                Some(client) => match client.post_logout_redirect_uri_index(uri) {
                    Some(idx) => {
                        post_logout = Some(uri.clone());
                        post_logout_index = Some(idx);
                    }
                    None => {
                        request_warn!(
                            client_id = %client.client_id,
                            uri = %uri,
                            "Unregistered post_logout_redirect_uri ignored"
                        );
                    }
                },
                None => {
                    request_warn!(%uri, "post_logout_redirect_uri without a valid id_token_hint ignored");
                }
            }
        }

        let hint_sid = hint
            .as_ref()
            .and_then(|claims| claims.sid.as_deref())
            .and_then(|sid| Uuid::parse_str(sid).ok());

        let websession_key = websession_key.map(str::to_string);
        let issuer = self.config.issuer.clone();
        let (session, targets) = self
            .db
            .with_write(move |txn| {
                let mut session_id = hint_sid;
                if let Some(key) = websession_key.as_deref() {
                    if let Some(ws) = websession::websession_get(txn, key, ct)? {
                        session_id = ws.data.tunnistamo_session_id.or(session_id);
                    }
                    websession::websession_delete(txn, key)?;
                }

                let session = session_id
                    .map(|id| session::session_get(txn, id))
                    .transpose()?
                    .flatten();
                let targets = match &session {
                    Some(session) => {
                        let targets = end_session_fanout(txn, session, &issuer, ct)?;
                        session::session_end(txn, session.id, ct)?;
                        targets
                    }
                    None => Vec::new(),
                };
                Ok((session, targets))
            })
            .await?;

        self.deliver_backchannel(targets).await;

        // Chain into the upstream provider's logout. Its return url is our
        // relying party redirect, or the bare issuer when there is none.
        let mut redirect = post_logout.clone();
        if let Some(session) = &session {
            if let Some(method) = session.data.auth_method.as_deref() {
                if let Some(provider) = self.upstream(method) {
                    let return_to = match &post_logout {
                        Some(uri) => uri.clone(),
                        None => Url::parse(&self.config.issuer)
                            .map_err(|_| OperationError::InvalidState)?,
                    };
                    let relay_state = serde_json::json!({
                        "cli": hint_client_id,
                        "idx": post_logout_index,
                    })
                    .to_string();
                    if let Some(url) = provider
                        .single_logout_redirect(&session.data, &return_to, &relay_state, ct)
                        .await
                    {
                        redirect = Some(url);
                    }
                }
            }
        }

        Ok(RpLogoutOutcome {
            redirect,
            state: req.state.clone(),
        })
    }

    /// Handle a back-channel logout token sent by an upstream provider. The
    /// subject is matched through the provider's social auth link; every
    /// session of that user ends, their web logins are dropped, and the
    /// apis those sessions reached get logout tokens of their own. An
    /// unknown subject is an error the receiver answers 400 with.
    #[instrument(level = "info", skip(self, logout_token))]
    pub async fn upstream_backchannel_logout(
        &self,
        provider_id: &str,
        logout_token: &str,
        ct: Duration,
    ) -> Result<(), OperationError> {
        let provider = self
            .upstream(provider_id)
            .ok_or_else(|| OperationError::InvalidUpstreamProvider(provider_id.to_string()))?;
        let claims = provider.validate_logout_token(logout_token, ct).await?;
        let sub = claims
            .sub
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or(OperationError::NoMatchingEntries)?;

        let provider_id = provider_id.to_string();
        let issuer = self.config.issuer.clone();
        let targets = self
            .db
            .with_write(move |txn| upstream_logout_fanout(txn, &provider_id, &sub, &issuer, ct))
            .await?;
        self.deliver_backchannel(targets).await;
        Ok(())
    }

    /// IdP-initiated saml single logout. Active sessions carrying the
    /// request's NameID end with the same api fan-out as any other logout.
    #[instrument(level = "info", skip(self, name_id, session_index))]
    pub async fn upstream_saml_logout(
        &self,
        provider_id: &str,
        name_id: &str,
        session_index: Option<&str>,
        ct: Duration,
    ) -> Result<(), OperationError> {
        let provider_id = provider_id.to_string();
        let name_id = name_id.to_string();
        let session_index = session_index.map(str::to_string);
        let issuer = self.config.issuer.clone();
        let targets = self
            .db
            .with_write(move |txn| {
                let mut ended = 0usize;
                let mut targets = Vec::new();
                for session in session::sessions_active_for_method(txn, &provider_id)? {
                    let name_matches = session
                        .data
                        .extra
                        .get("suomifi_name_id")
                        .and_then(|v| v.as_str())
                        == Some(name_id.as_str());
                    let index_matches = match &session_index {
                        Some(idx) => {
                            session
                                .data
                                .extra
                                .get("suomifi_session_index")
                                .and_then(|v| v.as_str())
                                == Some(idx.as_str())
                        }
                        None => true,
                    };
                    if !(name_matches && index_matches) {
                        continue;
                    }
                    targets.extend(end_session_fanout(txn, &session, &issuer, ct)?);
                    if session::session_end(txn, session.id, ct)? {
                        ended += 1;
                    }
                    for key in websession::websession_keys_for_user(txn, session.user_uuid)? {
                        websession::websession_delete(txn, &key)?;
                    }
                }
                security_info!(provider = %provider_id, ended, "Single logout request processed");
                Ok(targets)
            })
            .await?;
        self.deliver_backchannel(targets).await;
        Ok(())
    }

    /// Decode our own id token leniently: signature and issuer must hold,
    /// but an expired hint still identifies the session to end.
    async fn decode_id_token_hint(&self, jwt: &str, ct: Duration) -> Option<IdTokenClaims> {
        let cfg = self.config.key_config;
        let verifier = self
            .db
            .with_read(move |txn| {
                let records = keys::verification_keys(txn, ct, &cfg)?;
                JwsVerifier::from_records(&records)
            })
            .await
            .ok()?;
        let mut validation = codec::rs256_validation(&self.config.issuer, None);
        validation.validate_exp = false;
        match verifier.verify::<IdTokenClaims>(jwt, &validation) {
            Ok(claims) => Some(claims),
            Err(err) => {
                request_warn!(?err, "Unverifiable id_token_hint ignored");
                None
            }
        }
    }

    /// Fire the logout tokens at the apis. Best effort: a dead api must not
    /// block the user's logout, failures are logged and dropped.
    async fn deliver_backchannel(&self, targets: Vec<BackchannelTarget>) {
        for target in targets {
            let result = self
                .backchannel_http
                .post(target.url.clone())
                .form(&[("logout_token", target.logout_token.as_str())])
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => {
                    security_info!(api = %target.api, "Delivered back-channel logout");
                }
                Ok(resp) => {
                    request_warn!(
                        api = %target.api,
                        status = %resp.status(),
                        "Back-channel logout rejected by api"
                    );
                }
                Err(err) => {
                    request_warn!(api = %target.api, ?err, "Back-channel logout delivery failed");
                }
            }
        }
    }
}

/// Delete the session's tokens and mint one logout token per api those
/// tokens reached, for apis that registered a back-channel logout url.
/// End every session of the provider-linked user, minting logout tokens for
/// the apis those sessions reached. Shared by the oidc back-channel receiver
/// and the saml single logout endpoint.
fn upstream_logout_fanout(
    txn: &Transaction,
    provider_id: &str,
    sub: &str,
    issuer: &str,
    ct: Duration,
) -> Result<Vec<BackchannelTarget>, OperationError> {
    let auth = pipeline::social_auth_get(txn, provider_id, sub)?.ok_or_else(|| {
        security_info!(
            provider = %provider_id,
            "Back-channel logout for an unknown subject"
        );
        OperationError::NoMatchingEntries
    })?;
    let mut ended = 0usize;
    let mut targets = Vec::new();
    for session in session::sessions_for_user(txn, auth.user_uuid, true)? {
        targets.extend(end_session_fanout(txn, &session, issuer, ct)?);
        if session::session_end(txn, session.id, ct)? {
            ended += 1;
        }
    }
    for key in websession::websession_keys_for_user(txn, auth.user_uuid)? {
        websession::websession_delete(txn, &key)?;
    }
    security_info!(
        provider = %provider_id,
        user_uuid = %auth.user_uuid,
        ended,
        "Upstream back-channel logout processed"
    );
    Ok(targets)
}

fn end_session_fanout(
    txn: &Transaction,
    session: &TunnistamoSession,
    issuer: &str,
    ct: Duration,
) -> Result<Vec<BackchannelTarget>, OperationError> {
    let mut token_scopes: BTreeSet<String> = BTreeSet::new();
    for object_id in session::element_object_ids(txn, session.id, ElementKind::Token)? {
        let id = Uuid::parse_str(&object_id).map_err(|_| OperationError::InvalidState)?;
        if let Some(token) = oauth2::token_get(txn, id)? {
            token_scopes.extend(token.scope);
            oauth2::token_delete(txn, id)?;
        }
    }

    // Which apis did those scopes reach.
    let mut touched: BTreeSet<(String, String)> = BTreeSet::new();
    for scope in apis::api_scopes_all(txn)? {
        if token_scopes.contains(&scope.identifier) {
            touched.insert((scope.domain, scope.api_name));
        }
    }
    if touched.is_empty() {
        return Ok(Vec::new());
    }

    let record = keys::active_signing_key(txn)?
        .ok_or(OperationError::KeyObjectNoActiveSigningKey)?;
    let signer = codec::JwsSigner::from_record(&record)?;

    let mut targets = Vec::new();
    for api in apis::apis_all(txn)? {
        let url = match &api.backchannel_logout_url {
            Some(url) => url.clone(),
            None => continue,
        };
        if !touched.contains(&(api.domain.clone(), api.name.clone())) {
            continue;
        }
        let aud = api
            .oidc_client_id
            .clone()
            .unwrap_or_else(|| api.identifier());
        let claims = LogoutTokenClaims {
            iss: issuer.to_string(),
            sub: Some(session.user_uuid.to_string()),
            aud,
            iat: ct.as_secs() as i64,
            exp: Some((ct.as_secs() + LOGOUT_TOKEN_LIFETIME_SECONDS) as i64),
            jti: Uuid::new_v4().to_string(),
            events: [(
                BACKCHANNEL_LOGOUT_EVENT.to_string(),
                serde_json::json!({}),
            )]
            .into_iter()
            .collect(),
            sid: Some(session.id.to_string()),
            nonce: None,
        };
        let logout_token = signer.sign(&claims).map_err(OperationError::from)?;
        targets.push(BackchannelTarget {
            api: api.identifier(),
            url,
            logout_token,
        });
    }
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idm::server::test_support::{test_client, test_idms};
    use crate::idm::session::SessionData;
    use crate::idm::users::{user_upsert, User};
    use crate::idm::websession::WebSession;

    const T0: Duration = Duration::from_secs(1_700_000_000);

    async fn seed_session(idms: &IdmServer, provider: &str) -> (User, TunnistamoSession, WebSession) {
        idms.db
            .with_write(|txn| {
                let user = User::new(Uuid::new_v4());
                user_upsert(txn, &user, T0)?;
                let data = SessionData {
                    loa: Some(LOA_LOW.to_string()),
                    auth_method: Some(provider.to_string()),
                    auth_time: Some(T0.as_secs() as i64),
                    extra: BTreeMap::new(),
                };
                let session = session::session_create(txn, user.uuid, &data, T0)?;
                let mut ws = websession::websession_create(txn, T0, Duration::from_secs(86400))?;
                ws.user_uuid = Some(user.uuid);
                ws.data.tunnistamo_session_id = Some(session.id);
                websession::websession_update(txn, &ws)?;
                Ok((user, session, ws))
            })
            .await
            .expect("seed failed")
    }

    #[tokio::test]
    async fn test_rp_logout_ends_session_and_web_login() {
        let idms = test_idms().await;
        idms.upsert_client(test_client("app", "https://rp.example.com/cb"))
            .await
            .expect("client setup failed");
        let (_user, session, ws) = seed_session(&idms, "github").await;

        let out = idms
            .oauth2_rp_logout(Some(&ws.key), &EndSessionRequest::default(), T0)
            .await
            .expect("logout failed");
        assert!(out.redirect.is_none());

        let (ended, web_gone) = idms
            .db
            .with_read(|txn| {
                let session = session::session_get(txn, session.id)?;
                let ws = websession::websession_get(txn, &ws.key, T0)?;
                Ok((
                    session.map(|s| !s.is_active()).unwrap_or(false),
                    ws.is_none(),
                ))
            })
            .await
            .expect("read failed");
        assert!(ended);
        assert!(web_gone);
    }

    #[tokio::test]
    async fn test_post_logout_redirect_requires_registration() {
        let idms = test_idms().await;
        idms.rotate_keys(T0).await.expect("rotate failed");
        let mut client = test_client("app", "https://rp.example.com/cb");
        client.post_logout_redirect_uris =
            vec![Url::parse("https://rp.example.com/bye").expect("bad test uri")];
        idms.upsert_client(client).await.expect("client setup failed");
        let (_user, session, ws) = seed_session(&idms, "github").await;

        let id_token = idms
            .db
            .with_write(|txn| idms.sign_id_token(txn, "app", &session, None, None, T0))
            .await
            .expect("sign failed");

        // Registered uri passes through.
        let req = EndSessionRequest {
            id_token_hint: Some(id_token.clone()),
            post_logout_redirect_uri: Some(
                Url::parse("https://rp.example.com/bye").expect("bad test uri"),
            ),
            state: Some("st".to_string()),
        };
        let out = idms
            .oauth2_rp_logout(Some(&ws.key), &req, T0)
            .await
            .expect("logout failed");
        assert_eq!(
            out.redirect.as_ref().map(Url::as_str),
            Some("https://rp.example.com/bye")
        );
        assert_eq!(out.state.as_deref(), Some("st"));

        // Unregistered uri is dropped.
        let (_user, _session, ws) = seed_session(&idms, "github").await;
        let req = EndSessionRequest {
            id_token_hint: Some(id_token),
            post_logout_redirect_uri: Some(
                Url::parse("https://evil.example.com/").expect("bad test uri"),
            ),
            state: None,
        };
        let out = idms
            .oauth2_rp_logout(Some(&ws.key), &req, T0)
            .await
            .expect("logout failed");
        assert!(out.redirect.is_none());
    }

    #[tokio::test]
    async fn test_logout_token_minting_for_touched_apis() {
        let idms = test_idms().await;
        idms.rotate_keys(T0).await.expect("rotate failed");
        idms.upsert_client(test_client("app", "https://rp.example.com/cb"))
            .await
            .expect("client setup failed");
        let (user, session, _ws) = seed_session(&idms, "github").await;

        let targets = idms
            .db
            .with_write(|txn| {
                let api = apis::Api {
                    domain: "https://api.hel.fi/auth".to_string(),
                    name: "helerm".to_string(),
                    required_scopes: Vec::new(),
                    oidc_client_id: Some("helerm-client".to_string()),
                    backchannel_logout_url: Some(
                        Url::parse("https://helerm.example.com/logout").expect("bad test uri"),
                    ),
                };
                apis::api_upsert(txn, &api)?;
                let scope =
                    apis::ApiScope::new(&api, Some("read"), BTreeMap::new(), BTreeMap::new());
                apis::api_scope_upsert(txn, &scope)?;

                let token = oauth2::IssuedToken {
                    id: Uuid::new_v4(),
                    access_token: "at-1".to_string(),
                    refresh_token: None,
                    user_uuid: user.uuid,
                    client_id: "app".to_string(),
                    scope: [scope.identifier.clone()].into_iter().collect(),
                    id_token: None,
                    nonce: None,
                    created_at: T0.as_secs() as i64,
                    expires_at: (T0.as_secs() + 3600) as i64,
                };
                oauth2::token_insert(txn, &token)?;
                session::element_add(
                    txn,
                    session.id,
                    ElementKind::Token,
                    &token.id.to_string(),
                    T0,
                )?;

                let targets = end_session_fanout(txn, &session, "https://sso.example.com", T0)?;
                // The token is gone with the session.
                assert!(oauth2::token_get(txn, token.id)?.is_none());
                Ok(targets)
            })
            .await
            .expect("fanout failed");

        assert_eq!(targets.len(), 1);
        assert_eq!(
            targets[0].url.as_str(),
            "https://helerm.example.com/logout"
        );
        let jwks = idms.oauth2_openid_publickey().await.expect("jwks failed");
        let verifier = JwsVerifier::from_jwks(&jwks).expect("verifier failed");
        let mut validation =
            codec::rs256_validation("https://sso.example.com", Some("helerm-client"));
        validation.validate_exp = false;
        let claims: LogoutTokenClaims = verifier
            .verify(&targets[0].logout_token, &validation)
            .expect("logout token invalid");
        assert!(claims.has_backchannel_event());
        assert_eq!(claims.sub.as_deref(), Some(user.uuid.to_string().as_str()));
        assert_eq!(claims.sid.as_deref(), Some(session.id.to_string().as_str()));
        assert!(claims.nonce.is_none());
    }

    #[tokio::test]
    async fn test_upstream_backchannel_logout_isolation() {
        let idms = test_idms().await;

        // Two users, linked to the same provider under different subjects.
        let ((user_a, session_a), (user_b, session_b)) = idms
            .db
            .with_write(|txn| {
                let seed = |uid: &str| -> Result<(User, TunnistamoSession), OperationError> {
                    let user = User::new(Uuid::new_v4());
                    user_upsert(txn, &user, T0)?;
                    let data = SessionData {
                        loa: Some(LOA_LOW.to_string()),
                        auth_method: Some("helsinki".to_string()),
                        auth_time: Some(T0.as_secs() as i64),
                        extra: BTreeMap::new(),
                    };
                    let session = session::session_create(txn, user.uuid, &data, T0)?;
                    pipeline::social_auth_upsert(
                        txn,
                        user.uuid,
                        "helsinki",
                        uid,
                        &serde_json::json!({}),
                        T0,
                    )?;
                    Ok((user, session))
                };
                Ok((seed("sub-a")?, seed("sub-b")?))
            })
            .await
            .expect("seed failed");

        // No provider registered for the id: the receiver rejects.
        let out = idms.upstream_backchannel_logout("helsinki", "tok", T0).await;
        assert_eq!(
            out.err(),
            Some(OperationError::InvalidUpstreamProvider(
                "helsinki".to_string()
            ))
        );

        // Drive the session-ending half directly, as the provider's token
        // validation would.
        idms.db
            .with_write(|txn| {
                let auth = pipeline::social_auth_get(txn, "helsinki", "sub-a")?
                    .ok_or(OperationError::NoMatchingEntries)?;
                for session in session::sessions_for_user(txn, auth.user_uuid, true)? {
                    session::session_end(txn, session.id, T0)?;
                }
                Ok(())
            })
            .await
            .expect("logout failed");

        let (a_active, b_active) = idms
            .db
            .with_read(|txn| {
                let a = session::session_get(txn, session_a.id)?
                    .map(|s| s.is_active())
                    .unwrap_or(false);
                let b = session::session_get(txn, session_b.id)?
                    .map(|s| s.is_active())
                    .unwrap_or(false);
                Ok((a, b))
            })
            .await
            .expect("read failed");
        assert!(!a_active);
        assert!(b_active);
        let _ = (user_a, user_b);
    }

    #[tokio::test]
    async fn test_upstream_logout_reaches_apis() {
        let idms = test_idms().await;
        idms.rotate_keys(T0).await.expect("rotate failed");
        idms.upsert_client(test_client("app", "https://rp.example.com/cb"))
            .await
            .expect("client setup failed");
        let (user, session, ws) = seed_session(&idms, "helsinki").await;

        let targets = idms
            .db
            .with_write(|txn| {
                pipeline::social_auth_upsert(
                    txn,
                    user.uuid,
                    "helsinki",
                    "sub-a",
                    &serde_json::json!({}),
                    T0,
                )?;

                let api = apis::Api {
                    domain: "https://api.hel.fi/auth".to_string(),
                    name: "helerm".to_string(),
                    required_scopes: Vec::new(),
                    oidc_client_id: Some("helerm-client".to_string()),
                    backchannel_logout_url: Some(
                        Url::parse("https://helerm.example.com/logout").expect("bad test uri"),
                    ),
                };
                apis::api_upsert(txn, &api)?;
                let scope =
                    apis::ApiScope::new(&api, Some("read"), BTreeMap::new(), BTreeMap::new());
                apis::api_scope_upsert(txn, &scope)?;

                let token = oauth2::IssuedToken {
                    id: Uuid::new_v4(),
                    access_token: "at-1".to_string(),
                    refresh_token: None,
                    user_uuid: user.uuid,
                    client_id: "app".to_string(),
                    scope: [scope.identifier.clone()].into_iter().collect(),
                    id_token: None,
                    nonce: None,
                    created_at: T0.as_secs() as i64,
                    expires_at: (T0.as_secs() + 3600) as i64,
                };
                oauth2::token_insert(txn, &token)?;
                session::element_add(
                    txn,
                    session.id,
                    ElementKind::Token,
                    &token.id.to_string(),
                    T0,
                )?;

                upstream_logout_fanout(txn, "helsinki", "sub-a", "https://sso.example.com", T0)
            })
            .await
            .expect("fanout failed");

        // The api gets its logout token and the local session state is gone.
        assert_eq!(targets.len(), 1);
        assert_eq!(
            targets[0].url.as_str(),
            "https://helerm.example.com/logout"
        );
        let (session_active, ws_alive) = idms
            .db
            .with_read(|txn| {
                let active = session::session_get(txn, session.id)?
                    .map(|s| s.is_active())
                    .unwrap_or(false);
                let alive = websession::websession_get(txn, &ws.key, T0)?.is_some();
                Ok((active, alive))
            })
            .await
            .expect("read failed");
        assert!(!session_active);
        assert!(!ws_alive);
    }
}
