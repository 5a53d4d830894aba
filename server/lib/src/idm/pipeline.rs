//! The login pipeline: everything that happens between a verified upstream
//! callback and an authenticated web session.
//!
//! Stage order is fixed: resolve the local uuid, require an email unless the
//! backend is exempt, associate by email collision, create or update the
//! user, open a fresh tunnistamo session (ending the one the browser held),
//! record the social auth as a session element.

use rusqlite::{params, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};

use crate::be::{from_json_text, sqlite_err, to_json_text};
use crate::idm::server::IdmServer;
use crate::idm::session::{self, ElementKind, SessionData, TunnistamoSession};
use crate::idm::upstream::CleanedAttributes;
use crate::idm::users::{self, User};
use crate::idm::websession;
use crate::prelude::*;

/// One upstream identity linked to a local user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocialAuth {
    pub id: Uuid,
    pub user_uuid: Uuid,
    pub provider: String,
    pub uid: String,
    pub extra_data: serde_json::Value,
    pub created_at: i64,
}

pub(crate) fn social_auth_get(
    txn: &Transaction,
    provider: &str,
    uid: &str,
) -> Result<Option<SocialAuth>, OperationError> {
    let maybe = txn
        .query_row(
            "SELECT id, user_uuid, provider, uid, extra_data, created_at FROM social_auths
             WHERE provider = ?1 AND uid = ?2",
            params![provider, uid],
            row_to_social_auth,
        )
        .optional()
        .map_err(sqlite_err)?;
    maybe.map(finish_social_auth).transpose()
}

fn row_to_social_auth(row: &rusqlite::Row) -> rusqlite::Result<(SocialAuth, String)> {
    let id: String = row.get(0)?;
    let user_uuid: String = row.get(1)?;
    let extra: String = row.get(4)?;
    Ok((
        SocialAuth {
            id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
            user_uuid: Uuid::parse_str(&user_uuid).unwrap_or_else(|_| Uuid::nil()),
            provider: row.get(2)?,
            uid: row.get(3)?,
            extra_data: serde_json::Value::Null,
            created_at: row.get(5)?,
        },
        extra,
    ))
}

fn finish_social_auth(parts: (SocialAuth, String)) -> Result<SocialAuth, OperationError> {
    let (mut auth, extra) = parts;
    auth.extra_data = from_json_text(&extra)?;
    Ok(auth)
}

pub(crate) fn social_auths_for_user(
    txn: &Transaction,
    user_uuid: Uuid,
) -> Result<Vec<SocialAuth>, OperationError> {
    let mut stmt = txn
        .prepare(
            "SELECT id, user_uuid, provider, uid, extra_data, created_at FROM social_auths
             WHERE user_uuid = ?1 ORDER BY created_at DESC",
        )
        .map_err(sqlite_err)?;
    let parts = stmt
        .query_map(params![user_uuid.to_string()], row_to_social_auth)
        .map_err(sqlite_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sqlite_err)?;
    parts.into_iter().map(finish_social_auth).collect()
}

pub(crate) fn social_auth_upsert(
    txn: &Transaction,
    user_uuid: Uuid,
    provider: &str,
    uid: &str,
    extra_data: &serde_json::Value,
    ct: Duration,
) -> Result<SocialAuth, OperationError> {
    if let Some(mut existing) = social_auth_get(txn, provider, uid)? {
        txn.execute(
            "UPDATE social_auths SET extra_data = ?1 WHERE id = ?2",
            params![to_json_text(extra_data)?, existing.id.to_string()],
        )
        .map_err(sqlite_err)?;
        existing.extra_data = extra_data.clone();
        return Ok(existing);
    }
    let auth = SocialAuth {
        id: Uuid::new_v4(),
        user_uuid,
        provider: provider.to_string(),
        uid: uid.to_string(),
        extra_data: extra_data.clone(),
        created_at: ct.as_secs() as i64,
    };
    txn.execute(
        "INSERT INTO social_auths (id, user_uuid, provider, uid, extra_data, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            auth.id.to_string(),
            user_uuid.to_string(),
            provider,
            uid,
            to_json_text(&auth.extra_data)?,
            auth.created_at
        ],
    )
    .map_err(sqlite_err)?;
    Ok(auth)
}

fn user_social_auth_count(txn: &Transaction, user_uuid: Uuid) -> Result<i64, OperationError> {
    txn.query_row(
        "SELECT COUNT(*) FROM social_auths WHERE user_uuid = ?1",
        params![user_uuid.to_string()],
        |row| row.get(0),
    )
    .map_err(sqlite_err)
}

#[derive(Debug)]
pub enum LoginOutcome {
    Complete {
        user: User,
        session: TunnistamoSession,
    },
    /// The backend yielded no email and is not exempt. The core layer
    /// renders the email-needed page with a re-auth link carrying these
    /// extra parameters.
    EmailRequired {
        reauth_params: Vec<(String, String)>,
    },
}

impl IdmServer {
    /// Run the post-callback pipeline for one upstream login.
    ///
    /// `websession_key` is the browser session; its prior tunnistamo
    /// session ends and the new one is bound to it atomically.
    #[instrument(level = "debug", skip_all, fields(provider = %provider_id))]
    pub async fn complete_upstream_login(
        &self,
        provider_id: &str,
        attrs: CleanedAttributes,
        websession_key: &str,
        ct: Duration,
    ) -> Result<LoginOutcome, OperationError> {
        if attrs.uid.is_empty() {
            return Err(OperationError::InvalidState);
        }

        if attrs.email.as_deref().map(str::is_empty).unwrap_or(true)
            && !self.config.backend_is_email_exempt(provider_id)
        {
            let reauth_params = self
                .upstream(provider_id)
                .map(|p| p.reauth_params())
                .unwrap_or_default();
            security_info!(%provider_id, "Login without email, interrupting for re-request");
            return Ok(LoginOutcome::EmailRequired { reauth_params });
        }

        let provider_id = provider_id.to_string();
        let config = self.config.clone();
        let websession_key = websession_key.to_string();
        self.db
            .with_write(move |txn| {
                // Resolve the local uuid: existing link wins, then the
                // adapter's derivation, then a fresh time-based uuid.
                let existing_link = social_auth_get(txn, &provider_id, &attrs.uid)?;
                let mut user_uuid = match &existing_link {
                    Some(link) => link.user_uuid,
                    None => attrs
                        .uuid_hint
                        .unwrap_or_else(|| Uuid::now_v1(&[0, 0, 0, 0, 0, 0])),
                };

                // Email collision: attach to the existing user only when the
                // domain is trusted or that user has no upstream link yet.
                if existing_link.is_none() {
                    if let Some(email) = attrs.email.as_deref() {
                        if let Some(collided) = users::user_get_by_email(txn, email)? {
                            if collided.uuid != user_uuid {
                                let allowed = config.email_domain_trusted(email)
                                    || user_social_auth_count(txn, collided.uuid)? == 0;
                                if allowed {
                                    security_info!(
                                        %email,
                                        "Associating upstream login with existing user by email"
                                    );
                                    user_uuid = collided.uuid;
                                } else {
                                    security_error!(
                                        %email,
                                        "Email already in use by another linked user"
                                    );
                                    return Err(OperationError::AccessDenied);
                                }
                            }
                        }
                    }
                }

                let mut user = users::user_get(txn, user_uuid)?
                    .unwrap_or_else(|| User::new(user_uuid));
                if let Some(email) = attrs.email.clone() {
                    user.email = email;
                }
                if let Some(first_name) = attrs.first_name.clone() {
                    user.first_name = first_name;
                }
                if let Some(last_name) = attrs.last_name.clone() {
                    user.last_name = last_name;
                }
                if attrs.primary_sid.is_some() {
                    user.primary_sid = attrs.primary_sid.clone();
                }
                users::user_upsert(txn, &user, ct)?;
                if let Some(ad_groups) = attrs.ad_groups.clone() {
                    users::update_ad_groups(txn, user_uuid, &ad_groups.into_iter().collect())?;
                    if let Some(refreshed) = users::user_get(txn, user_uuid)? {
                        user = refreshed;
                    }
                }

                // A browser gets exactly one live tunnistamo session.
                let websession = websession::websession_get(txn, &websession_key, ct)?;
                if let Some(previous) = websession
                    .as_ref()
                    .and_then(|ws| ws.data.tunnistamo_session_id)
                {
                    session::session_end(txn, previous, ct)?;
                }

                let loa = if config.backend_loa_trusted(&provider_id) {
                    attrs.loa.clone().unwrap_or_else(|| LOA_LOW.to_string())
                } else {
                    LOA_LOW.to_string()
                };
                // Adapter extras (the saml NameID and session index among
                // them) ride on the session for single logout later.
                let data = SessionData {
                    loa: Some(loa),
                    auth_method: Some(provider_id.clone()),
                    auth_time: Some(ct.as_secs() as i64),
                    extra: attrs.extra.clone(),
                };
                let tsession = session::session_create(txn, user_uuid, &data, ct)?;

                let mut extra_map = attrs.extra.clone();
                if let Some(login) = &attrs.github_username {
                    extra_map.insert(
                        OAUTH2_SCOPE_GITHUB_USERNAME.to_string(),
                        serde_json::Value::String(login.clone()),
                    );
                }
                let extra_data =
                    serde_json::to_value(&extra_map).map_err(|_| OperationError::SerdeJsonError)?;
                let auth = social_auth_upsert(
                    txn,
                    user_uuid,
                    &provider_id,
                    &attrs.uid,
                    &extra_data,
                    ct,
                )?;
                session::element_add(
                    txn,
                    tsession.id,
                    ElementKind::SocialAuth,
                    &auth.id.to_string(),
                    ct,
                )?;

                if let Some(mut websession) = websession {
                    websession.user_uuid = Some(user_uuid);
                    websession.data.tunnistamo_session_id = Some(tsession.id);
                    websession.data.upstream = None;
                    websession::websession_update(txn, &websession)?;
                }

                security_access!(
                    %user_uuid,
                    session_id = %tsession.id,
                    provider = %provider_id,
                    "Login complete"
                );
                Ok(LoginOutcome::Complete {
                    user,
                    session: tsession,
                })
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idm::server::test_support::test_idms;

    fn attrs(uid: &str, email: Option<&str>) -> CleanedAttributes {
        CleanedAttributes {
            uid: uid.to_string(),
            email: email.map(str::to_string),
            first_name: Some("Test".to_string()),
            last_name: Some("User".to_string()),
            ..Default::default()
        }
    }

    async fn websession_key(idms: &IdmServer, ct: Duration) -> String {
        let ttl = idms.config.websession_ttl;
        idms.db
            .with_write(move |txn| websession::websession_create(txn, ct, ttl))
            .await
            .expect("websession failed")
            .key
    }

    #[tokio::test]
    async fn test_uuid_stable_across_logins() {
        let idms = test_idms().await;
        let ct = Duration::from_secs(1000);
        let ws = websession_key(&idms, ct).await;

        let first = idms
            .complete_upstream_login("github", attrs("42", Some("a@example.com")), &ws, ct)
            .await
            .expect("login failed");
        let LoginOutcome::Complete { user: u1, session: s1 } = first else {
            panic!("expected a completed login");
        };
        assert_eq!(u1.username, users::uuid_to_username(&u1.uuid));

        let second = idms
            .complete_upstream_login(
                "github",
                attrs("42", Some("a@example.com")),
                &ws,
                Duration::from_secs(2000),
            )
            .await
            .expect("login failed");
        let LoginOutcome::Complete { user: u2, session: s2 } = second else {
            panic!("expected a completed login");
        };
        assert_eq!(u1.uuid, u2.uuid);
        assert_ne!(s1.id, s2.id);

        // The browser's first session ended when the second login landed.
        let s1_id = s1.id;
        let reloaded = idms
            .db
            .with_read(move |txn| session::session_get(txn, s1_id))
            .await
            .expect("read failed")
            .expect("session missing");
        assert!(!reloaded.is_active());
    }

    #[tokio::test]
    async fn test_email_required_unless_exempt() {
        let idms = test_idms().await;
        let ct = Duration::from_secs(1000);
        let ws = websession_key(&idms, ct).await;

        let outcome = idms
            .complete_upstream_login("facebook", attrs("fb-1", None), &ws, ct)
            .await
            .expect("pipeline failed");
        assert!(matches!(outcome, LoginOutcome::EmailRequired { .. }));

        // suomifi is exempt by default configuration.
        let outcome = idms
            .complete_upstream_login("suomifi", attrs("e-1", None), &ws, ct)
            .await
            .expect("pipeline failed");
        assert!(matches!(outcome, LoginOutcome::Complete { .. }));
    }

    #[tokio::test]
    async fn test_email_collision_rules() {
        let mut idms = test_idms().await;
        idms.config.trusted_email_domains = vec!["hel.fi".to_string()];
        let ct = Duration::from_secs(1000);

        // First user arrives through github.
        let ws = websession_key(&idms, ct).await;
        let LoginOutcome::Complete { user: u1, .. } = idms
            .complete_upstream_login("github", attrs("gh-1", Some("x@hel.fi")), &ws, ct)
            .await
            .expect("login failed")
        else {
            panic!("expected a completed login");
        };

        // Same trusted-domain email through another backend attaches to the
        // same user.
        let ws = websession_key(&idms, ct).await;
        let LoginOutcome::Complete { user: u2, .. } = idms
            .complete_upstream_login("google", attrs("g-1", Some("x@hel.fi")), &ws, ct)
            .await
            .expect("login failed")
        else {
            panic!("expected a completed login");
        };
        assert_eq!(u1.uuid, u2.uuid);

        // An untrusted-domain collision with a linked user is rejected.
        let ws = websession_key(&idms, ct).await;
        let LoginOutcome::Complete { .. } = idms
            .complete_upstream_login("github", attrs("gh-2", Some("y@gmail.com")), &ws, ct)
            .await
            .expect("login failed")
        else {
            panic!("expected a completed login");
        };
        let ws = websession_key(&idms, ct).await;
        let denied = idms
            .complete_upstream_login("google", attrs("g-2", Some("y@gmail.com")), &ws, ct)
            .await;
        assert!(matches!(denied, Err(OperationError::AccessDenied)));
    }

    #[tokio::test]
    async fn test_loa_trust_enforcement() {
        let mut idms = test_idms().await;
        idms.config.trusted_loa_backends = vec!["helsinki_tunnistus".to_string()];
        let ct = Duration::from_secs(1000);

        let mut upstream_attrs = attrs("kc-1", Some("kc@example.com"));
        upstream_attrs.loa = Some(LOA_SUBSTANTIAL.to_string());
        let ws = websession_key(&idms, ct).await;
        let LoginOutcome::Complete { session, .. } = idms
            .complete_upstream_login("helsinki_tunnistus", upstream_attrs.clone(), &ws, ct)
            .await
            .expect("login failed")
        else {
            panic!("expected a completed login");
        };
        assert_eq!(session.data.loa.as_deref(), Some(LOA_SUBSTANTIAL));

        // Same claim through an untrusted backend is forced low.
        upstream_attrs.uid = "kc-2".to_string();
        upstream_attrs.email = Some("kc2@example.com".to_string());
        let ws = websession_key(&idms, ct).await;
        let LoginOutcome::Complete { session, .. } = idms
            .complete_upstream_login("other_keycloak", upstream_attrs, &ws, ct)
            .await
            .expect("login failed")
        else {
            panic!("expected a completed login");
        };
        assert_eq!(session.data.loa.as_deref(), Some(LOA_LOW));
    }
}
