//! Stored user consent per (user, client).
//!
//! A grant unions the newly approved scopes into the existing row rather than
//! replacing them, so consenting to a narrower request never revokes scopes
//! approved earlier.

use rusqlite::{params, OptionalExtension, Transaction};

use crate::be::sqlite_err;
use crate::idm::oauth2::{scoped_bearer, Oauth2Error};
use crate::idm::server::IdmServer;
use crate::prelude::*;

#[derive(Debug, Clone)]
pub struct UserConsent {
    pub user_uuid: Uuid,
    pub client_id: String,
    pub scope: BTreeSet<String>,
    pub date_given: i64,
    pub expires_at: Option<i64>,
}

impl UserConsent {
    pub fn is_valid_at(&self, ct: Duration) -> bool {
        match self.expires_at {
            Some(exp) => (ct.as_secs() as i64) < exp,
            None => true,
        }
    }

    /// Whether this consent covers every requested scope.
    pub fn covers(&self, requested: &BTreeSet<String>) -> bool {
        requested.is_subset(&self.scope)
    }
}

impl IdmServer {
    /// List the caller's stored consents. Requires a bearer token with the
    /// `consents` scope.
    #[instrument(level = "debug", skip_all)]
    pub async fn consent_list(
        &self,
        access_token: &str,
        ct: Duration,
    ) -> Result<Vec<UserConsent>, Oauth2Error> {
        let access_token = access_token.to_string();
        self.db
            .with_read(move |txn| {
                let token = match scoped_bearer(txn, &access_token, OAUTH2_SCOPE_CONSENTS, ct)? {
                    Some(token) => token,
                    None => return Ok(Err(Oauth2Error::InvalidToken)),
                };
                Ok(Ok(consents_for_user(txn, token.user_uuid)?))
            })
            .await
            .map_err(Oauth2Error::ServerError)?
    }

    /// Revoke the caller's consent for one client.
    #[instrument(level = "debug", skip_all)]
    pub async fn consent_revoke_for(
        &self,
        access_token: &str,
        client_id: &str,
        ct: Duration,
    ) -> Result<(), Oauth2Error> {
        let access_token = access_token.to_string();
        let client_id = client_id.to_string();
        self.db
            .with_write(move |txn| {
                let token = match scoped_bearer(txn, &access_token, OAUTH2_SCOPE_CONSENTS, ct)? {
                    Some(token) => token,
                    None => return Ok(Err(Oauth2Error::InvalidToken)),
                };
                if !consent_revoke(txn, token.user_uuid, &client_id)? {
                    return Ok(Err(Oauth2Error::InvalidRequest));
                }
                security_info!(user = %token.user_uuid, client = %client_id, "Consent revoked");
                Ok(Ok(()))
            })
            .await
            .map_err(Oauth2Error::ServerError)?
    }
}

pub(crate) fn consent_get(
    txn: &Transaction,
    user_uuid: Uuid,
    client_id: &str,
) -> Result<Option<UserConsent>, OperationError> {
    txn.query_row(
        "SELECT scope, date_given, expires_at FROM user_consents
         WHERE user_uuid = ?1 AND client_id = ?2",
        params![user_uuid.to_string(), client_id],
        |row| {
            let scope: String = row.get(0)?;
            Ok(UserConsent {
                user_uuid,
                client_id: client_id.to_string(),
                scope: scope.split_whitespace().map(str::to_string).collect(),
                date_given: row.get(1)?,
                expires_at: row.get(2)?,
            })
        },
    )
    .optional()
    .map_err(sqlite_err)
}

/// Record a consent grant. Scopes union into any existing row, the grant
/// time and expiry are refreshed.
pub(crate) fn consent_grant(
    txn: &Transaction,
    user_uuid: Uuid,
    client_id: &str,
    scopes: &BTreeSet<String>,
    ct: Duration,
    lifetime: Option<Duration>,
) -> Result<(), OperationError> {
    let mut merged = scopes.clone();
    if let Some(existing) = consent_get(txn, user_uuid, client_id)? {
        merged.extend(existing.scope);
    }
    let scope_text = merged.into_iter().collect::<Vec<_>>().join(" ");
    let now = ct.as_secs() as i64;
    let expires_at = lifetime.map(|l| now + l.as_secs() as i64);
    txn.execute(
        "INSERT INTO user_consents (user_uuid, client_id, scope, date_given, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (user_uuid, client_id) DO UPDATE SET
            scope = excluded.scope,
            date_given = excluded.date_given,
            expires_at = excluded.expires_at",
        params![user_uuid.to_string(), client_id, scope_text, now, expires_at],
    )
    .map_err(sqlite_err)?;
    Ok(())
}

pub(crate) fn consent_revoke(
    txn: &Transaction,
    user_uuid: Uuid,
    client_id: &str,
) -> Result<bool, OperationError> {
    let n = txn
        .execute(
            "DELETE FROM user_consents WHERE user_uuid = ?1 AND client_id = ?2",
            params![user_uuid.to_string(), client_id],
        )
        .map_err(sqlite_err)?;
    Ok(n > 0)
}

pub(crate) fn consents_for_user(
    txn: &Transaction,
    user_uuid: Uuid,
) -> Result<Vec<UserConsent>, OperationError> {
    let mut stmt = txn
        .prepare(
            "SELECT client_id, scope, date_given, expires_at FROM user_consents
             WHERE user_uuid = ?1 ORDER BY client_id ASC",
        )
        .map_err(sqlite_err)?;
    let consents = stmt
        .query_map(params![user_uuid.to_string()], |row| {
            let scope: String = row.get(1)?;
            Ok(UserConsent {
                user_uuid,
                client_id: row.get(0)?,
                scope: scope.split_whitespace().map(str::to_string).collect(),
                date_given: row.get(2)?,
                expires_at: row.get(3)?,
            })
        })
        .map_err(sqlite_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sqlite_err)?;
    Ok(consents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::be::Db;
    use crate::idm::clients::{client_upsert, Client, ClientOptions, ClientType};
    use crate::idm::oauth2::{self, IssuedToken};
    use crate::idm::server::test_support::{test_client, test_idms};
    use crate::idm::session::{self, ElementKind, SessionData};
    use crate::idm::users::{user_upsert, User};

    fn scopes(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    async fn setup(db: &Db) -> Uuid {
        let mut user = User::new(Uuid::new_v4());
        user.email = "t@example.com".to_string();
        let uuid = user.uuid;
        db.with_write(move |txn| {
            user_upsert(txn, &user, Duration::from_secs(900))?;
            client_upsert(
                txn,
                &Client {
                    client_id: "app".to_string(),
                    client_secret: "s".to_string(),
                    client_type: ClientType::Confidential,
                    name: "app".to_string(),
                    response_types: BTreeSet::new(),
                    redirect_uris: Vec::new(),
                    post_logout_redirect_uris: Vec::new(),
                    scope_allowlist: None,
                    require_consent: true,
                    options: ClientOptions::default(),
                },
            )
        })
        .await
        .expect("setup failed");
        uuid
    }

    #[tokio::test]
    async fn test_consent_scope_union() {
        let db = Db::new(":memory:").expect("failed to open db");
        let uuid = setup(&db).await;
        let ct = Duration::from_secs(1000);

        db.with_write(move |txn| {
            consent_grant(txn, uuid, "app", &scopes(&["openid", "profile"]), ct, None)
        })
        .await
        .expect("grant failed");

        // A later, narrower grant must not shrink the stored set.
        db.with_write(move |txn| consent_grant(txn, uuid, "app", &scopes(&["email"]), ct, None))
            .await
            .expect("grant failed");

        let consent = db
            .with_read(move |txn| consent_get(txn, uuid, "app"))
            .await
            .expect("read failed")
            .expect("consent missing");
        assert_eq!(consent.scope, scopes(&["email", "openid", "profile"]));
        assert!(consent.covers(&scopes(&["openid", "email"])));
        assert!(!consent.covers(&scopes(&["openid", "devices"])));
    }

    #[tokio::test]
    async fn test_consent_expiry() {
        let db = Db::new(":memory:").expect("failed to open db");
        let uuid = setup(&db).await;
        let ct = Duration::from_secs(1000);

        db.with_write(move |txn| {
            consent_grant(
                txn,
                uuid,
                "app",
                &scopes(&["openid"]),
                ct,
                Some(Duration::from_secs(60)),
            )
        })
        .await
        .expect("grant failed");

        let consent = db
            .with_read(move |txn| consent_get(txn, uuid, "app"))
            .await
            .expect("read failed")
            .expect("consent missing");
        assert!(consent.is_valid_at(Duration::from_secs(1059)));
        assert!(!consent.is_valid_at(Duration::from_secs(1060)));

        assert!(db
            .with_write(move |txn| consent_revoke(txn, uuid, "app"))
            .await
            .expect("revoke failed"));
        assert!(db
            .with_read(move |txn| consent_get(txn, uuid, "app"))
            .await
            .expect("read failed")
            .is_none());
    }

    #[tokio::test]
    async fn test_consent_list_and_revoke_over_bearer() {
        const T0: Duration = Duration::from_secs(1_700_000_000);

        let idms = test_idms().await;
        idms.upsert_client(test_client("app", "https://rp.example.com/cb"))
            .await
            .expect("client setup failed");
        idms.upsert_client(test_client("other", "https://other.example.com/cb"))
            .await
            .expect("client setup failed");
        let (uuid, bearer) = idms
            .db
            .with_write(|txn| {
                let user = User::new(Uuid::new_v4());
                user_upsert(txn, &user, T0)?;
                let session = session::session_create(txn, user.uuid, &SessionData::default(), T0)?;
                let token = IssuedToken {
                    id: Uuid::new_v4(),
                    access_token: crate::utils::generate_opaque_token(),
                    refresh_token: None,
                    user_uuid: user.uuid,
                    client_id: "app".to_string(),
                    scope: [
                        OAUTH2_SCOPE_OPENID.to_string(),
                        OAUTH2_SCOPE_CONSENTS.to_string(),
                    ]
                    .into_iter()
                    .collect(),
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
                consent_grant(txn, user.uuid, "app", &scopes(&["openid"]), T0, None)?;
                consent_grant(txn, user.uuid, "other", &scopes(&["openid"]), T0, None)?;
                Ok((user.uuid, token.access_token))
            })
            .await
            .expect("seed failed");

        assert!(matches!(
            idms.consent_list("not-a-token", T0).await,
            Err(Oauth2Error::InvalidToken)
        ));

        let consents = idms.consent_list(&bearer, T0).await.expect("list failed");
        assert_eq!(consents.len(), 2);
        assert!(consents.iter().all(|c| c.user_uuid == uuid));

        idms.consent_revoke_for(&bearer, "other", T0)
            .await
            .expect("revoke failed");
        let consents = idms.consent_list(&bearer, T0).await.expect("list failed");
        assert_eq!(consents.len(), 1);
        assert_eq!(consents[0].client_id, "app");

        // Revoking a consent that does not exist is a client error.
        assert!(matches!(
            idms.consent_revoke_for(&bearer, "other", T0).await,
            Err(Oauth2Error::InvalidRequest)
        ));
    }
}
