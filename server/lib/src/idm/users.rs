//! Local user accounts. Users are only ever created by the login pipeline
//! after a successful upstream authentication; there is no local credential
//! material, and the core never deletes a user.

use rusqlite::{params, OptionalExtension, Transaction};

use tunnistamo_proto::oauth2::UserLoginEntryView;

use crate::be::sqlite_err;
use crate::idm::oauth2::{scoped_bearer, Oauth2Error};
use crate::idm::server::IdmServer;
use crate::prelude::*;
use crate::utils::base32_nopad_lower;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub uuid: Uuid,
    /// Always `uuid_to_username(uuid)` by construction.
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub primary_sid: Option<String>,
    pub ad_groups: BTreeSet<String>,
}

impl User {
    pub fn new(uuid: Uuid) -> Self {
        User {
            uuid,
            username: uuid_to_username(&uuid),
            email: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            primary_sid: None,
            ad_groups: BTreeSet::new(),
        }
    }

    /// The display name composed for userinfo and consent pages.
    pub fn full_name(&self) -> String {
        let full = format!("{} {}", self.first_name, self.last_name);
        full.trim().to_string()
    }
}

/// The stable, derivable username for a user uuid: `u-` followed by the
/// unpadded lowercase base32 of the uuid bytes.
pub fn uuid_to_username(uuid: &Uuid) -> String {
    format!("u-{}", base32_nopad_lower(uuid.as_bytes()))
}

fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
    let uuid_text: String = row.get(0)?;
    Ok(User {
        uuid: Uuid::parse_str(&uuid_text).unwrap_or_else(|_| Uuid::nil()),
        username: row.get(1)?,
        email: row.get(2)?,
        first_name: row.get(3)?,
        last_name: row.get(4)?,
        primary_sid: row.get(5)?,
        ad_groups: BTreeSet::new(),
    })
}

const USER_COLS: &str = "uuid, username, email, first_name, last_name, primary_sid";

fn load_ad_groups(txn: &Transaction, user: &mut User) -> Result<(), OperationError> {
    let mut stmt = txn
        .prepare("SELECT group_name FROM user_ad_groups WHERE user_uuid = ?1")
        .map_err(sqlite_err)?;
    let names = stmt
        .query_map(params![user.uuid.to_string()], |row| row.get::<_, String>(0))
        .map_err(sqlite_err)?
        .collect::<Result<BTreeSet<_>, _>>()
        .map_err(sqlite_err)?;
    user.ad_groups = names;
    Ok(())
}

pub(crate) fn user_get(txn: &Transaction, uuid: Uuid) -> Result<Option<User>, OperationError> {
    let maybe = txn
        .query_row(
            &format!("SELECT {USER_COLS} FROM users WHERE uuid = ?1"),
            params![uuid.to_string()],
            row_to_user,
        )
        .optional()
        .map_err(sqlite_err)?;
    match maybe {
        Some(mut user) => {
            load_ad_groups(txn, &mut user)?;
            Ok(Some(user))
        }
        None => Ok(None),
    }
}

/// Case insensitive email lookup, used by the associate_by_email stage.
pub(crate) fn user_get_by_email(
    txn: &Transaction,
    email: &str,
) -> Result<Option<User>, OperationError> {
    let maybe = txn
        .query_row(
            &format!("SELECT {USER_COLS} FROM users WHERE email = ?1 COLLATE NOCASE AND email != ''"),
            params![email],
            row_to_user,
        )
        .optional()
        .map_err(sqlite_err)?;
    match maybe {
        Some(mut user) => {
            load_ad_groups(txn, &mut user)?;
            Ok(Some(user))
        }
        None => Ok(None),
    }
}

pub(crate) fn user_upsert(
    txn: &Transaction,
    user: &User,
    ct: Duration,
) -> Result<(), OperationError> {
    txn.execute(
        "INSERT INTO users (uuid, username, email, first_name, last_name, primary_sid, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (uuid) DO UPDATE SET
            email = excluded.email,
            first_name = excluded.first_name,
            last_name = excluded.last_name,
            primary_sid = excluded.primary_sid",
        params![
            user.uuid.to_string(),
            user.username,
            user.email,
            user.first_name,
            user.last_name,
            user.primary_sid,
            ct.as_secs() as i64,
        ],
    )
    .map_err(sqlite_err)?;
    Ok(())
}

/// Reconcile the user's AD group memberships against an upstream-provided
/// set. Group names are stored lower-cased; empty names are discarded. The
/// caller holds the write transaction, which serialises concurrent logins of
/// the same user.
pub(crate) fn update_ad_groups(
    txn: &Transaction,
    user_uuid: Uuid,
    group_names: &BTreeSet<String>,
) -> Result<(), OperationError> {
    let wanted: BTreeSet<String> = group_names
        .iter()
        .map(|name| name.trim().to_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in &wanted {
        txn.execute(
            "INSERT OR IGNORE INTO ad_groups (name) VALUES (?1)",
            params![name],
        )
        .map_err(sqlite_err)?;
        txn.execute(
            "INSERT OR IGNORE INTO user_ad_groups (user_uuid, group_name) VALUES (?1, ?2)",
            params![user_uuid.to_string(), name],
        )
        .map_err(sqlite_err)?;
    }

    // Remove memberships the upstream no longer asserts.
    let mut stmt = txn
        .prepare("SELECT group_name FROM user_ad_groups WHERE user_uuid = ?1")
        .map_err(sqlite_err)?;
    let current = stmt
        .query_map(params![user_uuid.to_string()], |row| {
            row.get::<_, String>(0)
        })
        .map_err(sqlite_err)?
        .collect::<Result<BTreeSet<_>, _>>()
        .map_err(sqlite_err)?;
    drop(stmt);

    for stale in current.difference(&wanted) {
        txn.execute(
            "DELETE FROM user_ad_groups WHERE user_uuid = ?1 AND group_name = ?2",
            params![user_uuid.to_string(), stale],
        )
        .map_err(sqlite_err)?;
    }

    Ok(())
}

impl IdmServer {
    /// Record a completed login against a service in the audit trail. Called
    /// by the HTTP layer once an upstream login completes, since the client
    /// address only exists there.
    #[instrument(level = "debug", skip_all)]
    pub async fn record_login_entry(
        &self,
        user_uuid: Uuid,
        service: &str,
        ip_address: Option<String>,
        ct: Duration,
    ) -> Result<(), OperationError> {
        let service = service.to_string();
        self.db
            .with_write(move |txn| {
                login_entry_insert(txn, user_uuid, &service, ip_address.as_deref(), ct)
            })
            .await
    }

    /// List the caller's login history. Requires a bearer token with the
    /// `login_entries` scope.
    #[instrument(level = "debug", skip_all)]
    pub async fn login_entry_list(
        &self,
        access_token: &str,
        ct: Duration,
    ) -> Result<Vec<UserLoginEntryView>, Oauth2Error> {
        let access_token = access_token.to_string();
        self.db
            .with_read(move |txn| {
                let token =
                    match scoped_bearer(txn, &access_token, OAUTH2_SCOPE_LOGIN_ENTRIES, ct)? {
                        Some(token) => token,
                        None => return Ok(Err(Oauth2Error::InvalidToken)),
                    };
                Ok(Ok(login_entries_for_user(txn, token.user_uuid)?))
            })
            .await
            .map_err(Oauth2Error::ServerError)?
    }
}

/// Record a completed login against a service for the audit trail.
pub(crate) fn login_entry_insert(
    txn: &Transaction,
    user_uuid: Uuid,
    service: &str,
    ip_address: Option<&str>,
    ct: Duration,
) -> Result<(), OperationError> {
    txn.execute(
        "INSERT INTO user_login_entries (user_uuid, service, timestamp, ip_address)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            user_uuid.to_string(),
            service,
            ct.as_secs() as i64,
            ip_address
        ],
    )
    .map_err(sqlite_err)?;
    Ok(())
}

pub(crate) fn login_entries_for_user(
    txn: &Transaction,
    user_uuid: Uuid,
) -> Result<Vec<UserLoginEntryView>, OperationError> {
    let mut stmt = txn
        .prepare(
            "SELECT service, timestamp, ip_address, geo_location
             FROM user_login_entries WHERE user_uuid = ?1
             ORDER BY timestamp DESC",
        )
        .map_err(sqlite_err)?;
    let rows = stmt
        .query_map(params![user_uuid.to_string()], |row| {
            let ts: i64 = row.get(1)?;
            Ok(UserLoginEntryView {
                service: row.get(0)?,
                timestamp: OffsetDateTime::from_unix_timestamp(ts)
                    .unwrap_or(OffsetDateTime::UNIX_EPOCH),
                ip_address: row.get(2)?,
                geo_location: row.get(3)?,
            })
        })
        .map_err(sqlite_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sqlite_err)?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::be::Db;

    #[test]
    fn test_uuid_to_username_stable() {
        let uuid = uuid::uuid!("b8ab87cd-5b74-4e10-9147-ff08a5e04816");
        let first = uuid_to_username(&uuid);
        let again = uuid_to_username(&uuid);
        assert_eq!(first, again);
        assert!(first.starts_with("u-"));
        // 16 bytes of uuid encode to 26 base32 chars.
        assert_eq!(first.len(), 2 + 26);
        assert!(first[2..].chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn test_update_ad_groups_reconciles() {
        let db = Db::new(":memory:").expect("failed to open db");
        let ct = duration_from_epoch_now();
        let user = User::new(Uuid::new_v4());

        db.with_write(|txn| {
            user_upsert(txn, &user, ct)?;
            let groups: BTreeSet<String> =
                ["Admins".to_string(), "  ".to_string(), "staff".to_string()]
                    .into_iter()
                    .collect();
            update_ad_groups(txn, user.uuid, &groups)
        })
        .await
        .expect("failed to set groups");

        let loaded = db
            .with_read(|txn| user_get(txn, user.uuid))
            .await
            .expect("read failed")
            .expect("user missing");
        let expect: BTreeSet<String> = ["admins".to_string(), "staff".to_string()]
            .into_iter()
            .collect();
        assert_eq!(loaded.ad_groups, expect);

        // A shrunk set removes the stale membership.
        db.with_write(|txn| {
            let groups: BTreeSet<String> = ["staff".to_string()].into_iter().collect();
            update_ad_groups(txn, user.uuid, &groups)
        })
        .await
        .expect("failed to shrink groups");

        let loaded = db
            .with_read(|txn| user_get(txn, user.uuid))
            .await
            .expect("read failed")
            .expect("user missing");
        let expect: BTreeSet<String> = ["staff".to_string()].into_iter().collect();
        assert_eq!(loaded.ad_groups, expect);
    }

    #[tokio::test]
    async fn test_login_entry_list_over_bearer() {
        use crate::idm::oauth2::{self, IssuedToken};
        use crate::idm::server::test_support::{test_client, test_idms};
        use crate::idm::session::{self, ElementKind, SessionData};

        const T0: Duration = Duration::from_secs(1_700_000_000);

        let idms = test_idms().await;
        idms.upsert_client(test_client("app", "https://rp.example.com/cb"))
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
                        OAUTH2_SCOPE_LOGIN_ENTRIES.to_string(),
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
                Ok((user.uuid, token.access_token))
            })
            .await
            .expect("seed failed");

        idms.record_login_entry(uuid, "helsinki", Some("203.0.113.9".to_string()), T0)
            .await
            .expect("record failed");
        idms.record_login_entry(uuid, "suomifi", None, Duration::from_secs(T0.as_secs() + 60))
            .await
            .expect("record failed");

        let entries = idms.login_entry_list(&bearer, T0).await.expect("list failed");
        assert_eq!(entries.len(), 2);
        // Newest first.
        assert_eq!(entries[0].service, "suomifi");
        assert_eq!(entries[1].service, "helsinki");
        assert_eq!(entries[1].ip_address.as_deref(), Some("203.0.113.9"));

        assert!(matches!(
            idms.login_entry_list("not-a-token", T0).await,
            Err(Oauth2Error::InvalidToken)
        ));
    }
}
