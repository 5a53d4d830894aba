//! Browser sessions behind the `sso-sessionid` cookie.
//!
//! A web session starts anonymous and carries the transient state of an
//! in-flight login (the pending authorise request, upstream state and nonce).
//! Once the login pipeline completes it is bound to the user and to the
//! tunnistamo session created for that login.

use rusqlite::{params, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};

use crate::be::{from_json_text, sqlite_err, to_json_text};
use crate::idm::server::IdmServer;
use crate::prelude::*;
use crate::utils::generate_opaque_token;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebSessionData {
    /// Set when the login pipeline completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnistamo_session_id: Option<Uuid>,
    /// Url-encoded authorise request to resume after login.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_authorise: Option<String>,
    /// Provider-specific in-flight state (state, nonce, pkce verifier).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<serde_json::Value>,
    /// Display language for the flow, kept once `ui_locales` resolves to a
    /// supported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct WebSession {
    pub key: String,
    pub user_uuid: Option<Uuid>,
    pub data: WebSessionData,
    pub created_at: i64,
    pub expires_at: i64,
}

impl WebSession {
    pub fn is_authenticated(&self) -> bool {
        self.user_uuid.is_some()
    }
}

impl IdmServer {
    /// Create a fresh anonymous browser session.
    pub async fn websession_begin(&self, ct: Duration) -> Result<WebSession, OperationError> {
        let ttl = self.config.websession_ttl;
        self.db
            .with_write(move |txn| websession_create(txn, ct, ttl))
            .await
    }

    /// Fetch a live browser session. Expired sessions read as absent.
    pub async fn websession_fetch(
        &self,
        key: &str,
        ct: Duration,
    ) -> Result<Option<WebSession>, OperationError> {
        let key = key.to_string();
        self.db
            .with_read(move |txn| websession_get(txn, &key, ct))
            .await
    }

    /// Persist the mutable parts of a browser session.
    pub async fn websession_store(&self, session: WebSession) -> Result<(), OperationError> {
        self.db
            .with_write(move |txn| websession_update(txn, &session))
            .await
    }

    pub async fn websession_end(&self, key: &str) -> Result<(), OperationError> {
        let key = key.to_string();
        self.db
            .with_write(move |txn| websession_delete(txn, &key))
            .await
    }
}

pub(crate) fn websession_create(
    txn: &Transaction,
    ct: Duration,
    ttl: Duration,
) -> Result<WebSession, OperationError> {
    let session = WebSession {
        key: generate_opaque_token(),
        user_uuid: None,
        data: WebSessionData::default(),
        created_at: ct.as_secs() as i64,
        expires_at: (ct + ttl).as_secs() as i64,
    };
    txn.execute(
        "INSERT INTO web_sessions (key, user_uuid, data, created_at, expires_at)
         VALUES (?1, NULL, ?2, ?3, ?4)",
        params![
            session.key,
            to_json_text(&session.data)?,
            session.created_at,
            session.expires_at
        ],
    )
    .map_err(sqlite_err)?;
    Ok(session)
}

pub(crate) fn websession_get(
    txn: &Transaction,
    key: &str,
    ct: Duration,
) -> Result<Option<WebSession>, OperationError> {
    let maybe = txn
        .query_row(
            "SELECT key, user_uuid, data, created_at, expires_at FROM web_sessions
             WHERE key = ?1",
            params![key],
            |row| {
                let user_uuid: Option<String> = row.get(1)?;
                let data: String = row.get(2)?;
                Ok((
                    WebSession {
                        key: row.get(0)?,
                        user_uuid: user_uuid.and_then(|u| Uuid::parse_str(&u).ok()),
                        data: WebSessionData::default(),
                        created_at: row.get(3)?,
                        expires_at: row.get(4)?,
                    },
                    data,
                ))
            },
        )
        .optional()
        .map_err(sqlite_err)?;
    match maybe {
        Some((mut session, data)) => {
            if session.expires_at <= ct.as_secs() as i64 {
                return Ok(None);
            }
            session.data = from_json_text(&data)?;
            Ok(Some(session))
        }
        None => Ok(None),
    }
}

pub(crate) fn websession_update(
    txn: &Transaction,
    session: &WebSession,
) -> Result<(), OperationError> {
    txn.execute(
        "UPDATE web_sessions SET user_uuid = ?1, data = ?2, expires_at = ?3 WHERE key = ?4",
        params![
            session.user_uuid.map(|u| u.to_string()),
            to_json_text(&session.data)?,
            session.expires_at,
            session.key
        ],
    )
    .map_err(sqlite_err)?;
    Ok(())
}

pub(crate) fn websession_delete(txn: &Transaction, key: &str) -> Result<(), OperationError> {
    txn.execute("DELETE FROM web_sessions WHERE key = ?1", params![key])
        .map_err(sqlite_err)?;
    Ok(())
}

/// Browser session keys held by a user, for logout fan-out.
pub(crate) fn websession_keys_for_user(
    txn: &Transaction,
    user_uuid: Uuid,
) -> Result<Vec<String>, OperationError> {
    let mut stmt = txn
        .prepare("SELECT key FROM web_sessions WHERE user_uuid = ?1")
        .map_err(sqlite_err)?;
    let keys = stmt
        .query_map(params![user_uuid.to_string()], |row| {
            row.get::<_, String>(0)
        })
        .map_err(sqlite_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sqlite_err)?;
    Ok(keys)
}

pub(crate) fn websession_purge_expired(
    txn: &Transaction,
    ct: Duration,
) -> Result<usize, OperationError> {
    txn.execute(
        "DELETE FROM web_sessions WHERE expires_at <= ?1",
        params![ct.as_secs() as i64],
    )
    .map_err(sqlite_err)
}
