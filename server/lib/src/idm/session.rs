//! Tunnistamo sessions.
//!
//! One session is created per completed login and binds the user to every
//! artifact issued under it (codes, tokens, upstream social auth records).
//! The binding rows are session elements, deduplicated per (session, kind,
//! object). A session ends exactly once; everything issued under an ended
//! session is invalid from that point.

use rusqlite::{params, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};

use crate::be::{from_json_text, sqlite_err, to_json_text};
use crate::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Code,
    Token,
    SocialAuth,
    Device,
}

impl ElementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Code => "oauth2_code",
            ElementKind::Token => "oauth2_token",
            ElementKind::SocialAuth => "social_auth",
            ElementKind::Device => "device",
        }
    }
}

/// Free-form attributes recorded at login time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loa: Option<String>,
    /// Upstream provider id the login came through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_time: Option<i64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct TunnistamoSession {
    pub id: Uuid,
    pub user_uuid: Uuid,
    pub created_at: i64,
    pub ended_at: Option<i64>,
    pub data: SessionData,
}

impl TunnistamoSession {
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<(TunnistamoSession, String)> {
    let id: String = row.get(0)?;
    let user_uuid: String = row.get(1)?;
    let data: String = row.get(4)?;
    Ok((
        TunnistamoSession {
            id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
            user_uuid: Uuid::parse_str(&user_uuid).unwrap_or_else(|_| Uuid::nil()),
            created_at: row.get(2)?,
            ended_at: row.get(3)?,
            data: SessionData::default(),
        },
        data,
    ))
}

const SESSION_COLS: &str = "id, user_uuid, created_at, ended_at, data";

fn finish_session(
    parts: (TunnistamoSession, String),
) -> Result<TunnistamoSession, OperationError> {
    let (mut session, data) = parts;
    session.data = from_json_text(&data)?;
    Ok(session)
}

pub(crate) fn session_create(
    txn: &Transaction,
    user_uuid: Uuid,
    data: &SessionData,
    ct: Duration,
) -> Result<TunnistamoSession, OperationError> {
    let session = TunnistamoSession {
        id: Uuid::new_v4(),
        user_uuid,
        created_at: ct.as_secs() as i64,
        ended_at: None,
        data: data.clone(),
    };
    txn.execute(
        "INSERT INTO tunnistamo_sessions (id, user_uuid, created_at, ended_at, data)
         VALUES (?1, ?2, ?3, NULL, ?4)",
        params![
            session.id.to_string(),
            user_uuid.to_string(),
            session.created_at,
            to_json_text(&session.data)?,
        ],
    )
    .map_err(sqlite_err)?;
    security_info!(session_id = %session.id, %user_uuid, "Created tunnistamo session");
    Ok(session)
}

pub(crate) fn session_get(
    txn: &Transaction,
    id: Uuid,
) -> Result<Option<TunnistamoSession>, OperationError> {
    let maybe = txn
        .query_row(
            &format!("SELECT {SESSION_COLS} FROM tunnistamo_sessions WHERE id = ?1"),
            params![id.to_string()],
            row_to_session,
        )
        .optional()
        .map_err(sqlite_err)?;
    maybe.map(finish_session).transpose()
}

/// Mark the session ended. Returns false when it was already ended, in which
/// case the original end time is preserved.
pub(crate) fn session_end(
    txn: &Transaction,
    id: Uuid,
    ct: Duration,
) -> Result<bool, OperationError> {
    let n = txn
        .execute(
            "UPDATE tunnistamo_sessions SET ended_at = ?1 WHERE id = ?2 AND ended_at IS NULL",
            params![ct.as_secs() as i64, id.to_string()],
        )
        .map_err(sqlite_err)?;
    if n > 0 {
        security_info!(session_id = %id, "Ended tunnistamo session");
    }
    Ok(n > 0)
}

pub(crate) fn sessions_for_user(
    txn: &Transaction,
    user_uuid: Uuid,
    active_only: bool,
) -> Result<Vec<TunnistamoSession>, OperationError> {
    let filter = if active_only {
        " AND ended_at IS NULL"
    } else {
        ""
    };
    let mut stmt = txn
        .prepare(&format!(
            "SELECT {SESSION_COLS} FROM tunnistamo_sessions
             WHERE user_uuid = ?1{filter} ORDER BY created_at DESC"
        ))
        .map_err(sqlite_err)?;
    let parts = stmt
        .query_map(params![user_uuid.to_string()], row_to_session)
        .map_err(sqlite_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sqlite_err)?;
    parts.into_iter().map(finish_session).collect()
}

/// Active sessions authenticated through the given upstream provider.
pub(crate) fn sessions_active_for_method(
    txn: &Transaction,
    method: &str,
) -> Result<Vec<TunnistamoSession>, OperationError> {
    let mut stmt = txn
        .prepare(&format!(
            "SELECT {SESSION_COLS} FROM tunnistamo_sessions
             WHERE ended_at IS NULL ORDER BY created_at DESC"
        ))
        .map_err(sqlite_err)?;
    let parts = stmt
        .query_map([], row_to_session)
        .map_err(sqlite_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sqlite_err)?;
    let sessions = parts
        .into_iter()
        .map(finish_session)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(sessions
        .into_iter()
        .filter(|s| s.data.auth_method.as_deref() == Some(method))
        .collect())
}

/// Bind an object to a session. Re-binding the same object is a no-op and
/// keeps the original bind time.
pub(crate) fn element_add(
    txn: &Transaction,
    session_id: Uuid,
    kind: ElementKind,
    object_id: &str,
    ct: Duration,
) -> Result<(), OperationError> {
    txn.execute(
        "INSERT OR IGNORE INTO session_elements (session_id, content_type, object_id, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            session_id.to_string(),
            kind.as_str(),
            object_id,
            ct.as_secs() as i64
        ],
    )
    .map_err(sqlite_err)?;
    Ok(())
}

/// Object ids of one kind bound to a session, newest bind first.
pub(crate) fn element_object_ids(
    txn: &Transaction,
    session_id: Uuid,
    kind: ElementKind,
) -> Result<Vec<String>, OperationError> {
    let mut stmt = txn
        .prepare(
            "SELECT object_id FROM session_elements
             WHERE session_id = ?1 AND content_type = ?2
             ORDER BY created_at DESC, object_id DESC",
        )
        .map_err(sqlite_err)?;
    let ids = stmt
        .query_map(params![session_id.to_string(), kind.as_str()], |row| {
            row.get::<_, String>(0)
        })
        .map_err(sqlite_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sqlite_err)?;
    Ok(ids)
}

/// The session an object is bound to, if any. When an object was bound to
/// several sessions the most recent binding wins.
pub(crate) fn session_for_element(
    txn: &Transaction,
    kind: ElementKind,
    object_id: &str,
) -> Result<Option<TunnistamoSession>, OperationError> {
    let session_id: Option<String> = txn
        .query_row(
            "SELECT session_id FROM session_elements
             WHERE content_type = ?1 AND object_id = ?2
             ORDER BY created_at DESC LIMIT 1",
            params![kind.as_str(), object_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(sqlite_err)?;
    match session_id {
        Some(id) => {
            let id = Uuid::parse_str(&id).map_err(|_| OperationError::InvalidState)?;
            session_get(txn, id)
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::be::Db;
    use crate::idm::users::{user_upsert, User};

    async fn test_user(db: &Db) -> Uuid {
        let user = User::new(Uuid::new_v4());
        let uuid = user.uuid;
        db.with_write(move |txn| user_upsert(txn, &user, Duration::from_secs(1)))
            .await
            .expect("user setup failed");
        uuid
    }

    #[tokio::test]
    async fn test_session_end_is_terminal() {
        let db = Db::new(":memory:").expect("failed to open db");
        let uuid = test_user(&db).await;
        let t0 = Duration::from_secs(1000);

        let session = db
            .with_write(move |txn| session_create(txn, uuid, &SessionData::default(), t0))
            .await
            .expect("create failed");
        let sid = session.id;
        assert!(session.is_active());

        assert!(db
            .with_write(move |txn| session_end(txn, sid, Duration::from_secs(2000)))
            .await
            .expect("end failed"));

        // Second end is a no-op and the original end time survives.
        assert!(!db
            .with_write(move |txn| session_end(txn, sid, Duration::from_secs(3000)))
            .await
            .expect("end failed"));
        let session = db
            .with_read(move |txn| session_get(txn, sid))
            .await
            .expect("read failed")
            .expect("session missing");
        assert_eq!(session.ended_at, Some(2000));
        assert!(!session.is_active());
    }

    #[tokio::test]
    async fn test_element_dedup_and_resolution() {
        let db = Db::new(":memory:").expect("failed to open db");
        let uuid = test_user(&db).await;
        let t0 = Duration::from_secs(1000);

        let session = db
            .with_write(move |txn| session_create(txn, uuid, &SessionData::default(), t0))
            .await
            .expect("create failed");
        let sid = session.id;

        db.with_write(move |txn| {
            element_add(txn, sid, ElementKind::Token, "tok-1", t0)?;
            // Same object rebound later: deduplicated, original time kept.
            element_add(txn, sid, ElementKind::Token, "tok-1", Duration::from_secs(5000))?;
            element_add(txn, sid, ElementKind::Token, "tok-2", Duration::from_secs(2000))?;
            element_add(txn, sid, ElementKind::Code, "code-1", t0)
        })
        .await
        .expect("bind failed");

        let ids = db
            .with_read(move |txn| element_object_ids(txn, sid, ElementKind::Token))
            .await
            .expect("read failed");
        assert_eq!(ids, vec!["tok-2".to_string(), "tok-1".to_string()]);

        let found = db
            .with_read(move |txn| session_for_element(txn, ElementKind::Code, "code-1"))
            .await
            .expect("read failed")
            .expect("session missing");
        assert_eq!(found.id, sid);

        // Unknown object resolves to none rather than an error.
        assert!(db
            .with_read(move |txn| session_for_element(txn, ElementKind::Code, "nope"))
            .await
            .expect("read failed")
            .is_none());
    }
}
