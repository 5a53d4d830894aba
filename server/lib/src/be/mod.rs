//! The storage backend. A single sqlite database behind an async mutex, with
//! closure-scoped read and write transactions. Writers take an IMMEDIATE
//! transaction so row reconciliation (AD groups, consents) cannot interleave
//! between concurrent logins of the same user.

use rusqlite::{Connection, Transaction, TransactionBehavior};
use tokio::sync::Mutex;

use crate::prelude::*;

mod schema;

pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    /// Open (or create) the database and bring the schema up to date.
    /// `path` may be `:memory:` for tests.
    pub fn new(path: &str) -> Result<Self, OperationError> {
        let conn = Connection::open(path).map_err(|err| {
            admin_error!(?err, %path, "Failed to open database");
            OperationError::SqliteError
        })?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(|err| {
            admin_error!(?err, "Failed to configure database");
            OperationError::SqliteError
        })?;

        schema::migrate(&conn)?;

        Ok(Db {
            conn: Mutex::new(conn),
        })
    }

    /// Run a read-only closure inside a deferred transaction.
    pub async fn with_read<T, F>(&self, f: F) -> Result<T, OperationError>
    where
        F: FnOnce(&Transaction) -> Result<T, OperationError>,
    {
        let mut guard = self.conn.lock().await;
        let txn = guard.transaction().map_err(|err| {
            admin_error!(?err, "Failed to begin read transaction");
            OperationError::SqliteError
        })?;
        f(&txn)
        // Dropping the transaction rolls back; reads have nothing to commit.
    }

    /// Run a read-write closure inside an IMMEDIATE transaction, committing
    /// on success.
    pub async fn with_write<T, F>(&self, f: F) -> Result<T, OperationError>
    where
        F: FnOnce(&Transaction) -> Result<T, OperationError>,
    {
        let mut guard = self.conn.lock().await;
        let txn = guard
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| {
                admin_error!(?err, "Failed to begin write transaction");
                OperationError::SqliteError
            })?;
        let out = f(&txn)?;
        txn.commit().map_err(|err| {
            admin_error!(?err, "Failed to commit transaction");
            OperationError::SqliteError
        })?;
        Ok(out)
    }
}

/// Map a rusqlite error into the backend operation error, logging it.
pub fn sqlite_err(err: rusqlite::Error) -> OperationError {
    admin_error!(?err, "SQLite operation failed");
    OperationError::SqliteError
}

/// Serialize a value into its stored JSON text form.
pub fn to_json_text<T: serde::Serialize>(value: &T) -> Result<String, OperationError> {
    serde_json::to_string(value).map_err(|err| {
        admin_error!(?err, "Failed to serialise value for storage");
        OperationError::SerdeJsonError
    })
}

/// Deserialize a stored JSON text column.
pub fn from_json_text<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, OperationError> {
    serde_json::from_str(text).map_err(|err| {
        admin_error!(?err, "Failed to deserialise stored value");
        OperationError::SerdeJsonError
    })
}
