//! Schema bootstrap. Idempotent - every statement is CREATE IF NOT EXISTS,
//! run once at startup.

use rusqlite::Connection;

use crate::prelude::*;

pub(super) fn migrate(conn: &Connection) -> Result<(), OperationError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            uuid        TEXT PRIMARY KEY,
            username    TEXT NOT NULL UNIQUE,
            email       TEXT NOT NULL DEFAULT '',
            first_name  TEXT NOT NULL DEFAULT '',
            last_name   TEXT NOT NULL DEFAULT '',
            primary_sid TEXT,
            created_at  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS ad_groups (
            name TEXT PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS user_ad_groups (
            user_uuid  TEXT NOT NULL REFERENCES users (uuid),
            group_name TEXT NOT NULL REFERENCES ad_groups (name),
            PRIMARY KEY (user_uuid, group_name)
        );

        CREATE TABLE IF NOT EXISTS clients (
            client_id                 TEXT PRIMARY KEY,
            client_secret             TEXT NOT NULL DEFAULT '',
            client_type               TEXT NOT NULL DEFAULT 'confidential',
            response_types            TEXT NOT NULL DEFAULT '[]',
            redirect_uris             TEXT NOT NULL DEFAULT '[]',
            post_logout_redirect_uris TEXT NOT NULL DEFAULT '[]',
            scope_allowlist           TEXT,
            require_consent           INTEGER NOT NULL DEFAULT 0,
            site_type                 TEXT,
            login_methods             TEXT NOT NULL DEFAULT '[]',
            include_ad_groups         INTEGER NOT NULL DEFAULT 0,
            name                      TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS login_methods (
            provider_id TEXT PRIMARY KEY,
            display     TEXT NOT NULL,
            sort_order  INTEGER NOT NULL DEFAULT 0,
            logo_url    TEXT
        );

        CREATE TABLE IF NOT EXISTS api_domains (
            identifier TEXT PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS apis (
            domain                 TEXT NOT NULL REFERENCES api_domains (identifier),
            name                   TEXT NOT NULL,
            required_scopes        TEXT NOT NULL DEFAULT '[]',
            oidc_client_id         TEXT,
            backchannel_logout_url TEXT,
            PRIMARY KEY (domain, name)
        );

        CREATE TABLE IF NOT EXISTS api_scopes (
            identifier       TEXT PRIMARY KEY,
            domain           TEXT NOT NULL,
            api_name         TEXT NOT NULL,
            specifier        TEXT,
            name_i18n        TEXT NOT NULL DEFAULT '{}',
            description_i18n TEXT NOT NULL DEFAULT '{}'
        );

        CREATE TABLE IF NOT EXISTS api_scope_clients (
            scope_identifier TEXT NOT NULL REFERENCES api_scopes (identifier),
            client_id        TEXT NOT NULL REFERENCES clients (client_id),
            PRIMARY KEY (scope_identifier, client_id)
        );

        CREATE TABLE IF NOT EXISTS rsa_keys (
            kid        TEXT PRIMARY KEY,
            pem        TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            expired_at INTEGER,
            managed    INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS oauth2_codes (
            id                    TEXT PRIMARY KEY,
            code                  TEXT NOT NULL UNIQUE,
            user_uuid             TEXT NOT NULL REFERENCES users (uuid),
            client_id             TEXT NOT NULL REFERENCES clients (client_id),
            scope                 TEXT NOT NULL,
            nonce                 TEXT,
            is_authentication     INTEGER NOT NULL DEFAULT 0,
            code_challenge        TEXT,
            code_challenge_method TEXT,
            redirect_uri          TEXT NOT NULL,
            expires_at            INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS oauth2_tokens (
            id            TEXT PRIMARY KEY,
            access_token  TEXT NOT NULL UNIQUE,
            refresh_token TEXT UNIQUE,
            user_uuid     TEXT NOT NULL REFERENCES users (uuid),
            client_id     TEXT NOT NULL REFERENCES clients (client_id),
            scope         TEXT NOT NULL,
            id_token      TEXT,
            nonce         TEXT,
            created_at    INTEGER NOT NULL,
            expires_at    INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS user_consents (
            user_uuid  TEXT NOT NULL REFERENCES users (uuid),
            client_id  TEXT NOT NULL REFERENCES clients (client_id),
            scope      TEXT NOT NULL,
            date_given INTEGER NOT NULL,
            expires_at INTEGER,
            PRIMARY KEY (user_uuid, client_id)
        );

        CREATE TABLE IF NOT EXISTS tunnistamo_sessions (
            id         TEXT PRIMARY KEY,
            user_uuid  TEXT NOT NULL REFERENCES users (uuid),
            created_at INTEGER NOT NULL,
            ended_at   INTEGER,
            data       TEXT NOT NULL DEFAULT '{}'
        );

        CREATE TABLE IF NOT EXISTS session_elements (
            session_id   TEXT NOT NULL REFERENCES tunnistamo_sessions (id),
            content_type TEXT NOT NULL,
            object_id    TEXT NOT NULL,
            created_at   INTEGER NOT NULL,
            PRIMARY KEY (session_id, content_type, object_id)
        );

        CREATE TABLE IF NOT EXISTS social_auths (
            id         TEXT PRIMARY KEY,
            user_uuid  TEXT NOT NULL REFERENCES users (uuid),
            provider   TEXT NOT NULL,
            uid        TEXT NOT NULL,
            extra_data TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            UNIQUE (provider, uid)
        );

        CREATE TABLE IF NOT EXISTS user_login_entries (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            user_uuid    TEXT NOT NULL REFERENCES users (uuid),
            service      TEXT NOT NULL,
            timestamp    INTEGER NOT NULL,
            ip_address   TEXT,
            geo_location TEXT
        );

        CREATE TABLE IF NOT EXISTS user_devices (
            id           TEXT PRIMARY KEY,
            user_uuid    TEXT NOT NULL REFERENCES users (uuid),
            public_key   TEXT NOT NULL,
            secret_key   TEXT NOT NULL,
            auth_counter INTEGER NOT NULL DEFAULT 0,
            last_used_at INTEGER
        );

        CREATE TABLE IF NOT EXISTS user_identities (
            id         TEXT PRIMARY KEY,
            user_uuid  TEXT NOT NULL REFERENCES users (uuid),
            service    TEXT NOT NULL,
            identifier TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE (user_uuid, service)
        );

        CREATE TABLE IF NOT EXISTS interface_devices (
            id         TEXT PRIMARY KEY,
            secret_key TEXT NOT NULL,
            scopes     TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS allowed_origins (
            origin TEXT PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS web_sessions (
            key        TEXT PRIMARY KEY,
            user_uuid  TEXT,
            data       TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_session_elements_object
            ON session_elements (content_type, object_id);
        CREATE INDEX IF NOT EXISTS idx_web_sessions_user
            ON web_sessions (user_uuid);
        CREATE INDEX IF NOT EXISTS idx_login_entries_user
            ON user_login_entries (user_uuid);
        ",
    )
    .map_err(|err| {
        admin_error!(?err, "Failed to migrate database schema");
        OperationError::SqliteError
    })
}
