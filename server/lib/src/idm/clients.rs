//! OIDC / OAuth2 client configuration and the derived CORS origin set.
//!
//! Clients are stored in the database, but the hot read path (every
//! authorise, token, and CORS decision) works against an immutable in-memory
//! snapshot behind a copy-on-write cell. Any client mutation rewrites the
//! derived allowed-origin rows in the same transaction and then republishes
//! the snapshot.

use std::sync::Arc;

use concread::cowcell::*;
use hashbrown::{HashMap, HashSet};
use rusqlite::{params, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};

use crate::be::{from_json_text, sqlite_err, to_json_text};
use crate::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    Public,
    Confidential,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientOptions {
    pub site_type: Option<String>,
    /// Upstream providers this client permits for login. Empty means all.
    pub login_methods: Vec<String>,
    pub include_ad_groups: bool,
}

#[derive(Debug, Clone)]
pub struct Client {
    pub client_id: String,
    pub client_secret: String,
    pub client_type: ClientType,
    pub name: String,
    pub response_types: BTreeSet<String>,
    pub redirect_uris: Vec<Url>,
    pub post_logout_redirect_uris: Vec<Url>,
    pub scope_allowlist: Option<BTreeSet<String>>,
    pub require_consent: bool,
    pub options: ClientOptions,
}

impl Client {
    /// Exact string equality against the registered redirect uris.
    pub fn redirect_uri_matches(&self, redirect_uri: &Url) -> bool {
        self.redirect_uris
            .iter()
            .any(|uri| uri.as_str() == redirect_uri.as_str())
    }

    pub fn post_logout_redirect_uri_index(&self, uri: &Url) -> Option<usize> {
        self.post_logout_redirect_uris
            .iter()
            .position(|u| u.as_str() == uri.as_str())
    }

    /// Whether an upstream provider may be used to log in to this client.
    pub fn login_method_allowed(&self, provider: &str) -> bool {
        self.options.login_methods.is_empty()
            || self.options.login_methods.iter().any(|m| m == provider)
    }

    pub fn is_public(&self) -> bool {
        matches!(self.client_type, ClientType::Public)
    }
}

/// A selectable login method shown by the login view, ordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginMethod {
    pub provider_id: String,
    pub display: String,
    pub order: i64,
    pub logo_url: Option<String>,
}

/// The origin (`scheme://host`, normalised) of a client uri, used for the
/// CORS allow-list derivation.
pub fn uri_origin(uri: &Url) -> Option<String> {
    match uri.origin() {
        url::Origin::Tuple(..) => Some(uri.origin().ascii_serialization()),
        url::Origin::Opaque(_) => None,
    }
}

#[derive(Clone)]
struct ClientSnapshot {
    clients: HashMap<String, Arc<Client>>,
    origins: HashSet<String>,
}

pub struct ClientRegistry {
    inner: CowCell<ClientSnapshot>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        ClientRegistry {
            inner: CowCell::new(ClientSnapshot {
                clients: HashMap::new(),
                origins: HashSet::new(),
            }),
        }
    }
}

impl ClientRegistry {
    pub fn get(&self, client_id: &str) -> Option<Arc<Client>> {
        self.inner.read().clients.get(client_id).cloned()
    }

    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.inner.read().origins.contains(origin)
    }

    /// Replace the snapshot from the authoritative rows. Origins come from
    /// the allowed_origins mirror, not recomputed from the client uris.
    pub fn reload(&self, clients: Vec<Client>, origins: BTreeSet<String>) {
        let snapshot = ClientSnapshot {
            clients: clients
                .into_iter()
                .map(|c| (c.client_id.clone(), Arc::new(c)))
                .collect(),
            origins: origins.into_iter().collect(),
        };

        let mut write_txn = self.inner.write();
        *write_txn = snapshot;
        write_txn.commit();
    }
}

// == storage ==

fn urls_from_json(text: &str) -> Result<Vec<Url>, OperationError> {
    let raw: Vec<String> = from_json_text(text)?;
    raw.iter()
        .map(|s| {
            Url::parse(s).map_err(|err| {
                admin_error!(?err, %s, "Stored client uri does not parse");
                OperationError::InvalidState
            })
        })
        .collect()
}

fn row_to_client(row: &rusqlite::Row) -> rusqlite::Result<(Client, String, String, String)> {
    let client_type: String = row.get(2)?;
    let client = Client {
        client_id: row.get(0)?,
        client_secret: row.get(1)?,
        client_type: if client_type == "public" {
            ClientType::Public
        } else {
            ClientType::Confidential
        },
        response_types: BTreeSet::new(),
        redirect_uris: Vec::new(),
        post_logout_redirect_uris: Vec::new(),
        scope_allowlist: None,
        require_consent: row.get::<_, i64>(7)? != 0,
        name: row.get(11)?,
        options: ClientOptions {
            site_type: row.get(8)?,
            login_methods: Vec::new(),
            include_ad_groups: row.get::<_, i64>(10)? != 0,
        },
    };
    // Deferred json columns: response_types, uris, allowlist, login methods.
    let response_types: String = row.get(3)?;
    let redirect: String = row.get(4)?;
    let post_logout: String = row.get(5)?;
    Ok((client, response_types, redirect, post_logout))
}

const CLIENT_COLS: &str = "client_id, client_secret, client_type, response_types, redirect_uris, \
     post_logout_redirect_uris, scope_allowlist, require_consent, site_type, login_methods, \
     include_ad_groups, name";

fn finish_client(
    txn: &Transaction,
    parts: (Client, String, String, String),
) -> Result<Client, OperationError> {
    let (mut client, response_types, redirect, post_logout) = parts;
    client.response_types = from_json_text(&response_types)?;
    client.redirect_uris = urls_from_json(&redirect)?;
    client.post_logout_redirect_uris = urls_from_json(&post_logout)?;

    let (allowlist, login_methods): (Option<String>, String) = txn
        .query_row(
            "SELECT scope_allowlist, login_methods FROM clients WHERE client_id = ?1",
            params![client.client_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(sqlite_err)?;
    client.scope_allowlist = match allowlist {
        Some(text) => Some(from_json_text(&text)?),
        None => None,
    };
    client.options.login_methods = from_json_text(&login_methods)?;
    Ok(client)
}

#[allow(dead_code)]
pub(crate) fn client_get(
    txn: &Transaction,
    client_id: &str,
) -> Result<Option<Client>, OperationError> {
    let maybe = txn
        .query_row(
            &format!("SELECT {CLIENT_COLS} FROM clients WHERE client_id = ?1"),
            params![client_id],
            row_to_client,
        )
        .optional()
        .map_err(sqlite_err)?;
    match maybe {
        Some(parts) => Ok(Some(finish_client(txn, parts)?)),
        None => Ok(None),
    }
}

pub(crate) fn client_all(txn: &Transaction) -> Result<Vec<Client>, OperationError> {
    let mut stmt = txn
        .prepare(&format!("SELECT {CLIENT_COLS} FROM clients"))
        .map_err(sqlite_err)?;
    let parts = stmt
        .query_map([], row_to_client)
        .map_err(sqlite_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sqlite_err)?;
    drop(stmt);
    parts
        .into_iter()
        .map(|p| finish_client(txn, p))
        .collect()
}

/// Insert or update a client and rebuild the derived allowed-origin rows in
/// the same transaction.
pub(crate) fn client_upsert(txn: &Transaction, client: &Client) -> Result<(), OperationError> {
    let redirect: Vec<String> = client.redirect_uris.iter().map(|u| u.to_string()).collect();
    let post_logout: Vec<String> = client
        .post_logout_redirect_uris
        .iter()
        .map(|u| u.to_string())
        .collect();
    txn.execute(
        "INSERT INTO clients (client_id, client_secret, client_type, response_types, \
             redirect_uris, post_logout_redirect_uris, scope_allowlist, require_consent, \
             site_type, login_methods, include_ad_groups, name)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT (client_id) DO UPDATE SET
            client_secret = excluded.client_secret,
            client_type = excluded.client_type,
            response_types = excluded.response_types,
            redirect_uris = excluded.redirect_uris,
            post_logout_redirect_uris = excluded.post_logout_redirect_uris,
            scope_allowlist = excluded.scope_allowlist,
            require_consent = excluded.require_consent,
            site_type = excluded.site_type,
            login_methods = excluded.login_methods,
            include_ad_groups = excluded.include_ad_groups,
            name = excluded.name",
        params![
            client.client_id,
            client.client_secret,
            match client.client_type {
                ClientType::Public => "public",
                ClientType::Confidential => "confidential",
            },
            to_json_text(&client.response_types)?,
            to_json_text(&redirect)?,
            to_json_text(&post_logout)?,
            client
                .scope_allowlist
                .as_ref()
                .map(to_json_text)
                .transpose()?,
            client.require_consent as i64,
            client.options.site_type,
            to_json_text(&client.options.login_methods)?,
            client.options.include_ad_groups as i64,
            client.name,
        ],
    )
    .map_err(sqlite_err)?;
    rebuild_allowed_origins(txn)?;
    Ok(())
}

pub(crate) fn client_delete(txn: &Transaction, client_id: &str) -> Result<(), OperationError> {
    txn.execute(
        "DELETE FROM clients WHERE client_id = ?1",
        params![client_id],
    )
    .map_err(sqlite_err)?;
    rebuild_allowed_origins(txn)?;
    Ok(())
}

/// Mirror the `scheme://host` values of every client uri into the
/// allowed_origins table. Full rebuild - client mutation is rare.
pub(crate) fn rebuild_allowed_origins(txn: &Transaction) -> Result<(), OperationError> {
    let clients = client_all(txn)?;
    let mut origins: BTreeSet<String> = BTreeSet::new();
    for client in &clients {
        for uri in client
            .redirect_uris
            .iter()
            .chain(client.post_logout_redirect_uris.iter())
        {
            if let Some(origin) = uri_origin(uri) {
                origins.insert(origin);
            }
        }
    }
    txn.execute("DELETE FROM allowed_origins", [])
        .map_err(sqlite_err)?;
    for origin in &origins {
        txn.execute(
            "INSERT INTO allowed_origins (origin) VALUES (?1)",
            params![origin],
        )
        .map_err(sqlite_err)?;
    }
    Ok(())
}

pub(crate) fn allowed_origins_all(txn: &Transaction) -> Result<BTreeSet<String>, OperationError> {
    let mut stmt = txn
        .prepare("SELECT origin FROM allowed_origins")
        .map_err(sqlite_err)?;
    let origins = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(sqlite_err)?
        .collect::<Result<BTreeSet<_>, _>>()
        .map_err(sqlite_err)?;
    Ok(origins)
}

pub(crate) fn login_methods_all(txn: &Transaction) -> Result<Vec<LoginMethod>, OperationError> {
    let mut stmt = txn
        .prepare(
            "SELECT provider_id, display, sort_order, logo_url FROM login_methods
             ORDER BY sort_order ASC, provider_id ASC",
        )
        .map_err(sqlite_err)?;
    let methods = stmt
        .query_map([], |row| {
            Ok(LoginMethod {
                provider_id: row.get(0)?,
                display: row.get(1)?,
                order: row.get(2)?,
                logo_url: row.get(3)?,
            })
        })
        .map_err(sqlite_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sqlite_err)?;
    Ok(methods)
}

pub(crate) fn login_method_upsert(
    txn: &Transaction,
    method: &LoginMethod,
) -> Result<(), OperationError> {
    txn.execute(
        "INSERT INTO login_methods (provider_id, display, sort_order, logo_url)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (provider_id) DO UPDATE SET
            display = excluded.display,
            sort_order = excluded.sort_order,
            logo_url = excluded.logo_url",
        params![
            method.provider_id,
            method.display,
            method.order,
            method.logo_url
        ],
    )
    .map_err(sqlite_err)?;
    Ok(())
}
