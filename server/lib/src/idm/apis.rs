//! API catalogue: domains, APIs and their scopes.
//!
//! An API lives under a domain (an url-shaped namespace such as
//! `https://api.example.com/auth`). Its identifier is `domain/name`, and an
//! api scope's identifier is `api_identifier[.specifier]`. Identifiers are
//! derived once at creation and never change, because issued tokens reference
//! them as scope strings and audiences.

use rusqlite::{params, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};

use crate::be::{from_json_text, sqlite_err, to_json_text};
use crate::idm::server::IdmServer;
use crate::prelude::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Api {
    pub domain: String,
    pub name: String,
    /// Scopes a caller must hold before an api token for this api is minted.
    /// Defaults to the api identifier itself when empty.
    pub required_scopes: Vec<String>,
    /// Client acting as the api's own OIDC registration, used for
    /// back-channel logout delivery.
    pub oidc_client_id: Option<String>,
    pub backchannel_logout_url: Option<Url>,
}

impl Api {
    /// `domain/name`, the audience of api tokens minted for this api.
    pub fn identifier(&self) -> String {
        format!("{}/{}", self.domain.trim_end_matches('/'), self.name)
    }

    pub fn required_scopes(&self) -> Vec<String> {
        if self.required_scopes.is_empty() {
            vec![self.identifier()]
        } else {
            self.required_scopes.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiScope {
    /// Immutable, derived at creation from api + specifier.
    pub identifier: String,
    pub domain: String,
    pub api_name: String,
    pub specifier: Option<String>,
    pub name_i18n: BTreeMap<String, String>,
    pub description_i18n: BTreeMap<String, String>,
}

impl ApiScope {
    pub fn new(
        api: &Api,
        specifier: Option<&str>,
        name_i18n: BTreeMap<String, String>,
        description_i18n: BTreeMap<String, String>,
    ) -> Self {
        let specifier = specifier
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let identifier = match specifier.as_deref() {
            Some(spec) => format!("{}.{}", api.identifier(), spec),
            None => api.identifier(),
        };
        ApiScope {
            identifier,
            domain: api.domain.clone(),
            api_name: api.name.clone(),
            specifier,
            name_i18n,
            description_i18n,
        }
    }

    pub fn localised_name(&self, locales: &[String]) -> Option<&str> {
        locales
            .iter()
            .find_map(|l| self.name_i18n.get(l))
            .or_else(|| self.name_i18n.get("en"))
            .map(String::as_str)
    }
}

impl IdmServer {
    /// Register or replace an API. The owning domain is created on demand.
    pub async fn upsert_api(&self, api: Api) -> Result<(), OperationError> {
        self.db.with_write(move |txn| api_upsert(txn, &api)).await
    }

    /// Register or replace an api scope.
    pub async fn upsert_api_scope(&self, scope: ApiScope) -> Result<(), OperationError> {
        self.db
            .with_write(move |txn| {
                if api_get(txn, &scope.domain, &scope.api_name)?.is_none() {
                    return Err(OperationError::NoMatchingEntries);
                }
                api_scope_upsert(txn, &scope)
            })
            .await
    }

    /// Grant a client access to an api scope.
    pub async fn allow_api_scope(
        &self,
        scope_identifier: &str,
        client_id: &str,
    ) -> Result<(), OperationError> {
        if self.client(client_id).is_none() {
            return Err(OperationError::InvalidClientId(client_id.to_string()));
        }
        let scope_identifier = scope_identifier.to_string();
        let client_id = client_id.to_string();
        self.db
            .with_write(move |txn| api_scope_allow_client(txn, &scope_identifier, &client_id))
            .await
    }

    pub async fn list_apis(&self) -> Result<Vec<Api>, OperationError> {
        self.db.with_read(apis_all).await
    }
}

// == storage ==

pub(crate) fn api_domain_upsert(txn: &Transaction, identifier: &str) -> Result<(), OperationError> {
    txn.execute(
        "INSERT OR IGNORE INTO api_domains (identifier) VALUES (?1)",
        params![identifier],
    )
    .map_err(sqlite_err)?;
    Ok(())
}

fn row_to_api(row: &rusqlite::Row) -> rusqlite::Result<(Api, String)> {
    let required_scopes: String = row.get(2)?;
    Ok((
        Api {
            domain: row.get(0)?,
            name: row.get(1)?,
            required_scopes: Vec::new(),
            oidc_client_id: row.get(3)?,
            backchannel_logout_url: row
                .get::<_, Option<String>>(4)?
                .and_then(|s| Url::parse(&s).ok()),
        },
        required_scopes,
    ))
}

const API_COLS: &str = "domain, name, required_scopes, oidc_client_id, backchannel_logout_url";

pub(crate) fn api_upsert(txn: &Transaction, api: &Api) -> Result<(), OperationError> {
    api_domain_upsert(txn, &api.domain)?;
    txn.execute(
        "INSERT INTO apis (domain, name, required_scopes, oidc_client_id, backchannel_logout_url)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (domain, name) DO UPDATE SET
            required_scopes = excluded.required_scopes,
            oidc_client_id = excluded.oidc_client_id,
            backchannel_logout_url = excluded.backchannel_logout_url",
        params![
            api.domain,
            api.name,
            to_json_text(&api.required_scopes)?,
            api.oidc_client_id,
            api.backchannel_logout_url.as_ref().map(Url::to_string),
        ],
    )
    .map_err(sqlite_err)?;
    Ok(())
}

pub(crate) fn apis_all(txn: &Transaction) -> Result<Vec<Api>, OperationError> {
    let mut stmt = txn
        .prepare(&format!("SELECT {API_COLS} FROM apis"))
        .map_err(sqlite_err)?;
    let parts = stmt
        .query_map([], row_to_api)
        .map_err(sqlite_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sqlite_err)?;
    parts
        .into_iter()
        .map(|(mut api, required)| {
            api.required_scopes = from_json_text(&required)?;
            Ok(api)
        })
        .collect()
}

pub(crate) fn api_get(
    txn: &Transaction,
    domain: &str,
    name: &str,
) -> Result<Option<Api>, OperationError> {
    let maybe = txn
        .query_row(
            &format!("SELECT {API_COLS} FROM apis WHERE domain = ?1 AND name = ?2"),
            params![domain, name],
            row_to_api,
        )
        .optional()
        .map_err(sqlite_err)?;
    match maybe {
        Some((mut api, required)) => {
            api.required_scopes = from_json_text(&required)?;
            Ok(Some(api))
        }
        None => Ok(None),
    }
}

fn row_to_api_scope(row: &rusqlite::Row) -> rusqlite::Result<(ApiScope, String, String)> {
    let name_i18n: String = row.get(4)?;
    let description_i18n: String = row.get(5)?;
    Ok((
        ApiScope {
            identifier: row.get(0)?,
            domain: row.get(1)?,
            api_name: row.get(2)?,
            specifier: row.get(3)?,
            name_i18n: BTreeMap::new(),
            description_i18n: BTreeMap::new(),
        },
        name_i18n,
        description_i18n,
    ))
}

const API_SCOPE_COLS: &str =
    "identifier, domain, api_name, specifier, name_i18n, description_i18n";

fn finish_api_scope(
    parts: (ApiScope, String, String),
) -> Result<ApiScope, OperationError> {
    let (mut scope, name, description) = parts;
    scope.name_i18n = from_json_text(&name)?;
    scope.description_i18n = from_json_text(&description)?;
    Ok(scope)
}

pub(crate) fn api_scope_upsert(txn: &Transaction, scope: &ApiScope) -> Result<(), OperationError> {
    txn.execute(
        "INSERT INTO api_scopes (identifier, domain, api_name, specifier, name_i18n, \
             description_i18n)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (identifier) DO UPDATE SET
            name_i18n = excluded.name_i18n,
            description_i18n = excluded.description_i18n",
        params![
            scope.identifier,
            scope.domain,
            scope.api_name,
            scope.specifier,
            to_json_text(&scope.name_i18n)?,
            to_json_text(&scope.description_i18n)?,
        ],
    )
    .map_err(sqlite_err)?;
    Ok(())
}

pub(crate) fn api_scopes_all(txn: &Transaction) -> Result<Vec<ApiScope>, OperationError> {
    let mut stmt = txn
        .prepare(&format!("SELECT {API_SCOPE_COLS} FROM api_scopes"))
        .map_err(sqlite_err)?;
    let parts = stmt
        .query_map([], row_to_api_scope)
        .map_err(sqlite_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sqlite_err)?;
    parts.into_iter().map(finish_api_scope).collect()
}

pub(crate) fn api_scope_allow_client(
    txn: &Transaction,
    scope_identifier: &str,
    client_id: &str,
) -> Result<(), OperationError> {
    txn.execute(
        "INSERT OR IGNORE INTO api_scope_clients (scope_identifier, client_id) VALUES (?1, ?2)",
        params![scope_identifier, client_id],
    )
    .map_err(sqlite_err)?;
    Ok(())
}

/// Api scope identifiers the given client has been granted access to.
pub(crate) fn api_scopes_for_client(
    txn: &Transaction,
    client_id: &str,
) -> Result<BTreeSet<String>, OperationError> {
    let mut stmt = txn
        .prepare("SELECT scope_identifier FROM api_scope_clients WHERE client_id = ?1")
        .map_err(sqlite_err)?;
    let scopes = stmt
        .query_map(params![client_id], |row| row.get::<_, String>(0))
        .map_err(sqlite_err)?
        .collect::<Result<BTreeSet<_>, _>>()
        .map_err(sqlite_err)?;
    Ok(scopes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::be::Db;
    use crate::idm::clients::{client_upsert, Client, ClientOptions, ClientType};

    fn test_client(client_id: &str) -> Client {
        Client {
            client_id: client_id.to_string(),
            client_secret: "s".to_string(),
            client_type: ClientType::Confidential,
            name: client_id.to_string(),
            response_types: BTreeSet::new(),
            redirect_uris: Vec::new(),
            post_logout_redirect_uris: Vec::new(),
            scope_allowlist: None,
            require_consent: false,
            options: ClientOptions::default(),
        }
    }

    fn test_api() -> Api {
        Api {
            domain: "https://api.example.com/auth".to_string(),
            name: "exampleapi".to_string(),
            required_scopes: Vec::new(),
            oidc_client_id: None,
            backchannel_logout_url: None,
        }
    }

    #[test]
    fn test_identifier_derivation() {
        let api = test_api();
        assert_eq!(api.identifier(), "https://api.example.com/auth/exampleapi");
        assert_eq!(api.required_scopes(), vec![api.identifier()]);

        let scope = ApiScope::new(&api, None, BTreeMap::new(), BTreeMap::new());
        assert_eq!(scope.identifier, "https://api.example.com/auth/exampleapi");

        let scope = ApiScope::new(&api, Some("readonly"), BTreeMap::new(), BTreeMap::new());
        assert_eq!(
            scope.identifier,
            "https://api.example.com/auth/exampleapi.readonly"
        );

        // Blank specifiers collapse to none.
        let scope = ApiScope::new(&api, Some("  "), BTreeMap::new(), BTreeMap::new());
        assert_eq!(scope.specifier, None);
    }

    #[test]
    fn test_localised_name() {
        let api = test_api();
        let mut names = BTreeMap::new();
        names.insert("en".to_string(), "Example".to_string());
        names.insert("fi".to_string(), "Esimerkki".to_string());
        let scope = ApiScope::new(&api, None, names, BTreeMap::new());
        assert_eq!(
            scope.localised_name(&["fi".to_string()]),
            Some("Esimerkki")
        );
        // Unknown locale falls back to english.
        assert_eq!(scope.localised_name(&["sv".to_string()]), Some("Example"));
    }

    #[tokio::test]
    async fn test_api_scope_client_grants() {
        let db = Db::new(":memory:").expect("failed to open db");
        let api = test_api();
        let scope = ApiScope::new(&api, Some("readonly"), BTreeMap::new(), BTreeMap::new());

        db.with_write(|txn| {
            client_upsert(txn, &test_client("app"))?;
            api_upsert(txn, &api)?;
            api_scope_upsert(txn, &scope)?;
            api_scope_allow_client(txn, &scope.identifier, "app")
        })
        .await
        .expect("setup failed");

        let granted = db
            .with_read(|txn| api_scopes_for_client(txn, "app"))
            .await
            .expect("read failed");
        assert!(granted.contains(&scope.identifier));
        let none = db
            .with_read(|txn| api_scopes_for_client(txn, "other"))
            .await
            .expect("read failed");
        assert!(none.is_empty());
    }
}
