//! API token minting.
//!
//! A bearer access token is traded for one JWT per API the token's scopes
//! reach. Only scopes that are registered API scopes AND granted to the
//! requesting client are honoured; everything else in the token's scope set
//! is silently ignored. Each minted JWT is audienced to its API and carries
//! the scopes as an authorization claim keyed by the API domain.

use rusqlite::Transaction;

use tunnistamo_proto::oauth2::ApiTokenResponse;
use tunnistamo_proto::oidc::IdTokenClaims;

use crate::idm::apis::{self, Api};
use crate::idm::codec::JwsSigner;
use crate::idm::keys;
use crate::idm::oauth2::{self, Oauth2Error};
use crate::idm::server::IdmServer;
use crate::idm::session::{self, ElementKind, TunnistamoSession};
use crate::idm::users;
use crate::prelude::*;

impl IdmServer {
    /// Mint API tokens for every API reachable by the access token's scopes.
    #[instrument(level = "debug", skip_all)]
    pub async fn oauth2_api_tokens(
        &self,
        access_token: &str,
        ct: Duration,
    ) -> Result<ApiTokenResponse, Oauth2Error> {
        let access_token = access_token.to_string();
        self.db
            .with_read(|txn| {
                let token = match oauth2::token_by_access(txn, &access_token)? {
                    Some(token) if token.is_valid_at(ct) => token,
                    _ => return Ok(Err(Oauth2Error::InvalidToken)),
                };
                let session = match session::session_for_element(
                    txn,
                    ElementKind::Token,
                    &token.id.to_string(),
                )? {
                    Some(session) if session.is_active() => session,
                    _ => return Ok(Err(Oauth2Error::InvalidToken)),
                };

                let allowed = apis::api_scopes_for_client(txn, &token.client_id)?;
                let known = apis::api_scopes_all(txn)?;

                // Scope identifier -> owning api, for the granted subset.
                let mut per_api: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();
                for scope in &known {
                    if token.scope.contains(&scope.identifier)
                        && allowed.contains(&scope.identifier)
                    {
                        per_api
                            .entry((scope.domain.clone(), scope.api_name.clone()))
                            .or_default()
                            .push(scope.identifier.clone());
                    }
                }

                let mut out = ApiTokenResponse::default();
                for ((domain, api_name), identifiers) in per_api {
                    let api = match apis::api_get(txn, &domain, &api_name)? {
                        Some(api) => api,
                        None => continue,
                    };
                    let jws = self.mint_api_token(
                        txn,
                        &api,
                        &identifiers,
                        &token.client_id,
                        &session,
                        token.expires_at,
                        ct,
                    )?;
                    out.0.insert(api.identifier(), jws);
                }
                security_access!(
                    client_id = %token.client_id,
                    session_id = %session.id,
                    count = out.0.len(),
                    "Minted api tokens"
                );
                Ok(Ok(out))
            })
            .await
            .map_err(Oauth2Error::ServerError)?
    }

    /// One RS256 JWT audienced to the api. The authorization claim is keyed
    /// by the api domain and lists the granted scopes relative to it. The
    /// api's required scopes pull the matching user claims into the token,
    /// identical to what userinfo would answer for those scopes.
    #[allow(clippy::too_many_arguments)]
    fn mint_api_token(
        &self,
        txn: &Transaction,
        api: &Api,
        scope_identifiers: &[String],
        client_id: &str,
        session: &TunnistamoSession,
        expires_at: i64,
        ct: Duration,
    ) -> Result<String, OperationError> {
        let domain_prefix = format!("{}/", api.domain.trim_end_matches('/'));
        let relative: Vec<serde_json::Value> = scope_identifiers
            .iter()
            .map(|id| {
                serde_json::Value::String(
                    id.strip_prefix(&domain_prefix).unwrap_or(id).to_string(),
                )
            })
            .collect();

        let user = users::user_get(txn, session.user_uuid)?
            .ok_or(OperationError::InvalidSessionState)?;
        let client = self.client(client_id);
        let required: BTreeSet<String> = api.required_scopes.iter().cloned().collect();
        let mut extra =
            oauth2::user_claims_for_scopes(txn, &user, &required, client.as_deref())?;
        extra.insert(api.domain.clone(), serde_json::Value::Array(relative));

        let claims = IdTokenClaims {
            iss: self.config.issuer.clone(),
            sub: session.user_uuid.to_string(),
            aud: api.identifier(),
            // The api token never outlives the access token it was minted
            // from.
            exp: expires_at,
            iat: ct.as_secs() as i64,
            auth_time: session.data.auth_time,
            nonce: None,
            at_hash: None,
            azp: Some(client_id.to_string()),
            amr: session.data.auth_method.clone(),
            loa: session.data.loa.clone(),
            sid: Some(session.id.to_string()),
            extra,
        };
        let record = keys::active_signing_key(txn)?
            .ok_or(OperationError::KeyObjectNoActiveSigningKey)?;
        JwsSigner::from_record(&record)?
            .sign(&claims)
            .map_err(OperationError::from)
    }
}
