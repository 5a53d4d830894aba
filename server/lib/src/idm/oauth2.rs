//! The OAuth2 / OIDC authorisation server.
//!
//! Everything issued here is bound to the Tunnistamo session that was live
//! when the authorisation request was approved. An ended session invalidates
//! its codes and tokens at every later endpoint: the authorise endpoint
//! denies, the token endpoint answers `invalid_grant`, userinfo answers
//! `invalid_token` and introspection reports the token inactive.
//!
//! Codes and access/refresh tokens are opaque random strings; only id tokens
//! and api tokens are JWTs.

use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{Algorithm, Validation};
use openssl::sha;
use rusqlite::{params, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};

use tunnistamo_proto::jwk::JwkKeySet;
use tunnistamo_proto::oauth2::{
    AccessTokenIntrospectRequest, AccessTokenIntrospectResponse, AccessTokenRequest,
    AccessTokenResponse, AccessTokenType, AuthorisationRequest, ClientPostAuth,
    CodeChallengeMethod, GrantType, GrantTypeReq, IdTokenSignAlg, OidcDiscoveryResponse, PkceAlg,
    ResponseMode, SubjectType, TokenEndpointAuthMethod,
};
use tunnistamo_proto::oidc::{IdTokenClaims, UserInfoResponse};

use crate::be::sqlite_err;
use crate::idm::apis;
use crate::idm::clients::Client;
use crate::idm::codec::{self, JwsSigner};
use crate::idm::consent;
use crate::idm::keys;
use crate::idm::pipeline;
use crate::idm::server::IdmServer;
use crate::idm::session::{self, ElementKind, TunnistamoSession};
use crate::idm::users::{self, User};
use crate::idm::websession;
use crate::prelude::*;
use crate::utils::generate_opaque_token;

const CONSENT_TICKET_EXPIRY_SECONDS: u64 = 600;

/// RFC 6749 / OIDC protocol errors, rendered in their wire form by
/// `Display`. Server faults are carried so the HTTP layer can answer 500
/// instead of a protocol error the client would retry forever.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Oauth2Error {
    InvalidRequest,
    InvalidClient,
    InvalidGrant,
    AccessDenied,
    UnauthorisedClient,
    UnsupportedGrantType,
    UnsupportedResponseType,
    InvalidScope,
    /// RFC 6750, for the bearer protected endpoints.
    InvalidToken,
    ServerError(OperationError),
}

impl fmt::Display for Oauth2Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Oauth2Error::InvalidRequest => "invalid_request",
            Oauth2Error::InvalidClient => "invalid_client",
            Oauth2Error::InvalidGrant => "invalid_grant",
            Oauth2Error::AccessDenied => "access_denied",
            Oauth2Error::UnauthorisedClient => "unauthorized_client",
            Oauth2Error::UnsupportedGrantType => "unsupported_grant_type",
            Oauth2Error::UnsupportedResponseType => "unsupported_response_type",
            Oauth2Error::InvalidScope => "invalid_scope",
            Oauth2Error::InvalidToken => "invalid_token",
            Oauth2Error::ServerError(_) => "server_error",
        })
    }
}

impl From<OperationError> for Oauth2Error {
    fn from(err: OperationError) -> Self {
        Oauth2Error::ServerError(err)
    }
}

/// A single use authorisation code, stored server side and handed to the
/// client as the opaque `code` value.
#[derive(Debug, Clone)]
pub struct AuthorisationCode {
    pub id: Uuid,
    pub code: String,
    pub user_uuid: Uuid,
    pub client_id: String,
    pub scope: BTreeSet<String>,
    pub nonce: Option<String>,
    /// True when `openid` was in scope - the exchange mints an id token.
    pub is_authentication: bool,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<CodeChallengeMethod>,
    pub redirect_uri: Url,
    pub expires_at: i64,
}

/// An issued access token, with its optional refresh token and the id token
/// that was minted beside it.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub id: Uuid,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub user_uuid: Uuid,
    pub client_id: String,
    pub scope: BTreeSet<String>,
    pub id_token: Option<String>,
    pub nonce: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
}

impl IssuedToken {
    pub fn is_valid_at(&self, ct: Duration) -> bool {
        self.expires_at > ct.as_secs() as i64
    }
}

/// The outcome of an authorisation request.
#[derive(Debug)]
pub enum AuthoriseResponse {
    /// No web login fit to serve this request: missing, anonymous, or a
    /// fresh upstream authentication is demanded by policy.
    LoginRequired { reauthenticate: bool },
    /// The user has to approve the requested scopes first.
    ConsentRequired {
        client_name: String,
        scopes: BTreeSet<String>,
        consent_token: String,
    },
    /// Protocol error that is reported by redirecting back to the client.
    Denied {
        redirect_uri: Url,
        state: Option<String>,
        error: &'static str,
    },
    Permitted(AuthorisePermitSuccess),
}

/// The artifacts to encode into the redirect, per the response mode.
#[derive(Debug)]
pub struct AuthorisePermitSuccess {
    pub redirect_uri: Url,
    pub response_mode: ResponseMode,
    pub state: Option<String>,
    pub code: Option<String>,
    pub access_token: Option<String>,
    pub expires_in: Option<u32>,
    pub id_token: Option<String>,
}

/// Short lived HS256 ticket carried through the consent view. Binds the
/// pending grant to the user and the exact scope set shown to them.
#[derive(Debug, Serialize, Deserialize)]
struct ConsentTicket {
    sub: String,
    client_id: String,
    scope: Vec<String>,
    exp: i64,
}

impl IdmServer {
    /// Process an authorisation request against the current web login.
    #[instrument(level = "debug", skip_all)]
    pub async fn check_oauth2_authorisation(
        &self,
        websession_key: Option<&str>,
        auth_req: &AuthorisationRequest,
        ct: Duration,
    ) -> Result<AuthoriseResponse, Oauth2Error> {
        let client = self.client(&auth_req.client_id).ok_or_else(|| {
            security_error!(client_id = %auth_req.client_id, "Authorisation request for unknown client");
            Oauth2Error::InvalidClient
        })?;

        // Errors up to and including the redirect_uri check must never
        // redirect; the uri is not yet trusted.
        if !client.redirect_uri_matches(&auth_req.redirect_uri) {
            security_error!(
                client_id = %client.client_id,
                redirect_uri = %auth_req.redirect_uri,
                "Authorisation request with unregistered redirect_uri"
            );
            return Err(Oauth2Error::InvalidRequest);
        }

        let response_mode = auth_req
            .get_response_mode()
            .ok_or(Oauth2Error::InvalidRequest)?;

        if !client
            .response_types
            .contains(&auth_req.response_type.to_string())
        {
            return Err(Oauth2Error::UnsupportedResponseType);
        }

        // The implicit and hybrid id_token flows have no token endpoint
        // round trip, so the nonce is the only replay defence.
        if auth_req.response_type.id_token && auth_req.nonce.is_none() {
            return Err(Oauth2Error::InvalidRequest);
        }

        if auth_req.scope.is_empty() {
            return Err(Oauth2Error::InvalidScope);
        }
        if let Some(allow) = &client.scope_allowlist {
            if !auth_req.scope.is_subset(allow) {
                return Err(Oauth2Error::InvalidScope);
            }
        }

        let websession_key = websession_key.map(str::to_string);
        self.db
            .with_write(|txn| {
                Ok(self.authorise_txn(
                    txn,
                    &client,
                    websession_key.as_deref(),
                    auth_req,
                    response_mode,
                    ct,
                ))
            })
            .await
            .map_err(Oauth2Error::ServerError)?
    }

    fn authorise_txn(
        &self,
        txn: &Transaction,
        client: &Client,
        websession_key: Option<&str>,
        auth_req: &AuthorisationRequest,
        response_mode: ResponseMode,
        ct: Duration,
    ) -> Result<AuthoriseResponse, Oauth2Error> {
        let prompt = auth_req.prompt_set();
        let prompt_none = prompt.contains("none");
        let first_authz = auth_req.first_authz.unwrap_or(false);

        let login_required = |reauthenticate: bool| {
            if prompt_none {
                AuthoriseResponse::Denied {
                    redirect_uri: auth_req.redirect_uri.clone(),
                    state: auth_req.state.clone(),
                    error: "login_required",
                }
            } else {
                AuthoriseResponse::LoginRequired { reauthenticate }
            }
        };

        let mut websession = match websession_key {
            Some(key) => websession::websession_get(txn, key, ct)?,
            None => None,
        };

        // `ui_locales` overrides the detected display language for the rest
        // of the flow. The first supported candidate wins and sticks to the
        // browser session, also when the login is still ahead.
        if let Some(ws) = websession.as_mut() {
            let resolved = auth_req
                .ui_locale_candidates()
                .into_iter()
                .find(|cand| self.config.supported_ui_locales.iter().any(|l| l == cand));
            if let Some(language) = resolved {
                if ws.data.language.as_deref() != Some(language) {
                    ws.data.language = Some(language.to_string());
                    websession::websession_update(txn, ws)?;
                }
            }
        }

        let websession = match websession {
            Some(ws) if ws.is_authenticated() => ws,
            _ => return Ok(login_required(false)),
        };

        if (prompt.contains("login") || prompt.contains("select_account")) && !first_authz {
            return Ok(login_required(true));
        }

        let session = match websession
            .data
            .tunnistamo_session_id
            .map(|id| session::session_get(txn, id))
            .transpose()?
            .flatten()
        {
            Some(session) => session,
            None => return Ok(login_required(false)),
        };
        if !session.is_active() {
            security_info!(
                session_id = %session.id,
                client_id = %client.client_id,
                "Authorisation request against an ended session"
            );
            return Ok(AuthoriseResponse::Denied {
                redirect_uri: auth_req.redirect_uri.clone(),
                state: auth_req.state.clone(),
                error: "access_denied",
            });
        }

        if let Some(method) = session.data.auth_method.as_deref() {
            // A session minted through a provider this client does not accept
            // cannot be upgraded; the web login has to be redone.
            if !client.login_method_allowed(method) {
                security_info!(
                    client_id = %client.client_id,
                    auth_method = %method,
                    "Login method not allowed for client, forcing re-authentication"
                );
                return Ok(login_required(true));
            }
            if self.config.backend_always_reauthenticates(method) && !first_authz {
                return Ok(login_required(true));
            }
        }

        if let Some(max_age) = auth_req.max_age {
            let auth_time = session.data.auth_time.unwrap_or(session.created_at);
            if ct.as_secs() as i64 - auth_time > max_age {
                return Ok(login_required(true));
            }
        }

        let user = users::user_get(txn, session.user_uuid)?
            .ok_or(OperationError::InvalidSessionState)?;

        if client.require_consent {
            // Requested api scopes pull their api's required scopes onto the
            // consent page, so the user approves the identity data the api
            // will receive, not just the scope identifier.
            let mut consent_scope = auth_req.scope.clone();
            for api_scope in apis::api_scopes_all(txn)? {
                if !auth_req.scope.contains(&api_scope.identifier) {
                    continue;
                }
                if let Some(api) = apis::api_get(txn, &api_scope.domain, &api_scope.api_name)? {
                    consent_scope.extend(api.required_scopes.iter().cloned());
                }
            }
            let consented = consent::consent_get(txn, user.uuid, &client.client_id)?
                .map(|c| c.is_valid_at(ct) && c.covers(&consent_scope))
                .unwrap_or(false);
            if !consented {
                if prompt_none {
                    return Ok(AuthoriseResponse::Denied {
                        redirect_uri: auth_req.redirect_uri.clone(),
                        state: auth_req.state.clone(),
                        error: "consent_required",
                    });
                }
                let ticket = ConsentTicket {
                    sub: user.uuid.to_string(),
                    client_id: client.client_id.clone(),
                    scope: consent_scope.iter().cloned().collect(),
                    exp: (ct.as_secs() + CONSENT_TICKET_EXPIRY_SECONDS) as i64,
                };
                let consent_token =
                    codec::hs_sign(Algorithm::HS256, &self.consent_secret, &ticket)
                        .map_err(OperationError::from)?;
                return Ok(AuthoriseResponse::ConsentRequired {
                    client_name: client.name.clone(),
                    scopes: consent_scope,
                    consent_token,
                });
            }
        }

        self.authorise_permit(txn, client, &session, &user, auth_req, response_mode, ct)
    }

    /// Issue the artifacts the response type asks for and bind them to the
    /// session.
    #[allow(clippy::too_many_arguments)]
    fn authorise_permit(
        &self,
        txn: &Transaction,
        client: &Client,
        session: &TunnistamoSession,
        user: &User,
        auth_req: &AuthorisationRequest,
        response_mode: ResponseMode,
        ct: Duration,
    ) -> Result<AuthoriseResponse, Oauth2Error> {
        let rt = auth_req.response_type;
        let is_authentication = auth_req.scope.contains(OAUTH2_SCOPE_OPENID);

        let mut out = AuthorisePermitSuccess {
            redirect_uri: auth_req.redirect_uri.clone(),
            response_mode,
            state: auth_req.state.clone(),
            code: None,
            access_token: None,
            expires_in: None,
            id_token: None,
        };

        if rt.code {
            let code = AuthorisationCode {
                id: Uuid::new_v4(),
                code: generate_opaque_token(),
                user_uuid: user.uuid,
                client_id: client.client_id.clone(),
                scope: auth_req.scope.clone(),
                nonce: auth_req.nonce.clone(),
                is_authentication,
                code_challenge: auth_req
                    .pkce_request
                    .as_ref()
                    .map(|p| p.code_challenge.clone()),
                code_challenge_method: auth_req.pkce_request.as_ref().map(|p| p.code_challenge_method),
                redirect_uri: auth_req.redirect_uri.clone(),
                expires_at: (ct + self.config.code_expiry).as_secs() as i64,
            };
            code_insert(txn, &code)?;
            session::element_add(txn, session.id, ElementKind::Code, &code.id.to_string(), ct)?;
            security_access!(
                client_id = %client.client_id,
                user_uuid = %user.uuid,
                session_id = %session.id,
                "Issued authorisation code"
            );
            out.code = Some(code.code);
        }

        if rt.token {
            // Implicit access tokens never carry a refresh token.
            let token = self.mint_token(
                txn,
                client,
                session,
                user,
                &auth_req.scope,
                auth_req.nonce.clone(),
                false,
                rt.id_token && is_authentication,
                ct,
            )?;
            out.expires_in = Some(self.config.token_expiry.as_secs() as u32);
            out.id_token = token.id_token.clone();
            out.access_token = Some(token.access_token);
        } else if rt.id_token && is_authentication {
            // id_token-only implicit flow: nothing stored, nothing to bind.
            out.id_token = Some(self.sign_id_token(
                txn,
                &client.client_id,
                session,
                auth_req.nonce.clone(),
                None,
                ct,
            )?);
        }

        Ok(AuthoriseResponse::Permitted(out))
    }

    /// Store a consent decision carried in a consent ticket. The authorise
    /// request is re-run by the caller afterwards.
    #[instrument(level = "debug", skip_all)]
    pub async fn oauth2_consent_permit(
        &self,
        websession_key: &str,
        consent_token: &str,
        ct: Duration,
    ) -> Result<(), OperationError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = DEFAULT_JWT_LEEWAY;
        validation.validate_aud = false;
        // Expiry is checked against the operation clock below.
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        let ticket: ConsentTicket =
            codec::hs_verify(&self.consent_secret, consent_token, &validation)
                .map_err(|_| OperationError::AccessDenied)?;
        if ticket.exp <= ct.as_secs() as i64 {
            return Err(OperationError::SessionExpired);
        }
        let user_uuid =
            Uuid::parse_str(&ticket.sub).map_err(|_| OperationError::InvalidRequestState)?;

        let lifetime = self.config.consent_lifetime;
        self.db
            .with_write(move |txn| {
                let websession = websession::websession_get(txn, websession_key, ct)?
                    .ok_or(OperationError::NotAuthenticated)?;
                if websession.user_uuid != Some(user_uuid) {
                    security_error!(
                        %user_uuid,
                        "Consent ticket presented by a different web login"
                    );
                    return Err(OperationError::AccessDenied);
                }
                let scopes: BTreeSet<String> = ticket.scope.iter().cloned().collect();
                consent::consent_grant(txn, user_uuid, &ticket.client_id, &scopes, ct, lifetime)?;
                security_info!(
                    %user_uuid,
                    client_id = %ticket.client_id,
                    "Recorded user consent"
                );
                Ok(())
            })
            .await
    }

    /// The token endpoint: authorisation code and refresh token grants.
    #[instrument(level = "debug", skip_all)]
    pub async fn check_oauth2_token_exchange(
        &self,
        client_authz: Option<(&str, &str)>,
        req: &AccessTokenRequest,
        ct: Duration,
    ) -> Result<AccessTokenResponse, Oauth2Error> {
        let client = self.authenticate_client(client_authz, &req.client_post_auth)?;
        match &req.grant_type {
            GrantTypeReq::AuthorizationCode {
                code,
                redirect_uri,
                code_verifier,
            } => {
                self.token_exchange_code(
                    client,
                    code.clone(),
                    redirect_uri.clone(),
                    code_verifier.clone(),
                    ct,
                )
                .await
            }
            GrantTypeReq::RefreshToken {
                refresh_token,
                scope,
            } => {
                self.token_exchange_refresh(client, refresh_token.clone(), scope.clone(), ct)
                    .await
            }
        }
    }

    async fn token_exchange_code(
        &self,
        client: Arc<Client>,
        code: String,
        redirect_uri: Url,
        code_verifier: Option<String>,
        ct: Duration,
    ) -> Result<AccessTokenResponse, Oauth2Error> {
        self.db
            .with_write(|txn| {
                // Single use: taken here, gone for any replay.
                let code_rec = match code_take(txn, &code)? {
                    Some(rec) => rec,
                    None => {
                        security_error!(client_id = %client.client_id, "Unknown or replayed authorisation code");
                        return Ok(Err(Oauth2Error::InvalidGrant));
                    }
                };
                if code_rec.client_id != client.client_id {
                    security_error!(
                        client_id = %client.client_id,
                        issued_to = %code_rec.client_id,
                        "Authorisation code presented by the wrong client"
                    );
                    return Ok(Err(Oauth2Error::InvalidGrant));
                }
                if code_rec.expires_at <= ct.as_secs() as i64 {
                    return Ok(Err(Oauth2Error::InvalidGrant));
                }
                if let Err(err) = verify_pkce(&code_rec, code_verifier.as_deref(), &client.client_id) {
                    return Ok(Err(err));
                }
                if code_rec.redirect_uri.as_str() != redirect_uri.as_str() {
                    return Ok(Err(Oauth2Error::InvalidGrant));
                }

                let session = match session::session_for_element(
                    txn,
                    ElementKind::Code,
                    &code_rec.id.to_string(),
                )? {
                    Some(session) if session.is_active() => session,
                    _ => {
                        security_info!(
                            client_id = %client.client_id,
                            "Token exchange against a missing or ended session"
                        );
                        return Ok(Err(Oauth2Error::InvalidGrant));
                    }
                };
                let user = users::user_get(txn, session.user_uuid)?
                    .ok_or(OperationError::InvalidSessionState)?;

                // Restricted backends get no refresh token; their access ends
                // with the short session.
                let restricted = session
                    .data
                    .auth_method
                    .as_deref()
                    .map(|m| self.config.backend_is_restricted(m))
                    .unwrap_or(false);

                let token = self.mint_token(
                    txn,
                    &client,
                    &session,
                    &user,
                    &code_rec.scope,
                    code_rec.nonce.clone(),
                    !restricted,
                    code_rec.is_authentication,
                    ct,
                )?;
                security_access!(
                    client_id = %client.client_id,
                    user_uuid = %user.uuid,
                    session_id = %session.id,
                    "Issued access token"
                );
                Ok(Ok(token_response(token, self.config.token_expiry)))
            })
            .await
            .map_err(Oauth2Error::ServerError)?
    }

    async fn token_exchange_refresh(
        &self,
        client: Arc<Client>,
        refresh_token: String,
        scope: Option<BTreeSet<String>>,
        ct: Duration,
    ) -> Result<AccessTokenResponse, Oauth2Error> {
        self.db
            .with_write(|txn| {
                let mut token = match token_by_refresh(txn, &refresh_token)? {
                    Some(token) => token,
                    None => return Ok(Err(Oauth2Error::InvalidGrant)),
                };
                if token.client_id != client.client_id {
                    security_error!(
                        client_id = %client.client_id,
                        issued_to = %token.client_id,
                        "Refresh token presented by the wrong client"
                    );
                    return Ok(Err(Oauth2Error::InvalidGrant));
                }
                // Narrowing is allowed, widening is not.
                if let Some(requested) = &scope {
                    if !requested.is_subset(&token.scope) {
                        return Ok(Err(Oauth2Error::InvalidScope));
                    }
                    token.scope = requested.clone();
                }

                let session = match session::session_for_element(
                    txn,
                    ElementKind::Token,
                    &token.id.to_string(),
                )? {
                    Some(session) if session.is_active() => session,
                    _ => {
                        security_info!(
                            client_id = %client.client_id,
                            "Refresh attempt against a missing or ended session"
                        );
                        return Ok(Err(Oauth2Error::InvalidGrant));
                    }
                };

                // Rotate in place. The session binding keys on the token id,
                // so it survives the rotation; the previous refresh token
                // stops resolving.
                token.access_token = generate_opaque_token();
                token.refresh_token = Some(generate_opaque_token());
                token.created_at = ct.as_secs() as i64;
                token.expires_at = (ct + self.config.token_expiry).as_secs() as i64;
                token.id_token = if token.scope.contains(OAUTH2_SCOPE_OPENID) {
                    // Claims are re-derived from the live session, not copied
                    // from the previous id token.
                    Some(self.sign_id_token(
                        txn,
                        &client.client_id,
                        &session,
                        token.nonce.clone(),
                        Some(&token.access_token),
                        ct,
                    )?)
                } else {
                    None
                };
                token_update(txn, &token)?;
                security_access!(
                    client_id = %client.client_id,
                    session_id = %session.id,
                    "Rotated refresh token"
                );
                Ok(Ok(token_response(token, self.config.token_expiry)))
            })
            .await
            .map_err(Oauth2Error::ServerError)?
    }

    /// The userinfo document for a bearer access token.
    #[instrument(level = "debug", skip_all)]
    pub async fn oauth2_openid_userinfo(
        &self,
        access_token: &str,
        ct: Duration,
    ) -> Result<UserInfoResponse, Oauth2Error> {
        let access_token = access_token.to_string();
        self.db
            .with_read(|txn| {
                let token = match token_by_access(txn, &access_token)? {
                    Some(token) if token.is_valid_at(ct) => token,
                    _ => return Ok(Err(Oauth2Error::InvalidToken)),
                };
                if !token.scope.contains(OAUTH2_SCOPE_OPENID) {
                    return Ok(Err(Oauth2Error::InvalidToken));
                }
                match session::session_for_element(txn, ElementKind::Token, &token.id.to_string())?
                {
                    Some(session) if session.is_active() => {}
                    _ => return Ok(Err(Oauth2Error::InvalidToken)),
                }
                let user = users::user_get(txn, token.user_uuid)?
                    .ok_or(OperationError::InvalidSessionState)?;
                let client = self.client(&token.client_id);

                Ok(Ok(build_userinfo(txn, &user, &token, client.as_deref())?))
            })
            .await
            .map_err(Oauth2Error::ServerError)?
    }

    /// RFC 7662 introspection. Requires client authentication; anything
    /// invalid, expired or bound to an ended session is simply inactive.
    #[instrument(level = "debug", skip_all)]
    pub async fn oauth2_token_introspect(
        &self,
        client_authz: Option<(&str, &str)>,
        req: &AccessTokenIntrospectRequest,
        ct: Duration,
    ) -> Result<AccessTokenIntrospectResponse, Oauth2Error> {
        let _client = self.authenticate_client(client_authz, &req.client_post_auth)?;
        let presented = req.token.clone();
        let issuer = self.config.issuer.clone();
        self.db
            .with_read(move |txn| {
                let token = match token_by_access(txn, &presented)? {
                    Some(token) => Some(token),
                    None => token_by_refresh(txn, &presented)?,
                };
                let token = match token {
                    Some(token) if token.is_valid_at(ct) => token,
                    _ => return Ok(AccessTokenIntrospectResponse::inactive()),
                };
                match session::session_for_element(txn, ElementKind::Token, &token.id.to_string())?
                {
                    Some(session) if session.is_active() => {}
                    _ => return Ok(AccessTokenIntrospectResponse::inactive()),
                }
                let user = users::user_get(txn, token.user_uuid)?
                    .ok_or(OperationError::InvalidSessionState)?;
                Ok(AccessTokenIntrospectResponse {
                    active: true,
                    scope: token.scope.clone(),
                    client_id: Some(token.client_id.clone()),
                    username: Some(user.username),
                    token_type: Some(AccessTokenType::Bearer),
                    exp: Some(token.expires_at),
                    iat: Some(token.created_at),
                    nbf: Some(token.created_at),
                    sub: Some(user.uuid.to_string()),
                    aud: Some(token.client_id),
                    iss: Some(issuer),
                })
            })
            .await
            .map_err(Oauth2Error::ServerError)
    }

    /// The OIDC discovery document.
    pub async fn oauth2_openid_discovery(&self) -> Result<OidcDiscoveryResponse, OperationError> {
        let issuer =
            Url::parse(&self.config.issuer).map_err(|_| OperationError::InvalidState)?;
        let join = |path: &str| {
            issuer
                .join(path)
                .map_err(|_| OperationError::InvalidState)
        };
        let authorization_endpoint = join("/openid/authorize/")?;
        let token_endpoint = join("/openid/token/")?;
        let userinfo_endpoint = join("/openid/userinfo/")?;
        let end_session_endpoint = join("/openid/end-session/")?;
        let introspection_endpoint = join("/openid/introspect/")?;
        let jwks_uri = join("/openid/jwks/")?;

        let mut scopes = vec![
            OAUTH2_SCOPE_OPENID.to_string(),
            OAUTH2_SCOPE_PROFILE.to_string(),
            OAUTH2_SCOPE_EMAIL.to_string(),
            OAUTH2_SCOPE_AD_GROUPS.to_string(),
            OAUTH2_SCOPE_GITHUB_USERNAME.to_string(),
            OAUTH2_SCOPE_LOGIN_ENTRIES.to_string(),
            OAUTH2_SCOPE_CONSENTS.to_string(),
            OAUTH2_SCOPE_IDENTITIES.to_string(),
            OAUTH2_SCOPE_DEVICES.to_string(),
        ];
        let api_scopes = self
            .db
            .with_read(|txn| apis::api_scopes_all(txn))
            .await?;
        scopes.extend(api_scopes.into_iter().map(|s| s.identifier));

        Ok(OidcDiscoveryResponse {
            issuer,
            authorization_endpoint,
            token_endpoint,
            userinfo_endpoint: Some(userinfo_endpoint),
            end_session_endpoint: Some(end_session_endpoint),
            introspection_endpoint: Some(introspection_endpoint),
            jwks_uri,
            registration_endpoint: None,
            scopes_supported: Some(scopes),
            response_types_supported: vec![
                "code".to_string(),
                "id_token".to_string(),
                "id_token token".to_string(),
                "code token".to_string(),
                "code id_token".to_string(),
                "code id_token token".to_string(),
            ],
            response_modes_supported: vec![
                ResponseMode::Query,
                ResponseMode::Fragment,
                ResponseMode::FormPost,
            ],
            grant_types_supported: vec![
                GrantType::AuthorisationCode,
                GrantType::Implicit,
                GrantType::RefreshToken,
            ],
            acr_values_supported: None,
            subject_types_supported: vec![SubjectType::Public],
            id_token_signing_alg_values_supported: vec![IdTokenSignAlg::RS256],
            userinfo_signing_alg_values_supported: None,
            request_object_signing_alg_values_supported: None,
            token_endpoint_auth_methods_supported: vec![
                TokenEndpointAuthMethod::ClientSecretBasic,
                TokenEndpointAuthMethod::ClientSecretPost,
            ],
            token_endpoint_auth_signing_alg_values_supported: None,
            claims_supported: Some(
                [
                    "sub",
                    "email",
                    "given_name",
                    "family_name",
                    "name",
                    "nickname",
                    "preferred_username",
                    "auth_time",
                    "nonce",
                    "at_hash",
                    "azp",
                    "amr",
                    "loa",
                    "sid",
                ]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            ),
            service_documentation: None,
            ui_locales_supported: Some(self.config.supported_ui_locales.clone()),
            claims_parameter_supported: false,
            op_policy_uri: None,
            op_tos_uri: None,
            code_challenge_methods_supported: vec![PkceAlg::S256, PkceAlg::Plain],
            backchannel_logout_supported: true,
            backchannel_logout_session_supported: true,
        })
    }

    /// The public JWKS document.
    pub async fn oauth2_openid_publickey(&self) -> Result<JwkKeySet, OperationError> {
        let cfg = self.config.key_config.clone();
        self.db
            .with_read(move |txn| keys::jwks(txn, duration_from_epoch_now(), &cfg))
            .await
    }

    /// Resolve and authenticate the client at a token endpoint. Basic auth
    /// wins over post body credentials. Public clients need no secret.
    pub(crate) fn authenticate_client(
        &self,
        basic: Option<(&str, &str)>,
        post: &ClientPostAuth,
    ) -> Result<Arc<Client>, Oauth2Error> {
        let (client_id, secret) = match basic {
            Some((id, secret)) => (id.to_string(), Some(secret.to_string())),
            None => (
                post.client_id
                    .clone()
                    .ok_or(Oauth2Error::InvalidClient)?,
                post.client_secret.clone(),
            ),
        };
        let client = self.client(&client_id).ok_or_else(|| {
            security_error!(%client_id, "Token request for unknown client");
            Oauth2Error::InvalidClient
        })?;
        if client.is_public() {
            return Ok(client);
        }
        match secret {
            Some(secret) if !client.client_secret.is_empty() && secret == client.client_secret => {
                Ok(client)
            }
            _ => {
                security_error!(%client_id, "Client authentication failed");
                Err(Oauth2Error::InvalidClient)
            }
        }
    }

    /// Mint and store an access token bound to the session, optionally with
    /// a refresh token and an id token.
    #[allow(clippy::too_many_arguments)]
    fn mint_token(
        &self,
        txn: &Transaction,
        client: &Client,
        session: &TunnistamoSession,
        user: &User,
        scope: &BTreeSet<String>,
        nonce: Option<String>,
        with_refresh: bool,
        with_id_token: bool,
        ct: Duration,
    ) -> Result<IssuedToken, OperationError> {
        let mut token = IssuedToken {
            id: Uuid::new_v4(),
            access_token: generate_opaque_token(),
            refresh_token: with_refresh.then(generate_opaque_token),
            user_uuid: user.uuid,
            client_id: client.client_id.clone(),
            scope: scope.clone(),
            id_token: None,
            nonce: nonce.clone(),
            created_at: ct.as_secs() as i64,
            expires_at: (ct + self.config.token_expiry).as_secs() as i64,
        };
        if with_id_token {
            token.id_token = Some(self.sign_id_token(
                txn,
                &client.client_id,
                session,
                nonce,
                Some(&token.access_token),
                ct,
            )?);
        }
        token_insert(txn, &token)?;
        session::element_add(txn, session.id, ElementKind::Token, &token.id.to_string(), ct)?;
        Ok(token)
    }

    /// Assemble and sign an id token. Session claims (amr, loa, sid) always
    /// reflect the live session at signing time.
    pub(crate) fn sign_id_token(
        &self,
        txn: &Transaction,
        client_id: &str,
        session: &TunnistamoSession,
        nonce: Option<String>,
        access_token: Option<&str>,
        ct: Duration,
    ) -> Result<String, OperationError> {
        let claims = IdTokenClaims {
            iss: self.config.issuer.clone(),
            sub: session.user_uuid.to_string(),
            aud: client_id.to_string(),
            exp: (ct + self.config.token_expiry).as_secs() as i64,
            iat: ct.as_secs() as i64,
            auth_time: session.data.auth_time,
            nonce,
            at_hash: access_token.map(codec::at_hash),
            azp: Some(client_id.to_string()),
            amr: session.data.auth_method.clone(),
            loa: session.data.loa.clone(),
            sid: Some(session.id.to_string()),
            extra: BTreeMap::new(),
        };
        let record = keys::active_signing_key(txn)?
            .ok_or(OperationError::KeyObjectNoActiveSigningKey)?;
        let signer = JwsSigner::from_record(&record)?;
        signer.sign(&claims).map_err(OperationError::from)
    }
}

fn token_response(token: IssuedToken, expiry: Duration) -> AccessTokenResponse {
    AccessTokenResponse {
        access_token: token.access_token,
        token_type: AccessTokenType::Bearer,
        expires_in: expiry.as_secs() as u32,
        refresh_token: token.refresh_token,
        scope: token.scope,
        id_token: token.id_token,
    }
}

fn verify_pkce(
    code: &AuthorisationCode,
    verifier: Option<&str>,
    client_id: &str,
) -> Result<(), Oauth2Error> {
    match (&code.code_challenge, verifier) {
        (None, None) => Ok(()),
        (Some(challenge), Some(verifier)) => {
            let matched = match code.code_challenge_method {
                Some(CodeChallengeMethod::S256) | None => {
                    let digest = sha::sha256(verifier.as_bytes());
                    URL_SAFE_NO_PAD.encode(digest) == *challenge
                }
                Some(CodeChallengeMethod::Plain) => {
                    request_warn!(%client_id, "plain code_challenge_method in use");
                    verifier == challenge
                }
            };
            if matched {
                Ok(())
            } else {
                security_error!(%client_id, "PKCE verification failed");
                Err(Oauth2Error::InvalidGrant)
            }
        }
        // A challenge was bound at authorise time: the verifier is not
        // optional any more.
        (Some(_), None) => {
            security_error!(%client_id, "PKCE verifier missing at token exchange");
            Err(Oauth2Error::InvalidRequest)
        }
        (None, Some(_)) => Err(Oauth2Error::InvalidRequest),
    }
}

/// The user claims a scope set unlocks, as a flat claim map. Shared
/// between the userinfo document and api token minting so both surfaces
/// expose identical data for the same scopes.
pub(crate) fn user_claims_for_scopes(
    txn: &Transaction,
    user: &User,
    scopes: &BTreeSet<String>,
    client: Option<&Client>,
) -> Result<BTreeMap<String, serde_json::Value>, OperationError> {
    let non_empty = |s: &str| (!s.is_empty()).then(|| serde_json::Value::String(s.to_string()));

    let mut claims = BTreeMap::new();
    if scopes.contains(OAUTH2_SCOPE_EMAIL) {
        if let Some(email) = non_empty(&user.email) {
            claims.insert("email".to_string(), email);
        }
    }
    if scopes.contains(OAUTH2_SCOPE_PROFILE) {
        if let Some(given_name) = non_empty(&user.first_name) {
            claims.insert("given_name".to_string(), given_name);
        }
        if let Some(family_name) = non_empty(&user.last_name) {
            claims.insert("family_name".to_string(), family_name);
        }
        if let Some(name) = non_empty(&user.full_name()) {
            claims.insert("name".to_string(), name);
        }
        // The short human name. Never the opaque derived username.
        if let Some(nickname) = non_empty(&user.first_name) {
            claims.insert("nickname".to_string(), nickname);
        }
    }
    if scopes.contains(OAUTH2_SCOPE_GITHUB_USERNAME) {
        let login = pipeline::social_auths_for_user(txn, user.uuid)?
            .into_iter()
            .filter(|auth| auth.provider == "github")
            .find_map(|auth| {
                auth.extra_data
                    .get(OAUTH2_SCOPE_GITHUB_USERNAME)
                    .and_then(|v| v.as_str().map(str::to_string))
            });
        if let Some(login) = login {
            claims.insert(
                OAUTH2_SCOPE_GITHUB_USERNAME.to_string(),
                serde_json::Value::String(login),
            );
        }
    }
    let include_ad_groups = client.map(|c| c.options.include_ad_groups).unwrap_or(false);
    if scopes.contains(OAUTH2_SCOPE_AD_GROUPS) && include_ad_groups {
        claims.insert(
            OAUTH2_SCOPE_AD_GROUPS.to_string(),
            serde_json::Value::Array(
                user.ad_groups
                    .iter()
                    .map(|g| serde_json::Value::String(g.clone()))
                    .collect(),
            ),
        );
    }
    Ok(claims)
}

/// Compose the userinfo document from the user and the token's scopes.
/// `preferred_username` stays null and the session claims are never exposed
/// here.
fn build_userinfo(
    txn: &Transaction,
    user: &User,
    token: &IssuedToken,
    client: Option<&Client>,
) -> Result<UserInfoResponse, OperationError> {
    let mut claims = user_claims_for_scopes(txn, user, &token.scope, client)?;
    fn take(claims: &mut BTreeMap<String, serde_json::Value>, key: &str) -> Option<String> {
        match claims.remove(key) {
            Some(serde_json::Value::String(s)) => Some(s),
            _ => None,
        }
    }
    Ok(UserInfoResponse {
        sub: user.uuid.to_string(),
        email: take(&mut claims, "email"),
        given_name: take(&mut claims, "given_name"),
        family_name: take(&mut claims, "family_name"),
        name: take(&mut claims, "name"),
        nickname: take(&mut claims, "nickname"),
        extra: claims,
        ..Default::default()
    })
}

// == storage ==

const CODE_COLS: &str = "id, code, user_uuid, client_id, scope, nonce, is_authentication, \
     code_challenge, code_challenge_method, redirect_uri, expires_at";

const TOKEN_COLS: &str = "id, access_token, refresh_token, user_uuid, client_id, scope, \
     id_token, nonce, created_at, expires_at";

type RawCode = (
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    bool,
    Option<String>,
    Option<String>,
    String,
    i64,
);

fn row_to_code(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawCode> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
    ))
}

fn finish_code(raw: RawCode) -> Result<AuthorisationCode, OperationError> {
    let (id, code, user_uuid, client_id, scope, nonce, is_authentication, challenge, method, uri, expires_at) =
        raw;
    Ok(AuthorisationCode {
        id: Uuid::parse_str(&id).map_err(|_| OperationError::InvalidState)?,
        code,
        user_uuid: Uuid::parse_str(&user_uuid).map_err(|_| OperationError::InvalidState)?,
        client_id,
        scope: scope.split_whitespace().map(str::to_string).collect(),
        nonce,
        is_authentication,
        code_challenge: challenge,
        code_challenge_method: match method.as_deref() {
            Some("S256") => Some(CodeChallengeMethod::S256),
            Some("plain") => Some(CodeChallengeMethod::Plain),
            Some(_) => return Err(OperationError::InvalidState),
            None => None,
        },
        redirect_uri: Url::parse(&uri).map_err(|_| OperationError::InvalidState)?,
        expires_at,
    })
}

fn challenge_method_text(method: Option<CodeChallengeMethod>) -> Option<&'static str> {
    method.map(|m| match m {
        CodeChallengeMethod::S256 => "S256",
        CodeChallengeMethod::Plain => "plain",
    })
}

fn scope_text(scope: &BTreeSet<String>) -> String {
    scope.iter().cloned().collect::<Vec<_>>().join(" ")
}

pub(crate) fn code_insert(
    txn: &Transaction,
    code: &AuthorisationCode,
) -> Result<(), OperationError> {
    txn.execute(
        &format!("INSERT INTO oauth2_codes ({CODE_COLS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
        params![
            code.id.to_string(),
            code.code,
            code.user_uuid.to_string(),
            code.client_id,
            scope_text(&code.scope),
            code.nonce,
            code.is_authentication,
            code.code_challenge,
            challenge_method_text(code.code_challenge_method),
            code.redirect_uri.as_str(),
            code.expires_at
        ],
    )
    .map_err(sqlite_err)?;
    Ok(())
}

/// Fetch and delete in one step; an authorisation code is single use.
pub(crate) fn code_take(
    txn: &Transaction,
    code: &str,
) -> Result<Option<AuthorisationCode>, OperationError> {
    let raw = txn
        .query_row(
            &format!("SELECT {CODE_COLS} FROM oauth2_codes WHERE code = ?1"),
            params![code],
            row_to_code,
        )
        .optional()
        .map_err(sqlite_err)?;
    let parsed = raw.map(finish_code).transpose()?;
    if let Some(rec) = &parsed {
        txn.execute(
            "DELETE FROM oauth2_codes WHERE id = ?1",
            params![rec.id.to_string()],
        )
        .map_err(sqlite_err)?;
    }
    Ok(parsed)
}

pub(crate) fn code_purge_expired(txn: &Transaction, ct: Duration) -> Result<usize, OperationError> {
    txn.execute(
        "DELETE FROM oauth2_codes WHERE expires_at <= ?1",
        params![ct.as_secs() as i64],
    )
    .map_err(sqlite_err)
}

type RawToken = (
    String,
    String,
    Option<String>,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    i64,
    i64,
);

fn row_to_token(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawToken> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn finish_token(raw: RawToken) -> Result<IssuedToken, OperationError> {
    let (id, access, refresh, user_uuid, client_id, scope, id_token, nonce, created_at, expires_at) =
        raw;
    Ok(IssuedToken {
        id: Uuid::parse_str(&id).map_err(|_| OperationError::InvalidState)?,
        access_token: access,
        refresh_token: refresh,
        user_uuid: Uuid::parse_str(&user_uuid).map_err(|_| OperationError::InvalidState)?,
        client_id,
        scope: scope.split_whitespace().map(str::to_string).collect(),
        id_token,
        nonce,
        created_at,
        expires_at,
    })
}

pub(crate) fn token_insert(txn: &Transaction, token: &IssuedToken) -> Result<(), OperationError> {
    txn.execute(
        &format!("INSERT INTO oauth2_tokens ({TOKEN_COLS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
        params![
            token.id.to_string(),
            token.access_token,
            token.refresh_token,
            token.user_uuid.to_string(),
            token.client_id,
            scope_text(&token.scope),
            token.id_token,
            token.nonce,
            token.created_at,
            token.expires_at
        ],
    )
    .map_err(sqlite_err)?;
    Ok(())
}

pub(crate) fn token_update(txn: &Transaction, token: &IssuedToken) -> Result<(), OperationError> {
    txn.execute(
        "UPDATE oauth2_tokens SET access_token = ?1, refresh_token = ?2, scope = ?3,
            id_token = ?4, created_at = ?5, expires_at = ?6
         WHERE id = ?7",
        params![
            token.access_token,
            token.refresh_token,
            scope_text(&token.scope),
            token.id_token,
            token.created_at,
            token.expires_at,
            token.id.to_string()
        ],
    )
    .map_err(sqlite_err)?;
    Ok(())
}

pub(crate) fn token_get(
    txn: &Transaction,
    id: Uuid,
) -> Result<Option<IssuedToken>, OperationError> {
    token_query(txn, "id", &id.to_string())
}

pub(crate) fn token_by_access(
    txn: &Transaction,
    access_token: &str,
) -> Result<Option<IssuedToken>, OperationError> {
    token_query(txn, "access_token", access_token)
}

pub(crate) fn token_by_refresh(
    txn: &Transaction,
    refresh_token: &str,
) -> Result<Option<IssuedToken>, OperationError> {
    token_query(txn, "refresh_token", refresh_token)
}

fn token_query(
    txn: &Transaction,
    column: &str,
    value: &str,
) -> Result<Option<IssuedToken>, OperationError> {
    let raw = txn
        .query_row(
            &format!("SELECT {TOKEN_COLS} FROM oauth2_tokens WHERE {column} = ?1"),
            params![value],
            row_to_token,
        )
        .optional()
        .map_err(sqlite_err)?;
    raw.map(finish_token).transpose()
}

pub(crate) fn token_delete(txn: &Transaction, id: Uuid) -> Result<bool, OperationError> {
    let n = txn
        .execute(
            "DELETE FROM oauth2_tokens WHERE id = ?1",
            params![id.to_string()],
        )
        .map_err(sqlite_err)?;
    Ok(n > 0)
}

/// Resolve a bearer token that is valid, carries the required scope and is
/// bound to a live session.
pub(crate) fn scoped_bearer(
    txn: &Transaction,
    access_token: &str,
    scope: &str,
    ct: Duration,
) -> Result<Option<IssuedToken>, OperationError> {
    let token = match token_by_access(txn, access_token)? {
        Some(token) if token.is_valid_at(ct) && token.scope.contains(scope) => token,
        _ => return Ok(None),
    };
    match session::session_for_element(txn, ElementKind::Token, &token.id.to_string())? {
        Some(session) if session.is_active() => Ok(Some(token)),
        _ => Ok(None),
    }
}
