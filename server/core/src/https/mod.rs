//! The axum web layer.

mod accounts;
mod cors;
pub mod errors;
mod middleware;
mod oauth2;
mod v1;
mod views;

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{delete, get, post};
use axum::Router;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use tunnistamo_proto::constants::{COOKIE_CSRF, COOKIE_SESSION};
use tunnistamod_lib::idm::server::IdmServer;
use tunnistamod_lib::idm::upstream::SamlProvider;
use tunnistamod_lib::prelude::*;

use crate::config::ServerConfig;
use crate::CoreAction;

#[derive(Clone)]
pub struct ServerState {
    pub idms: Arc<IdmServer>,
    pub saml: Option<Arc<SamlProvider>>,
    pub csp_header: Option<(HeaderName, HeaderValue)>,
    pub trust_x_scheme: bool,
}

impl ServerState {
    /// Cookies are Secure when we are reached over https, directly or via a
    /// TLS-terminating proxy announcing itself with `X-Scheme`.
    pub(crate) fn secure_cookies(&self, headers: &HeaderMap) -> bool {
        if self.trust_x_scheme {
            headers
                .get("X-Scheme")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.eq_ignore_ascii_case("https"))
                .unwrap_or(false)
        } else {
            self.idms.config().issuer.starts_with("https://")
        }
    }

    pub(crate) fn session_key(&self, jar: &CookieJar) -> Option<String> {
        jar.get(COOKIE_SESSION).map(|c| c.value().to_string())
    }

    pub(crate) fn session_cookie(&self, key: String, secure: bool) -> Cookie<'static> {
        let mut cookie = Cookie::new(COOKIE_SESSION, key);
        cookie.set_path("/");
        cookie.set_http_only(true);
        cookie.set_same_site(SameSite::Lax);
        cookie.set_secure(secure);
        cookie
    }

    pub(crate) fn csrf_key(&self, jar: &CookieJar) -> Option<String> {
        jar.get(COOKIE_CSRF).map(|c| c.value().to_string())
    }

    /// Double-submit cookie, so it is readable by the form layer.
    pub(crate) fn csrf_cookie(&self, value: String, secure: bool) -> Cookie<'static> {
        let mut cookie = Cookie::new(COOKIE_CSRF, value);
        cookie.set_path("/");
        cookie.set_same_site(SameSite::Lax);
        cookie.set_secure(secure);
        cookie
    }

    pub(crate) fn removal_cookie(&self) -> Cookie<'static> {
        let mut cookie = Cookie::new(COOKIE_SESSION, "");
        cookie.set_path("/");
        cookie.make_removal();
        cookie
    }
}

/// The bearer token of an `Authorization: Bearer` header.
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// `Authorization: Basic` client credentials, split and decoded.
pub(crate) fn basic_client_authz(headers: &HeaderMap) -> Option<(String, String)> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    let raw = headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(raw.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (id, secret) = decoded.split_once(':')?;
    Some((id.to_string(), secret.to_string()))
}

async fn status(
    axum::Extension(kopid): axum::Extension<middleware::KOpId>,
) -> &'static str {
    request_trace!(eventid = %kopid.eventid, "status");
    "true"
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route(
            "/.well-known/openid-configuration",
            get(oauth2::discovery_get),
        )
        .route("/openid/jwks/", get(oauth2::jwks_get))
        .route(
            "/openid/authorize",
            get(oauth2::authorise_get).post(oauth2::authorise_post),
        )
        .route("/openid/token", post(oauth2::token_post))
        .route(
            "/openid/userinfo",
            get(oauth2::userinfo_get).post(oauth2::userinfo_get),
        )
        .route("/openid/introspect", post(oauth2::introspect_post))
        .route("/openid/end-session", get(oauth2::end_session_get))
        .route(
            "/api-tokens/",
            get(oauth2::api_tokens_get).post(oauth2::api_tokens_get),
        )
        .route(
            "/jwt-token/",
            get(oauth2::api_tokens_get).post(oauth2::api_tokens_get),
        )
        .route(
            "/backchannel-logout/:backend/",
            post(accounts::backchannel_logout_post),
        )
        .route("/login/", get(accounts::login_get))
        .route("/logout/", get(accounts::logout_get))
        .route("/accounts/:backend/login/", get(accounts::upstream_login_get))
        .route(
            "/accounts/:backend/login/callback/",
            get(accounts::upstream_callback_get),
        )
        .route(
            "/accounts/suomifi/acs/",
            post(accounts::saml_acs_post),
        )
        .route(
            "/accounts/suomifi/sls/",
            get(accounts::saml_sls).post(accounts::saml_sls),
        )
        .route("/accounts/suomifi/metadata/", get(accounts::saml_metadata_get))
        .route("/accounts/suomifi/logout/", get(accounts::saml_logout_get))
        .route(
            "/v1/user_device/",
            get(v1::device_list_get).post(v1::device_register_post),
        )
        .route("/v1/user_device/:id/", delete(v1::device_delete))
        .route(
            "/v1/user_identity/",
            get(v1::identity_list_get).post(v1::identity_link_post),
        )
        .route("/v1/user_identity/:id/", delete(v1::identity_delete))
        .route("/v1/user_login_entry/", get(v1::login_entry_list_get))
        .route("/v1/user_consent/", get(v1::consent_list_get))
        .route("/v1/user_consent/:client_id/", delete(v1::consent_delete))
        .layer(from_fn_with_state(state.clone(), cors::cors_middleware))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::security_headers_layer,
        ))
        .layer(from_fn(middleware::version_middleware))
        .layer(TraceLayer::new_for_http())
        // Must be last: the outermost layer stamps the operation id every
        // inner span and the response header share.
        .layer(from_fn(middleware::kopid_middleware))
        .with_state(state)
}

pub(crate) fn build_state(
    config: &ServerConfig,
    idms: Arc<IdmServer>,
    saml: Option<Arc<SamlProvider>>,
) -> Result<ServerState, OperationError> {
    let csp_header = match &config.csp.policy {
        Some(policy) => {
            let name = if config.csp.report_only {
                HeaderName::from_static("content-security-policy-report-only")
            } else {
                HeaderName::from_static("content-security-policy")
            };
            let value = HeaderValue::from_str(policy).map_err(|_| {
                admin_error!("Configured CSP policy is not a valid header value");
                OperationError::InvalidState
            })?;
            Some((name, value))
        }
        None => None,
    };
    Ok(ServerState {
        idms,
        saml,
        csp_header,
        trust_x_scheme: config.trust_x_scheme,
    })
}

pub(crate) async fn create_https_server(
    bindaddress: &str,
    state: ServerState,
    mut rx: broadcast::Receiver<CoreAction>,
) -> Result<tokio::task::JoinHandle<()>, OperationError> {
    let addr = SocketAddr::from_str(bindaddress).map_err(|err| {
        admin_error!(?err, %bindaddress, "Unable to parse bind address");
        OperationError::InvalidState
    })?;

    let listener = TcpListener::bind(addr).await.map_err(|err| {
        admin_error!(?err, %addr, "Unable to bind web server socket");
        OperationError::Backend
    })?;

    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();

    admin_info!(%addr, "Starting the web server");
    Ok(tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            loop {
                match rx.recv().await {
                    Ok(CoreAction::Shutdown) | Err(_) => break,
                }
            }
        });
        if let Err(err) = serve.await {
            admin_error!(?err, "Web server exited with error");
        }
        admin_info!("Stopped web acceptor");
    }))
}
