//! Browser login and logout, and the per-backend upstream flows.
//!
//! `/login/` shows the method picker (or honours an `idp_hint`),
//! `/accounts/:backend/login/` starts the upstream round trip and
//! `/accounts/:backend/login/callback/` lands it. The Suomi.fi SAML
//! bindings get their own endpoints since they speak POST and signed
//! redirects instead of the OAuth2 callback shape.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Form, Path, Query, RawQuery, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Redirect, Response};
use axum_extra::extract::CookieJar;
use serde::Deserialize;

use tunnistamod_lib::idm::pipeline::LoginOutcome;
use tunnistamod_lib::idm::upstream::{CallbackParams, FlowState, SamlProvider, UpstreamProvider};
use tunnistamod_lib::idm::websession::WebSession;
use tunnistamod_lib::prelude::*;

use super::errors::WebError;
use super::{views, ServerState};

#[derive(Debug, Default, Deserialize)]
pub(crate) struct LoginParams {
    pub next: Option<String>,
    pub idp_hint: Option<String>,
}

/// Fetch the browser session behind the cookie, or start a fresh one.
/// Returns the session and the jar with the cookie set when it was new.
async fn ensure_websession(
    state: &ServerState,
    jar: CookieJar,
    headers: &HeaderMap,
    ct: Duration,
) -> Result<(WebSession, CookieJar), OperationError> {
    if let Some(key) = state.session_key(&jar) {
        if let Some(session) = state.idms.websession_fetch(&key, ct).await? {
            return Ok((session, jar));
        }
    }
    let session = state.idms.websession_begin(ct).await?;
    let secure = state.secure_cookies(headers);
    let jar = jar.add(state.session_cookie(session.key.clone(), secure));
    Ok((session, jar))
}

/// The client_id buried in a stored `/openid/authorize?...` next url.
fn client_id_of_next(next: &str) -> Option<String> {
    let query = next.split_once('?')?.1;
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query).ok()?;
    pairs.into_iter().find(|(k, _)| k == "client_id").map(|(_, v)| v)
}

pub(crate) async fn login_get(
    State(state): State<ServerState>,
    jar: CookieJar,
    headers: HeaderMap,
    Query(params): Query<LoginParams>,
) -> Result<Response, WebError> {
    let ct = duration_from_epoch_now();
    let (mut session, jar) = ensure_websession(&state, jar, &headers, ct).await?;

    if let Some(next) = &params.next {
        session.data.pending_authorise = Some(next.clone());
        state.idms.websession_store(session.clone()).await?;
    }

    // A hint for a known backend skips the picker entirely.
    if let Some(hint) = &params.idp_hint {
        if state.idms.upstream(hint).is_some() {
            let mut target = format!("/accounts/{hint}/login/");
            if let Some(next) = &params.next {
                target.push_str("?next=");
                target.push_str(&views::urlencode(next));
            }
            return Ok((jar, Redirect::to(&target)).into_response());
        }
        request_warn!(idp_hint = %hint, "Unknown idp_hint ignored");
    }

    let mut methods = state.idms.login_methods().await?;
    if let Some(client) = params
        .next
        .as_deref()
        .and_then(client_id_of_next)
        .and_then(|id| state.idms.client(&id))
    {
        methods.retain(|m| client.login_method_allowed(&m.provider_id));
    }

    Ok((jar, views::login_picker(&methods, params.next.as_deref())).into_response())
}

pub(crate) async fn logout_get(
    State(state): State<ServerState>,
    jar: CookieJar,
    Query(params): Query<LoginParams>,
) -> Result<Response, WebError> {
    let ct = duration_from_epoch_now();
    if let Some(key) = state.session_key(&jar) {
        state
            .idms
            .oauth2_rp_logout(Some(&key), &Default::default(), ct)
            .await?;
    }
    let jar = jar.add(state.removal_cookie());
    let target = params.next.as_deref().unwrap_or("/login/");
    Ok((jar, Redirect::to(target)).into_response())
}

pub(crate) async fn upstream_login_get(
    State(state): State<ServerState>,
    Path(backend): Path<String>,
    jar: CookieJar,
    headers: HeaderMap,
    Query(params): Query<LoginParams>,
) -> Result<Response, WebError> {
    let ct = duration_from_epoch_now();
    let provider = state
        .idms
        .upstream(&backend)
        .ok_or_else(|| OperationError::InvalidUpstreamProvider(backend.clone()))?;
    let (mut session, jar) = ensure_websession(&state, jar, &headers, ct).await?;

    if let Some(next) = &params.next {
        session.data.pending_authorise = Some(next.clone());
    }

    let issuer = state.idms.config().issuer.trim_end_matches('/');
    let redirect_uri = Url::parse(&format!("{issuer}/accounts/{backend}/login/callback/"))
        .map_err(|_| OperationError::InvalidState)?;
    let flow = FlowState {
        state: Uuid::new_v4().simple().to_string(),
        nonce: Uuid::new_v4().simple().to_string(),
        redirect_uri,
        original_client_id: session
            .data
            .pending_authorise
            .as_deref()
            .and_then(client_id_of_next),
    };
    session.data.upstream =
        Some(serde_json::to_value(&flow).map_err(|_| OperationError::SerdeJsonError)?);
    state.idms.websession_store(session).await?;

    let url = provider
        .begin(&flow)
        .await
        .map_err(OperationError::from)?;
    Ok((jar, Redirect::to(url.as_str())).into_response())
}

pub(crate) async fn upstream_callback_get(
    State(state): State<ServerState>,
    Path(backend): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    jar: CookieJar,
    Query(params): Query<CallbackParams>,
) -> Result<Response, WebError> {
    finish_login(&state, &backend, addr, jar, params).await
}

/// Shared landing for the OAuth2 callback and the SAML ACS post: verify
/// against the stashed flow state, run the pipeline, resume the pending
/// authorise request.
async fn finish_login(
    state: &ServerState,
    backend: &str,
    addr: SocketAddr,
    jar: CookieJar,
    params: CallbackParams,
) -> Result<Response, WebError> {
    let ct = duration_from_epoch_now();
    let provider = state
        .idms
        .upstream(backend)
        .ok_or_else(|| OperationError::InvalidUpstreamProvider(backend.to_string()))?;

    let key = match state.session_key(&jar) {
        Some(key) => key,
        None => return Ok(Redirect::to("/login/").into_response()),
    };
    let session = match state.idms.websession_fetch(&key, ct).await? {
        Some(session) => session,
        None => return Ok(Redirect::to("/login/").into_response()),
    };
    let flow: FlowState = match session
        .data
        .upstream
        .clone()
        .and_then(|v| serde_json::from_value(v).ok())
    {
        Some(flow) => flow,
        None => {
            request_warn!(%backend, "Callback without an in-flight upstream login");
            return Ok(Redirect::to("/login/").into_response());
        }
    };

    if let Some(error) = &params.error {
        security_info!(%backend, %error, "Upstream login rejected");
        return Ok(auth_error_response(state, provider.as_ref(), &flow, &session, error));
    }

    let attrs = match provider.complete(&params, &flow).await {
        Ok(attrs) => attrs,
        Err(err) => {
            security_error!(%backend, ?err, "Upstream callback failed verification");
            return Ok(auth_error_response(
                state,
                provider.as_ref(),
                &flow,
                &session,
                "access_denied",
            ));
        }
    };

    let outcome = state
        .idms
        .complete_upstream_login(backend, attrs, &key, ct)
        .await?;
    match outcome {
        LoginOutcome::Complete { user, .. } => {
            state
                .idms
                .record_login_entry(user.uuid, backend, Some(addr.ip().to_string()), ct)
                .await?;
            // Drop the consumed flow state, keep the binding the pipeline
            // wrote.
            if let Some(mut fresh) = state.idms.websession_fetch(&key, ct).await? {
                let next = fresh.data.pending_authorise.take();
                fresh.data.upstream = None;
                state.idms.websession_store(fresh).await?;
                return Ok(Redirect::to(next.as_deref().unwrap_or("/")).into_response());
            }
            Ok(Redirect::to("/").into_response())
        }
        LoginOutcome::EmailRequired { reauth_params } => {
            let mut href = format!("/accounts/{backend}/login/");
            let mut sep = '?';
            if let Some(next) = &session.data.pending_authorise {
                href.push_str("?next=");
                href.push_str(&views::urlencode(next));
                sep = '&';
            }
            for (name, value) in &reauth_params {
                href.push(sep);
                sep = '&';
                href.push_str(&views::urlencode(name));
                href.push('=');
                href.push_str(&views::urlencode(value));
            }
            Ok(views::email_required(&href).into_response())
        }
    }
}

/// Where a failed upstream login sends the browser: back to the relying
/// party for backends that demand it, otherwise our login page.
fn auth_error_response(
    state: &ServerState,
    provider: &dyn UpstreamProvider,
    flow: &FlowState,
    session: &WebSession,
    error: &str,
) -> Response {
    if provider.on_auth_error_redirect_to_client() {
        if let Some(client) = flow
            .original_client_id
            .as_deref()
            .and_then(|id| state.idms.client(id))
        {
            if let Some(uri) = client.redirect_uris.first() {
                let mut url = uri.clone();
                let error = match error {
                    "access_denied" => "access_denied",
                    _ => "interaction_required",
                };
                url.query_pairs_mut().append_pair("error", error);
                return Redirect::to(url.as_str()).into_response();
            }
        }
    }
    match &session.data.pending_authorise {
        Some(next) => {
            Redirect::to(&format!("/login/?next={}", views::urlencode(next))).into_response()
        }
        None => Redirect::to("/login/").into_response(),
    }
}

pub(crate) async fn saml_acs_post(
    State(state): State<ServerState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    jar: CookieJar,
    Form(params): Form<CallbackParams>,
) -> Result<Response, WebError> {
    let saml = state
        .saml
        .as_ref()
        .ok_or(OperationError::NoMatchingEntries)?;
    let backend = saml.provider_id().to_string();
    finish_login(&state, &backend, addr, jar, params).await
}

#[derive(Debug, Deserialize)]
struct SloRelay {
    cli: Option<String>,
    idx: Option<usize>,
}

/// Single logout return leg. The IdP bounces the browser back here with a
/// signed redirect; the relay state names the relying party redirect we
/// promised before chaining upstream.
pub(crate) async fn saml_sls(
    State(state): State<ServerState>,
    RawQuery(raw_query): RawQuery,
    Query(params): Query<CallbackParams>,
) -> Result<Response, WebError> {
    let saml = state
        .saml
        .as_ref()
        .ok_or(OperationError::NoMatchingEntries)?;

    if let Some(raw_query) = raw_query.as_deref() {
        if raw_query.contains("Signature=") {
            if let Err(err) = saml.verify_redirect_signature(raw_query) {
                security_error!(?err, "Single logout redirect failed signature check");
                return Err(WebError::Operation(OperationError::AccessDenied));
            }
        }
    }

    // An IdP-initiated LogoutRequest: end the matching sessions and answer
    // with a LogoutResponse back to the IdP. The request must be signed.
    let saml_request = raw_query.as_deref().and_then(|q| {
        serde_urlencoded::from_str::<Vec<(String, String)>>(q)
            .ok()?
            .into_iter()
            .find(|(k, _)| k == "SAMLRequest")
            .map(|(_, v)| v)
    });
    if let Some(payload) = saml_request {
        if !raw_query.as_deref().unwrap_or_default().contains("Signature=") {
            return Err(WebError::Operation(OperationError::AccessDenied));
        }
        let slo = SamlProvider::parse_logout_request(&payload).map_err(|err| {
            security_error!(?err, "Unparseable single logout request");
            WebError::Operation(OperationError::InvalidRequestState)
        })?;
        state
            .idms
            .upstream_saml_logout(
                saml.provider_id(),
                &slo.name_id,
                slo.session_index.as_deref(),
                duration_from_epoch_now(),
            )
            .await?;
        let response_url = saml
            .logout_response_redirect(
                slo.request_id.as_deref(),
                params.relay_state.as_deref(),
                duration_from_epoch_now(),
            )
            .map_err(OperationError::from)?;
        return Ok(Redirect::to(response_url.as_str()).into_response());
    }

    let target = params
        .relay_state
        .as_deref()
        .and_then(|rs| serde_json::from_str::<SloRelay>(rs).ok())
        .and_then(|relay| {
            let client = state.idms.client(relay.cli.as_deref()?)?;
            let uri = client.post_logout_redirect_uris.get(relay.idx?)?;
            Some(uri.to_string())
        });
    Ok(Redirect::to(target.as_deref().unwrap_or("/login/")).into_response())
}

pub(crate) async fn saml_metadata_get(
    State(state): State<ServerState>,
) -> Result<Response, WebError> {
    let saml = state
        .saml
        .as_ref()
        .ok_or(OperationError::NoMatchingEntries)?;
    Ok((
        [(header::CONTENT_TYPE, "application/xml")],
        saml.metadata_xml(),
    )
        .into_response())
}

/// Convenience entry point mirroring the generic logout view.
pub(crate) async fn saml_logout_get(
    state: State<ServerState>,
    jar: CookieJar,
    params: Query<LoginParams>,
) -> Result<Response, WebError> {
    logout_get(state, jar, params).await
}

/// OIDC back-channel logout receiver for upstream providers. A valid token
/// answers 200 with an empty body; an unknown subject or provider is a 400.
pub(crate) async fn backchannel_logout_post(
    State(state): State<ServerState>,
    Path(backend): Path<String>,
    Form(body): Form<BackchannelLogoutBody>,
) -> Result<Response, WebError> {
    let ct = duration_from_epoch_now();
    state
        .idms
        .upstream_backchannel_logout(&backend, &body.logout_token, ct)
        .await
        .map_err(|err| match err {
            OperationError::InvalidUpstreamProvider(_)
            | OperationError::NoMatchingEntries
            | OperationError::AccessDenied
            | OperationError::UpstreamUnavailable => {
                WebError::Operation(OperationError::EmptyRequest)
            }
            other => WebError::Operation(other),
        })?;
    Ok(().into_response())
}

#[derive(Debug, Deserialize)]
pub(crate) struct BackchannelLogoutBody {
    pub logout_token: String,
}
