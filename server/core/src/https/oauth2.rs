//! Handlers for the OAuth2 / OIDC protocol endpoints.

use axum::extract::{Query, RawForm, RawQuery, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Redirect, Response};
use axum::{Form, Json};

use tunnistamo_proto::oauth2::{
    AccessTokenIntrospectRequest, AccessTokenRequest, AuthorisationRequest, EndSessionRequest,
    ResponseMode,
};
use tunnistamod_lib::idm::oauth2::{AuthorisePermitSuccess, AuthoriseResponse};
use tunnistamod_lib::prelude::*;

use super::errors::WebError;
use super::{basic_client_authz, bearer_token, views, ServerState};
use axum_extra::extract::CookieJar;

pub(crate) async fn discovery_get(
    State(state): State<ServerState>,
) -> Result<Response, WebError> {
    let discovery = state.idms.oauth2_openid_discovery().await?;
    Ok(Json(discovery).into_response())
}

pub(crate) async fn jwks_get(State(state): State<ServerState>) -> Result<Response, WebError> {
    let jwks = state.idms.oauth2_openid_publickey().await?;
    Ok(Json(jwks).into_response())
}

pub(crate) async fn authorise_get(
    State(state): State<ServerState>,
    headers: HeaderMap,
    jar: CookieJar,
    RawQuery(raw_query): RawQuery,
    Query(auth_req): Query<AuthorisationRequest>,
) -> Response {
    authorise_flow(
        &state,
        &headers,
        &jar,
        raw_query.unwrap_or_default(),
        auth_req,
        None,
    )
    .await
}

/// The POST side serves two shapes: a full authorise request in the form
/// body, and the consent form submission (the original request stays in the
/// query string, the body carries the consent ticket).
pub(crate) async fn authorise_post(
    State(state): State<ServerState>,
    headers: HeaderMap,
    jar: CookieJar,
    RawQuery(raw_query): RawQuery,
    RawForm(body): RawForm,
) -> Response {
    let body = String::from_utf8_lossy(&body).into_owned();
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(&body).unwrap_or_default();
    let consent_token = pairs
        .iter()
        .find(|(k, _)| k == "consent_token")
        .map(|(_, v)| v.clone());

    let (query, consent) = match consent_token {
        Some(token) => {
            // Double-submit check, the form field must echo the csrf cookie.
            let form_csrf = pairs
                .iter()
                .find(|(k, _)| k == "csrfmiddlewaretoken")
                .map(|(_, v)| v.as_str());
            match (state.csrf_key(&jar), form_csrf) {
                (Some(cookie), Some(field)) if cookie == field => {}
                _ => {
                    return WebError::Operation(OperationError::AccessDenied).into_response();
                }
            }
            (raw_query.unwrap_or_default(), Some(token))
        }
        None => (body, None),
    };
    let auth_req: AuthorisationRequest = match serde_urlencoded::from_str(&query) {
        Ok(req) => req,
        Err(_) => return WebError::Oauth2(tunnistamod_lib::idm::oauth2::Oauth2Error::InvalidRequest)
            .into_response(),
    };
    authorise_flow(&state, &headers, &jar, query, auth_req, consent).await
}

async fn authorise_flow(
    state: &ServerState,
    headers: &HeaderMap,
    jar: &CookieJar,
    query: String,
    auth_req: AuthorisationRequest,
    consent_token: Option<String>,
) -> Response {
    let ct = duration_from_epoch_now();
    let websession_key = state.session_key(jar);

    if let Some(token) = consent_token {
        let key = match websession_key.as_deref() {
            Some(key) => key,
            None => return WebError::Operation(OperationError::NotAuthenticated).into_response(),
        };
        if let Err(err) = state.idms.oauth2_consent_permit(key, &token, ct).await {
            return WebError::Operation(err).into_response();
        }
    }

    let outcome = match state
        .idms
        .check_oauth2_authorisation(websession_key.as_deref(), &auth_req, ct)
        .await
    {
        Ok(outcome) => outcome,
        Err(err) => return WebError::Oauth2(err).into_response(),
    };

    match outcome {
        AuthoriseResponse::LoginRequired { reauthenticate } => {
            let mut next = format!("/openid/authorize?{query}");
            if reauthenticate && !query.contains("first_authz=") {
                next.push_str("&first_authz=false");
            }
            let mut target = format!("/login/?next={}", views::urlencode(&next));
            if let Some(hint) = &auth_req.idp_hint {
                target.push_str("&idp_hint=");
                target.push_str(&views::urlencode(hint));
            }
            Redirect::to(&target).into_response()
        }
        AuthoriseResponse::ConsentRequired {
            client_name,
            scopes,
            consent_token,
        } => {
            let csrf = state
                .csrf_key(jar)
                .unwrap_or_else(tunnistamod_lib::utils::generate_opaque_token);
            let secure = state.secure_cookies(headers);
            let jar = jar.clone().add(state.csrf_cookie(csrf.clone(), secure));
            let scope_names: Vec<String> = scopes.into_iter().collect();
            (
                jar,
                views::consent_form(&client_name, &scope_names, &query, &consent_token, &csrf),
            )
                .into_response()
        }
        AuthoriseResponse::Denied {
            redirect_uri,
            state: client_state,
            error,
        } => {
            let mut url = redirect_uri;
            url.query_pairs_mut().append_pair("error", error);
            if let Some(st) = client_state {
                url.query_pairs_mut().append_pair("state", &st);
            }
            Redirect::to(url.as_str()).into_response()
        }
        AuthoriseResponse::Permitted(success) => permitted_response(success),
    }
}

fn permitted_response(success: AuthorisePermitSuccess) -> Response {
    let AuthorisePermitSuccess {
        redirect_uri,
        response_mode,
        state,
        code,
        access_token,
        expires_in,
        id_token,
    } = success;

    let mut fields: Vec<(&str, String)> = Vec::new();
    if let Some(code) = code {
        fields.push(("code", code));
    }
    if let Some(token) = access_token {
        fields.push(("access_token", token));
        fields.push(("token_type", "bearer".to_string()));
    }
    if let Some(expires_in) = expires_in {
        fields.push(("expires_in", expires_in.to_string()));
    }
    if let Some(id_token) = id_token {
        fields.push(("id_token", id_token));
    }
    if let Some(state) = state {
        fields.push(("state", state));
    }

    match response_mode {
        ResponseMode::Query => {
            let mut url = redirect_uri;
            for (name, value) in &fields {
                url.query_pairs_mut().append_pair(name, value);
            }
            Redirect::to(url.as_str()).into_response()
        }
        ResponseMode::Fragment => {
            let mut url = redirect_uri;
            let fragment = serde_urlencoded::to_string(&fields).unwrap_or_default();
            url.set_fragment(Some(&fragment));
            Redirect::to(url.as_str()).into_response()
        }
        ResponseMode::FormPost => {
            views::form_post(redirect_uri.as_str(), &fields).into_response()
        }
        ResponseMode::Invalid => {
            WebError::Oauth2(tunnistamod_lib::idm::oauth2::Oauth2Error::InvalidRequest)
                .into_response()
        }
    }
}

pub(crate) async fn token_post(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Form(tok_req): Form<AccessTokenRequest>,
) -> Result<Response, WebError> {
    let ct = duration_from_epoch_now();
    let client_authz = basic_client_authz(&headers);
    let client_authz_ref = client_authz
        .as_ref()
        .map(|(id, secret)| (id.as_str(), secret.as_str()));
    let response = state
        .idms
        .check_oauth2_token_exchange(client_authz_ref, &tok_req, ct)
        .await?;
    Ok(Json(response).into_response())
}

pub(crate) async fn userinfo_get(
    State(state): State<ServerState>,
    headers: HeaderMap,
) -> Result<Response, WebError> {
    let ct = duration_from_epoch_now();
    let token = bearer_token(&headers)
        .ok_or(WebError::Oauth2(tunnistamod_lib::idm::oauth2::Oauth2Error::InvalidToken))?;
    let userinfo = state.idms.oauth2_openid_userinfo(token, ct).await?;
    Ok(Json(userinfo).into_response())
}

pub(crate) async fn introspect_post(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Form(intr_req): Form<AccessTokenIntrospectRequest>,
) -> Result<Response, WebError> {
    let ct = duration_from_epoch_now();
    let client_authz = basic_client_authz(&headers);
    let client_authz_ref = client_authz
        .as_ref()
        .map(|(id, secret)| (id.as_str(), secret.as_str()));
    let response = state
        .idms
        .oauth2_token_introspect(client_authz_ref, &intr_req, ct)
        .await?;
    Ok(Json(response).into_response())
}

/// Served at both `/api-tokens/` and the historical `/jwt-token/` path.
pub(crate) async fn api_tokens_get(
    State(state): State<ServerState>,
    headers: HeaderMap,
) -> Result<Response, WebError> {
    let ct = duration_from_epoch_now();
    let token = bearer_token(&headers)
        .ok_or(WebError::Oauth2(tunnistamod_lib::idm::oauth2::Oauth2Error::InvalidToken))?;
    let tokens = state.idms.oauth2_api_tokens(token, ct).await?;
    Ok(Json(tokens).into_response())
}

pub(crate) async fn end_session_get(
    State(state): State<ServerState>,
    jar: CookieJar,
    Query(req): Query<EndSessionRequest>,
) -> Result<Response, WebError> {
    let ct = duration_from_epoch_now();
    let websession_key = state.session_key(&jar);
    let outcome = state
        .idms
        .oauth2_rp_logout(websession_key.as_deref(), &req, ct)
        .await?;

    let jar = jar.add(state.removal_cookie());
    match outcome.redirect {
        Some(mut url) => {
            if let Some(st) = outcome.state {
                url.query_pairs_mut().append_pair("state", &st);
            }
            Ok((jar, Redirect::to(url.as_str())).into_response())
        }
        None => Ok((jar, views::logged_out()).into_response()),
    }
}
