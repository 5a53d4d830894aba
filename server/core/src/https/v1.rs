//! The bearer-token REST resources under `/v1/`.
//!
//! Every endpoint authenticates with an `Authorization: Bearer` access
//! token carrying the resource's scope and bound to a live session.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use tunnistamo_proto::jwk::EcJwk;
use tunnistamo_proto::oauth2::{UserConsentView, UserDeviceRegistration};
use tunnistamod_lib::idm::device::{UserDevice, UserIdentity};
use tunnistamod_lib::idm::oauth2::Oauth2Error;
use tunnistamod_lib::prelude::*;

use super::errors::WebError;
use super::{bearer_token, ServerState};

fn bearer(headers: &HeaderMap) -> Result<&str, WebError> {
    bearer_token(headers).ok_or(WebError::Oauth2(Oauth2Error::InvalidToken))
}

#[derive(Serialize)]
struct UserDeviceView {
    id: Uuid,
    public_key: EcJwk,
    /// Present only in the registration response.
    #[serde(skip_serializing_if = "Option::is_none")]
    secret_key: Option<EcJwk>,
    auth_counter: i64,
    last_used_at: Option<i64>,
}

impl UserDeviceView {
    fn from_device(device: UserDevice, include_secret: bool) -> Self {
        UserDeviceView {
            id: device.id,
            public_key: device.public_key,
            secret_key: include_secret.then_some(device.secret_key),
            auth_counter: device.auth_counter,
            last_used_at: device.last_used_at,
        }
    }
}

pub(crate) async fn device_list_get(
    State(state): State<ServerState>,
    headers: HeaderMap,
) -> Result<Response, WebError> {
    let ct = duration_from_epoch_now();
    let devices = state.idms.device_list(bearer(&headers)?, ct).await?;
    let views: Vec<UserDeviceView> = devices
        .into_iter()
        .map(|d| UserDeviceView::from_device(d, false))
        .collect();
    Ok(Json(views).into_response())
}

pub(crate) async fn device_register_post(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(reg): Json<UserDeviceRegistration>,
) -> Result<Response, WebError> {
    let ct = duration_from_epoch_now();
    let public_key: EcJwk = serde_json::from_value(reg.public_key)
        .map_err(|_| WebError::Oauth2(Oauth2Error::InvalidRequest))?;
    let device = state
        .idms
        .device_register(bearer(&headers)?, &public_key, ct)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(UserDeviceView::from_device(device, true)),
    )
        .into_response())
}

pub(crate) async fn device_delete(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Path(device_id): Path<Uuid>,
) -> Result<Response, WebError> {
    let ct = duration_from_epoch_now();
    state
        .idms
        .device_delete(bearer(&headers)?, device_id, ct)
        .await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(Serialize)]
struct UserIdentityView {
    id: Uuid,
    service: String,
    identifier: String,
    created_at: i64,
}

impl From<UserIdentity> for UserIdentityView {
    fn from(identity: UserIdentity) -> Self {
        UserIdentityView {
            id: identity.id,
            service: identity.service,
            identifier: identity.identifier,
            created_at: identity.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct IdentityLinkBody {
    service: String,
    identifier: String,
    secret: String,
}

pub(crate) async fn identity_list_get(
    State(state): State<ServerState>,
    headers: HeaderMap,
) -> Result<Response, WebError> {
    let ct = duration_from_epoch_now();
    let identities = state.idms.identity_list(bearer(&headers)?, ct).await?;
    let views: Vec<UserIdentityView> = identities.into_iter().map(Into::into).collect();
    Ok(Json(views).into_response())
}

pub(crate) async fn identity_link_post(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(body): Json<IdentityLinkBody>,
) -> Result<Response, WebError> {
    let ct = duration_from_epoch_now();
    let identity = state
        .idms
        .identity_link(
            bearer(&headers)?,
            &body.service,
            &body.identifier,
            &body.secret,
            ct,
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(UserIdentityView::from(identity)),
    )
        .into_response())
}

pub(crate) async fn identity_delete(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Path(identity_id): Path<Uuid>,
) -> Result<Response, WebError> {
    let ct = duration_from_epoch_now();
    state
        .idms
        .identity_delete(bearer(&headers)?, identity_id, ct)
        .await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

pub(crate) async fn login_entry_list_get(
    State(state): State<ServerState>,
    headers: HeaderMap,
) -> Result<Response, WebError> {
    let ct = duration_from_epoch_now();
    let entries = state.idms.login_entry_list(bearer(&headers)?, ct).await?;
    Ok(Json(entries).into_response())
}

/// Stable view id for a consent, which is stored keyed by user and client.
fn consent_view_id(user_uuid: Uuid, client_id: &str) -> Uuid {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{user_uuid}/{client_id}").as_bytes(),
    )
}

pub(crate) async fn consent_list_get(
    State(state): State<ServerState>,
    headers: HeaderMap,
) -> Result<Response, WebError> {
    let ct = duration_from_epoch_now();
    let consents = state.idms.consent_list(bearer(&headers)?, ct).await?;
    let views: Vec<UserConsentView> = consents
        .into_iter()
        .map(|c| UserConsentView {
            id: consent_view_id(c.user_uuid, &c.client_id),
            client_id: c.client_id,
            scope: c.scope,
            date_given: OffsetDateTime::from_unix_timestamp(c.date_given)
                .unwrap_or(OffsetDateTime::UNIX_EPOCH),
            expires_at: c
                .expires_at
                .and_then(|e| OffsetDateTime::from_unix_timestamp(e).ok()),
        })
        .collect();
    Ok(Json(views).into_response())
}

pub(crate) async fn consent_delete(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Path(client_id): Path<String>,
) -> Result<Response, WebError> {
    let ct = duration_from_epoch_now();
    state
        .idms
        .consent_revoke_for(bearer(&headers)?, &client_id, ct)
        .await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
