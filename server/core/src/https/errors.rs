//! Error to response conversion for the web layer.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use tunnistamo_proto::error::{BearerTokenError, OperationError};
use tunnistamo_proto::oauth2::ErrorResponse;
use tunnistamod_lib::idm::device::IdentityLinkError;
use tunnistamod_lib::idm::oauth2::Oauth2Error;

/// The web app's top level error type. Everything the IDM layer can raise
/// converts into one of these and then into an HTTP response.
#[derive(Debug)]
pub enum WebError {
    Operation(OperationError),
    Oauth2(Oauth2Error),
    Bearer(BearerTokenError),
    IdentityLink(IdentityLinkError),
}

impl From<OperationError> for WebError {
    fn from(inner: OperationError) -> Self {
        WebError::Operation(inner)
    }
}

impl From<Oauth2Error> for WebError {
    fn from(inner: Oauth2Error) -> Self {
        match inner {
            Oauth2Error::ServerError(op) => WebError::Operation(op),
            other => WebError::Oauth2(other),
        }
    }
}

impl From<BearerTokenError> for WebError {
    fn from(inner: BearerTokenError) -> Self {
        WebError::Bearer(inner)
    }
}

impl From<IdentityLinkError> for WebError {
    fn from(inner: IdentityLinkError) -> Self {
        match inner {
            IdentityLinkError::ServerError(op) => WebError::Operation(op),
            other => WebError::IdentityLink(other),
        }
    }
}

fn oauth2_error_body(error: &Oauth2Error) -> Json<ErrorResponse> {
    Json(ErrorResponse {
        error: error.to_string(),
        error_description: None,
        error_uri: None,
        state: None,
    })
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        match self {
            WebError::Operation(inner) => {
                let status = match &inner {
                    OperationError::NotAuthenticated | OperationError::SessionExpired => {
                        return (
                            StatusCode::UNAUTHORIZED,
                            [(header::WWW_AUTHENTICATE, "Bearer")],
                            Json(inner),
                        )
                            .into_response()
                    }
                    OperationError::AccessDenied | OperationError::NotAuthorised => {
                        StatusCode::FORBIDDEN
                    }
                    OperationError::NoMatchingEntries
                    | OperationError::InvalidUpstreamProvider(_) => StatusCode::NOT_FOUND,
                    OperationError::EmptyRequest
                    | OperationError::InvalidRequestState
                    | OperationError::InvalidUuid
                    | OperationError::InvalidClientId(_)
                    | OperationError::MissingAttribute(_) => StatusCode::BAD_REQUEST,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, Json(inner)).into_response()
            }
            WebError::Oauth2(inner) => {
                let status = match &inner {
                    // RFC 6749 4.1.2.1 for failed client authentication.
                    Oauth2Error::InvalidClient => {
                        return (
                            StatusCode::UNAUTHORIZED,
                            [(header::WWW_AUTHENTICATE, "Basic")],
                            oauth2_error_body(&inner),
                        )
                            .into_response()
                    }
                    Oauth2Error::InvalidToken => {
                        let bearer = BearerTokenError::invalid_token("token is not active");
                        return (
                            StatusCode::UNAUTHORIZED,
                            [(header::WWW_AUTHENTICATE, bearer.www_authenticate(None))],
                            oauth2_error_body(&inner),
                        )
                            .into_response();
                    }
                    Oauth2Error::AccessDenied => StatusCode::FORBIDDEN,
                    _ => StatusCode::BAD_REQUEST,
                };
                (status, oauth2_error_body(&inner)).into_response()
            }
            WebError::Bearer(inner) => {
                let status = match inner.code {
                    tunnistamo_proto::error::BearerErrorCode::InsufficientScope => {
                        StatusCode::FORBIDDEN
                    }
                    _ => StatusCode::UNAUTHORIZED,
                };
                (
                    status,
                    [(header::WWW_AUTHENTICATE, inner.www_authenticate(None))],
                    Json(inner),
                )
                    .into_response()
            }
            WebError::IdentityLink(inner) => match inner {
                IdentityLinkError::InvalidToken => {
                    let bearer = BearerTokenError::invalid_token("token is not active");
                    (
                        StatusCode::UNAUTHORIZED,
                        [(header::WWW_AUTHENTICATE, bearer.www_authenticate(None))],
                        Json(serde_json::json!({ "code": "invalid_token" })),
                    )
                        .into_response()
                }
                IdentityLinkError::ServiceUnavailable => (
                    StatusCode::UNAUTHORIZED,
                    Json(serde_json::json!({ "code": "authentication_service_unavailable" })),
                )
                    .into_response(),
                IdentityLinkError::InvalidCredentials => (
                    StatusCode::UNAUTHORIZED,
                    Json(serde_json::json!({ "code": "invalid_credentials" })),
                )
                    .into_response(),
                IdentityLinkError::NotImplemented => {
                    StatusCode::NOT_IMPLEMENTED.into_response()
                }
                IdentityLinkError::ServerError(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                }
            },
        }
    }
}
