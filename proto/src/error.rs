//! The server operation error type.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Errors raised by operations inside the IDM core. These are "hard" errors
/// that are not part of the OAuth2 protocol error surface - the protocol level
/// `Oauth2Error` wraps this where a server fault has to be reported as
/// `server_error`.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(rename_all = "lowercase")]
pub enum OperationError {
    // Logic errors, or "soft" errors.
    SessionExpired,
    NoMatchingEntries,
    UniqueConstraintViolation,
    EmptyRequest,
    InvalidRequestState,
    InvalidSessionState,
    InvalidState,
    InvalidUuid,
    InvalidClientId(String),
    InvalidUpstreamProvider(String),
    MissingAttribute(String),
    AccessDenied,
    NotAuthenticated,
    NotAuthorised,

    // Subsystem faults.
    Backend,
    SqliteError,
    SerdeJsonError,
    CryptographyError,
    KeyObjectNoActiveSigningKey,
    UpstreamUnavailable,
    Timeout,
}

impl OperationError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, OperationError::NoMatchingEntries)
    }
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationError::InvalidClientId(client_id) => {
                write!(f, "invalid client_id {client_id}")
            }
            OperationError::InvalidUpstreamProvider(provider) => {
                write!(f, "invalid upstream provider {provider}")
            }
            OperationError::MissingAttribute(attr) => write!(f, "missing attribute {attr}"),
            other => write!(f, "{other:?}"),
        }
    }
}

impl std::error::Error for OperationError {}

/// A bearer token error at an RFC 6750 protected endpoint. Rendered as a 401
/// or 403 with a `WWW-Authenticate` header carrying `error` and
/// `error_description`.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct BearerTokenError {
    pub code: BearerErrorCode,
    pub description: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum BearerErrorCode {
    InvalidRequest,
    InvalidToken,
    InsufficientScope,
}

impl BearerErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            BearerErrorCode::InvalidRequest => "invalid_request",
            BearerErrorCode::InvalidToken => "invalid_token",
            BearerErrorCode::InsufficientScope => "insufficient_scope",
        }
    }
}

impl BearerTokenError {
    pub fn invalid_token(description: impl Into<String>) -> Self {
        BearerTokenError {
            code: BearerErrorCode::InvalidToken,
            description: description.into(),
        }
    }

    pub fn insufficient_scope(description: impl Into<String>) -> Self {
        BearerTokenError {
            code: BearerErrorCode::InsufficientScope,
            description: description.into(),
        }
    }

    /// The `WWW-Authenticate` header value for this error.
    pub fn www_authenticate(&self, realm: Option<&str>) -> String {
        match realm {
            Some(realm) => format!(
                "Bearer realm=\"{}\", error=\"{}\", error_description=\"{}\"",
                realm,
                self.code.as_str(),
                self.description
            ),
            None => format!(
                "Bearer error=\"{}\", error_description=\"{}\"",
                self.code.as_str(),
                self.description
            ),
        }
    }
}

/// Identifies a session element target row that has been removed underneath
/// the session aggregate.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct DanglingElement {
    pub session: Uuid,
    pub object_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_www_authenticate_render() {
        let err = BearerTokenError::invalid_token("session has ended");
        assert_eq!(
            err.www_authenticate(Some("api")),
            "Bearer realm=\"api\", error=\"invalid_token\", error_description=\"session has ended\""
        );
        assert_eq!(
            err.www_authenticate(None),
            "Bearer error=\"invalid_token\", error_description=\"session has ended\""
        );
    }
}
