//! Dynamic CORS for the API endpoints browsers call directly.
//!
//! Only a fixed set of paths participates: discovery, JWKS, introspection
//! and the api-token endpoints. The allowed origins are derived from the
//! registered client redirect uris and rebuilt whenever a client changes,
//! so no restart is needed after registering a new client. Any CORS header
//! set earlier in the stack is stripped before ours is applied.

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use tunnistamo_proto::constants::uri;

use super::ServerState;

fn cors_path(path: &str) -> bool {
    matches!(
        path.trim_end_matches('/'),
        uri::OIDC_DISCOVERY
            | uri::OIDC_JWKS
            | uri::OAUTH2_INTROSPECT
            | uri::API_TOKENS
            | uri::JWT_TOKEN
    )
}

fn strip_cors_headers(response: &mut Response) {
    let headers = response.headers_mut();
    headers.remove(header::ACCESS_CONTROL_ALLOW_ORIGIN);
    headers.remove(header::ACCESS_CONTROL_ALLOW_METHODS);
    headers.remove(header::ACCESS_CONTROL_ALLOW_HEADERS);
    headers.remove(header::ACCESS_CONTROL_ALLOW_CREDENTIALS);
}

pub async fn cors_middleware(
    State(state): State<ServerState>,
    request: Request,
    next: Next,
) -> Response {
    if !cors_path(request.uri().path()) {
        return next.run(request).await;
    }

    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let allowed = origin
        .as_deref()
        .map(|o| state.idms.origin_allowed(o))
        .unwrap_or(false);
    let origin_value = origin.and_then(|o| HeaderValue::from_str(&o).ok());

    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        if allowed {
            if let Some(value) = origin_value {
                let headers = response.headers_mut();
                headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
                headers.insert(
                    header::ACCESS_CONTROL_ALLOW_METHODS,
                    HeaderValue::from_static("GET, POST, OPTIONS"),
                );
                headers.insert(
                    header::ACCESS_CONTROL_ALLOW_HEADERS,
                    HeaderValue::from_static("authorization, content-type"),
                );
            }
        }
        response
            .headers_mut()
            .insert(header::VARY, HeaderValue::from_static("Origin"));
        return response;
    }

    let mut response = next.run(request).await;
    strip_cors_headers(&mut response);
    if allowed {
        if let Some(value) = origin_value {
            response
                .headers_mut()
                .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
    }
    response
        .headers_mut()
        .insert(header::VARY, HeaderValue::from_static("Origin"));
    response
}
