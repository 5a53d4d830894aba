//! Request-scoped middleware: operation ids, version tagging and the
//! security header family.

use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

use super::ServerState;

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Every response names the exact server version. Operators grep for this
/// when proxied deployments drift.
pub async fn version_middleware(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(SERVER_VERSION) {
        response
            .headers_mut()
            .insert("X-TUNNISTAMO-VERSION", value);
    }
    response
}

#[derive(Clone)]
pub struct KOpId {
    pub eventid: Uuid,
}

/// First middleware in, last out: stamps the operation id used to correlate
/// log lines with the response a client saw.
pub async fn kopid_middleware(mut request: Request, next: Next) -> Response {
    let eventid = sketching::tracing_forest::id();
    request.extensions_mut().insert(KOpId { eventid });
    let mut response = next.run(request).await;

    if let Ok(value) = HeaderValue::from_str(&eventid.as_hyphenated().to_string()) {
        response.headers_mut().insert("X-TUNNISTAMO-OPID", value);
    }
    response
}

/// The boring-but-mandatory header set, plus the configured CSP.
pub async fn security_headers_layer(
    State(state): State<ServerState>,
    request: Request,
    next: Next,
) -> Response {
    let token_endpoint = matches!(
        request.uri().path().trim_end_matches('/'),
        tunnistamo_proto::constants::uri::OAUTH2_TOKEN
            | tunnistamo_proto::constants::uri::API_TOKENS
            | tunnistamo_proto::constants::uri::JWT_TOKEN
    );
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "X-Content-Type-Options",
        HeaderValue::from_static("nosniff"),
    );
    if let Some((name, value)) = state.csp_header.as_ref() {
        headers.insert(name.clone(), value.clone());
    }
    if token_endpoint {
        headers.insert(
            axum::http::header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        );
        headers.insert(
            axum::http::header::PRAGMA,
            HeaderValue::from_static("no-cache"),
        );
    }
    response
}
