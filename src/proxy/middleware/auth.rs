//! API key authentication for the relay router.
//!
//! Keys are accepted from `x-goog-api-key`, `Authorization: Bearer <key>` or the
//! `key` query parameter, the same places Google's client libraries put them.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::proxy::protocol::API_KEY_QUERY_PARAM;
use crate::proxy::security::ProxySecurityConfig;

const API_KEY_HEADER: &str = "x-goog-api-key";

/// Paths reachable without a key
fn is_public_path(path: &str) -> bool {
    path == "/healthz"
}

fn extract_api_key(request: &Request) -> Option<String> {
    let headers = request.headers();

    if let Some(key) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        return Some(key.trim().to_string());
    }

    if let Some(key) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(key.trim().to_string());
    }

    request.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            (name == API_KEY_QUERY_PARAM).then(|| value.to_string())
        })
    })
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": {
                "code": 401,
                "message": message,
                "status": "UNAUTHENTICATED",
            }
        })),
    )
        .into_response()
}

pub async fn auth_middleware(
    State(security): State<Arc<RwLock<ProxySecurityConfig>>>,
    request: Request,
    next: Next,
) -> Response {
    if is_public_path(request.uri().path()) {
        return next.run(request).await;
    }

    let security = security.read().await.clone();
    if !security.auth_enabled() {
        return next.run(request).await;
    }

    match extract_api_key(&request) {
        Some(key) if security.accepts(&key) => next.run(request).await,
        Some(_) => {
            tracing::warn!("Rejected request to {} with an invalid API key", request.uri().path());
            unauthorized("API key not valid")
        }
        None => {
            tracing::debug!("Rejected request to {} without API key", request.uri().path());
            unauthorized("Missing API key")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request(uri: &str, headers: &[(&str, &str)]) -> Request {
        let mut builder = Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_extract_api_key_sources() {
        assert_eq!(
            extract_api_key(&request("/v1beta/models", &[("x-goog-api-key", "k1")])).as_deref(),
            Some("k1")
        );
        assert_eq!(
            extract_api_key(&request("/v1beta/models", &[("authorization", "Bearer k2")]))
                .as_deref(),
            Some("k2")
        );
        assert_eq!(
            extract_api_key(&request("/v1beta/models?alt=sse&key=k3", &[])).as_deref(),
            Some("k3")
        );
        assert_eq!(extract_api_key(&request("/v1beta/models", &[])), None);
    }

    #[test]
    fn test_public_paths() {
        assert!(is_public_path("/healthz"));
        assert!(!is_public_path("/api/status"));
    }
}
