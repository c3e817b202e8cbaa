// Relay handler - every path not claimed by the management API
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, Uri},
    response::Response,
};

use crate::proxy::config::StreamingMode;
use crate::proxy::protocol::{is_generative_path, parse_query, sanitize_request_headers, ProxyRequest};
use crate::proxy::server::AppState;

/// Converts the inbound request into a relay envelope and hands it to the orchestrator.
pub async fn handle_relay(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = build_proxy_request(&method, &uri, &headers, &body);
    tracing::debug!(
        request_id = %request.request_id,
        "Received {} {} ({} bytes)",
        request.method,
        request.path,
        body.len()
    );
    state.orchestrator.handle(request).await
}

fn build_proxy_request(method: &Method, uri: &Uri, headers: &HeaderMap, body: &Bytes) -> ProxyRequest {
    let path = uri.path().to_string();
    ProxyRequest {
        is_generative: is_generative_path(&path),
        path,
        method: method.to_string(),
        headers: sanitize_request_headers(
            headers
                .iter()
                .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v))),
        ),
        query_params: parse_query(uri.query()),
        body: String::from_utf8_lossy(body).into_owned(),
        request_id: uuid::Uuid::new_v4().to_string(),
        // decided by the orchestrator
        streaming_mode: StreamingMode::default(),
    }
}
