use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::modules::config as config_store;
use crate::proxy::config::StreamingMode;
use crate::proxy::error::RelayError;
use crate::proxy::rotation::{RotationSnapshot, SwitchOutcome};
use crate::proxy::server::AppState;

#[derive(Serialize)]
struct AccountSummary {
    index: u32,
    name: Option<String>,
}

#[derive(Serialize)]
struct StatusResponse {
    peer_connected: bool,
    pending_requests: usize,
    streaming_mode: StreamingMode,
    rotation: RotationSnapshot,
    accounts: Vec<AccountSummary>,
}

#[derive(Deserialize)]
pub struct SwitchAccountRequest {
    index: Option<u32>,
}

#[derive(Deserialize)]
pub struct StreamingModeRequest {
    mode: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// 200 while serving; 503 once a fatal rotation left the service degraded.
pub async fn health_check(State(state): State<AppState>) -> Response {
    let peer_connected = state.registry.has_peer();
    if state.rotation.is_degraded() {
        let snapshot = state.rotation.snapshot();
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "degraded",
                "peer_connected": peer_connected,
                "last_error": snapshot.last_error,
            })),
        )
            .into_response();
    }
    Json(json!({
        "status": "ok",
        "peer_connected": peer_connected,
    }))
    .into_response()
}

pub async fn get_status(State(state): State<AppState>) -> Response {
    let pool = state.rotation.pool();
    let accounts = pool
        .indices()
        .iter()
        .map(|&index| AccountSummary {
            index,
            name: pool.account_name(index),
        })
        .collect();

    Json(StatusResponse {
        peer_connected: state.registry.has_peer(),
        pending_requests: state.registry.pending_requests(),
        streaming_mode: state.orchestrator.streaming_mode().await,
        rotation: state.rotation.snapshot(),
        accounts,
    })
    .into_response()
}

/// `{"index": n}` activates a specific account; an empty body rotates to the next one.
pub async fn switch_account(
    State(state): State<AppState>,
    payload: Option<Json<SwitchAccountRequest>>,
) -> Response {
    let target = payload.and_then(|Json(p)| p.index);
    let result = match target {
        Some(index) => state.rotation.switch_to_specific(index).await,
        None => state.rotation.switch_to_next().await,
    };

    match result {
        Ok(SwitchOutcome::Switched { from, to }) => Json(json!({
            "switched": true,
            "from": from,
            "current_index": to,
        }))
        .into_response(),
        Ok(outcome @ SwitchOutcome::FellBack { .. }) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, outcome.describe())
        }
        Err(e) => RelayError::Rotation(e).into_response(),
    }
}

pub async fn set_streaming_mode(
    State(state): State<AppState>,
    Json(payload): Json<StreamingModeRequest>,
) -> Response {
    let Some(mode) = StreamingMode::parse(&payload.mode) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("Unknown streaming mode: {} (expected real or fake)", payload.mode),
        );
    };

    state.orchestrator.set_streaming_mode(mode).await;

    if let Some(path) = &state.config_path {
        let persisted = config_store::load_relay_config_from(path).and_then(|mut config| {
            config.streaming_mode = mode;
            config_store::save_relay_config_to(path, &config)
        });
        if let Err(e) = persisted {
            tracing::warn!("Streaming mode changed but not persisted: {}", e);
        }
    }

    Json(json!({ "streaming_mode": mode })).into_response()
}
