//! Health and status endpoints

use std::sync::Arc;

use axum::{Json, Router, extract::State, middleware, routing::get};
use serde::Serialize;

use super::{ApiState, gate::require_unblocked_device};
use crate::control::StoreMode;
use crate::telemetry::TelemetrySnapshot;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Gateway status response
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub version: &'static str,
    pub store_mode: StoreMode,
    /// `None` until the store reports connectivity
    pub connected: Option<bool>,
    pub block_list: BlockListStatus,
    pub telemetry: TelemetrySnapshot,
}

#[derive(Serialize)]
pub struct BlockListStatus {
    pub populated: bool,
    pub blocked: usize,
}

/// Liveness check for the process
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Store mode, connectivity, block-list and failure counters
async fn status(State(state): State<Arc<ApiState>>) -> Json<StatusResponse> {
    let control = &state.control;
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        store_mode: control.mode(),
        connected: control.monitor().is_connected(),
        block_list: BlockListStatus {
            populated: control.gate().is_populated(),
            blocked: control.gate().blocked_count(),
        },
        telemetry: control.telemetry().snapshot(),
    })
}

/// Ungated routes
pub fn router() -> Router {
    Router::new().route("/health", get(health))
}

/// Routes behind the device gate
pub fn gated_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_unblocked_device,
        ))
        .with_state(state)
}
