//! Server health route.

use axum::Json;
use axum::extract::State;
use serde::Serialize;
use std::sync::Arc;

use super::{ApiResponse, ApiResult};
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub workers_running: usize,
    pub clients_connected: usize,
    pub database: String,
}

/// Liveness and basic runtime stats
pub async fn health(State(state): State<Arc<AppState>>) -> ApiResult<HealthResponse> {
    let database = match state.db.ping() {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("error: {e}"),
    };

    Ok(ApiResponse::ok(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        workers_running: state.supervisor.worker_count().await,
        clients_connected: state.broadcaster.client_count().await,
        database,
    }))
}
