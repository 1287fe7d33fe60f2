//! HTTP endpoint handlers

use axum::{extract::State, response::Json};

use super::responses::{HealthResponse, StatusResponse};
use crate::state::AppState;

/// Handle GET /status - Return lifecycle phase and the last reap cycle
pub async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        phase: state.phase(),
        uptime: state.get_uptime(),
        started_at: state.started_at,
        records: state.db.len().await,
        last_reap: state.last_reap(),
    })
}

/// Handle GET /health - Health check endpoint
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::ok())
}
