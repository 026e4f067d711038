//! Liveness endpoint

use axum::{Json, extract::State};
use chrono::Utc;

use crate::api::{state::ApiState, types::HealthResponse};

/// GET /health
///
/// Answers as long as the process is serving; says nothing about the targets
pub async fn health_check(State(state): State<ApiState>) -> Json<HealthResponse> {
    let now = Utc::now();
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: now.to_rfc3339(),
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: (now - state.started_at).num_seconds(),
    })
}
