//! Metrics exposition endpoint

use axum::{extract::State, http::header, response::IntoResponse};

use crate::api::{error::ApiResult, state::ApiState};
use crate::metrics::CONTENT_TYPE;

/// GET /metrics
pub async fn export(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    let body = state.metrics.snapshot()?;
    Ok(([(header::CONTENT_TYPE, CONTENT_TYPE)], body))
}
