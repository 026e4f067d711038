//! Target endpoints

use axum::{
    Json,
    extract::{Path, State},
};

use crate::api::{
    error::{ApiError, ApiResult},
    state::ApiState,
    types::{TargetDetail, TargetView, TargetsResponse},
};
use crate::target::DatabaseTarget;

const HISTORY_LIMIT: usize = 20;

async fn view(state: &ApiState, target: &DatabaseTarget) -> TargetView {
    TargetView {
        summary: target.summary(),
        pool: target.pool().stats(),
        latest: state.history.latest(target.name()).await,
    }
}

/// GET /api/v1/targets
pub async fn list_targets(State(state): State<ApiState>) -> Json<TargetsResponse> {
    let mut targets = Vec::with_capacity(state.targets.len());
    for target in state.targets.all() {
        targets.push(view(&state, target).await);
    }

    Json(TargetsResponse {
        count: targets.len(),
        targets,
    })
}

/// GET /api/v1/targets/:name
pub async fn get_target(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<Json<TargetDetail>> {
    let target = state
        .targets
        .get(&name)
        .ok_or_else(|| ApiError::NotFound(format!("no database named '{name}'")))?;

    Ok(Json(TargetDetail {
        target: view(&state, &target).await,
        history: state.history.recent(&name, HISTORY_LIMIT).await,
    }))
}
