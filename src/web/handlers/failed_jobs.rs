use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::models::FailedJobRecord;
use crate::web::errors::ApiResult;
use crate::web::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ClearQuery {
    pub task_id: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ClearResponse {
    pub count: usize,
    pub cleared: Vec<FailedJobRecord>,
}

/// GET /v1/failed_jobs
pub async fn list_failed_jobs(State(state): State<AppState>) -> ApiResult<Json<Vec<FailedJobRecord>>> {
    Ok(Json(state.core.failed_jobs().await?))
}

/// DELETE /v1/failed_jobs[?task_id=]
pub async fn clear_failed_jobs(
    State(state): State<AppState>,
    Query(query): Query<ClearQuery>,
) -> ApiResult<Json<ClearResponse>> {
    let cleared = state.core.clear_failed_jobs(query.task_id).await?;
    Ok(Json(ClearResponse {
        count: cleared.len(),
        cleared,
    }))
}
