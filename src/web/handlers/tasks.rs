//! # Task Handlers
//!
//! Task listing, detail, transition history, admin retry and manual provisioning.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use tracing::info;

use crate::models::{ProvisioningTask, TaskTransition};
use crate::orchestration::ManualProvisionRequest;
use crate::state_machine::TaskStatus;
use crate::web::errors::{ApiError, ApiResult};
use crate::web::state::AppState;

#[derive(Debug, Deserialize)]
pub struct TaskListQuery {
    pub status: Option<String>,
}

/// GET /v1/tasks[?status=]
pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<TaskListQuery>,
) -> ApiResult<Json<Vec<ProvisioningTask>>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<TaskStatus>)
        .transpose()
        .map_err(ApiError::bad_request)?;

    Ok(Json(state.core.list_tasks(status).await?))
}

/// GET /v1/tasks/:id
pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> ApiResult<Json<ProvisioningTask>> {
    Ok(Json(state.core.get_task(task_id).await?))
}

/// GET /v1/tasks/:id/transitions
pub async fn task_transitions(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> ApiResult<Json<Vec<TaskTransition>>> {
    Ok(Json(state.core.transitions(task_id).await?))
}

/// POST /v1/tasks/:id/retry
pub async fn retry_task(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> ApiResult<Json<ProvisioningTask>> {
    let task = state.core.retry(task_id).await?;
    info!(task_id, step = ?task.step, "Admin retry accepted");
    Ok(Json(task))
}

/// POST /v1/provision
pub async fn manual_provision(
    State(state): State<AppState>,
    Json(request): Json<ManualProvisionRequest>,
) -> ApiResult<(StatusCode, Json<ProvisioningTask>)> {
    let task = state.core.manual_provision(request).await?;
    Ok((StatusCode::CREATED, Json(task)))
}
