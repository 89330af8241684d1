//! # Billing Hooks
//!
//! Billing calls these when a subscription is paid for or cancelled.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::Value;

use crate::models::ProvisioningTask;
use crate::web::errors::{ApiError, ApiResult};
use crate::web::state::AppState;

/// POST /v1/subscriptions/:id/paid
pub async fn subscription_paid(
    State(state): State<AppState>,
    Path(subscription_id): Path<i64>,
    Json(payload): Json<Value>,
) -> ApiResult<(StatusCode, Json<ProvisioningTask>)> {
    if !payload.is_object() {
        return Err(ApiError::bad_request("payload must be a JSON object"));
    }
    let task = state
        .core
        .on_subscription_paid(subscription_id, payload)
        .await?;
    Ok((StatusCode::CREATED, Json(task)))
}

/// POST /v1/subscriptions/:id/cancelled
///
/// Returns the affected task, if the subscription had an active one.
pub async fn subscription_cancelled(
    State(state): State<AppState>,
    Path(subscription_id): Path<i64>,
) -> ApiResult<Json<Option<ProvisioningTask>>> {
    Ok(Json(
        state.core.on_subscription_cancelled(subscription_id).await?,
    ))
}
