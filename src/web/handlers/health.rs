//! # Health Check Handler
//!
//! Reports store connectivity and whether the worker pool is shutting down.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use tracing::error;

use crate::web::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    store: String,
    shutting_down: bool,
    timestamp: String,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let report = state.core.health().await;
    let status_code = if report.healthy {
        StatusCode::OK
    } else {
        error!(store = %report.store, shutting_down = report.shutting_down, "Health check failed");
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(HealthResponse {
            status: if report.healthy { "healthy" } else { "unhealthy" },
            store: report.store,
            shutting_down: report.shutting_down,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }),
    )
}
