//! Admin API route definitions grouped by resource.

use axum::{
    routing::{get, post},
    Router,
};

use crate::web::{handlers, state::AppState};

/// Liveness and store connectivity
pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(handlers::health::health_check))
}

/// Task inspection and admin actions
pub fn task_routes() -> Router<AppState> {
    Router::new()
        .route("/v1/tasks", get(handlers::tasks::list_tasks))
        .route("/v1/tasks/:id", get(handlers::tasks::get_task))
        .route(
            "/v1/tasks/:id/transitions",
            get(handlers::tasks::task_transitions),
        )
        .route("/v1/tasks/:id/retry", post(handlers::tasks::retry_task))
        .route("/v1/provision", post(handlers::tasks::manual_provision))
}

/// Dead-letter list
pub fn failed_job_routes() -> Router<AppState> {
    Router::new().route(
        "/v1/failed_jobs",
        get(handlers::failed_jobs::list_failed_jobs).delete(handlers::failed_jobs::clear_failed_jobs),
    )
}

pub fn stats_routes() -> Router<AppState> {
    Router::new().route("/v1/stats", get(handlers::stats::window_stats))
}

pub fn server_routes() -> Router<AppState> {
    Router::new().route("/v1/servers", get(handlers::servers::list_servers))
}

/// Hooks called by billing
pub fn billing_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/v1/subscriptions/:id/paid",
            post(handlers::billing::subscription_paid),
        )
        .route(
            "/v1/subscriptions/:id/cancelled",
            post(handlers::billing::subscription_cancelled),
        )
}
