//! # Admin Dashboard API
//!
//! JSON over HTTP for operators and the billing hook. Every handler delegates to
//! [`ProvisionerCore`]; admin actions are recorded in the task transition log.

use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

use crate::config::WebConfig;
use crate::error::{ProvisionerError, ProvisionerResult};
use crate::orchestration::ProvisionerCore;

pub mod errors;
pub mod handlers;
pub mod routes;
pub mod state;

pub use errors::{ApiError, ApiResult};
pub use state::AppState;

/// Build the admin application with all routes and middleware
pub fn create_app(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .merge(routes::health_routes())
        .merge(routes::task_routes())
        .merge(routes::failed_job_routes())
        .merge(routes::stats_routes())
        .merge(routes::server_routes())
        .merge(routes::billing_routes())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve the admin API until `shutdown` resolves
pub async fn serve(
    core: Arc<ProvisionerCore>,
    config: &WebConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> ProvisionerResult<()> {
    let app = create_app(
        AppState::new(core),
        Duration::from_millis(config.request_timeout_ms),
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .map_err(|e| {
            ProvisionerError::ConfigurationError(format!(
                "Cannot bind admin API to {}: {e}",
                config.bind_address
            ))
        })?;

    info!(address = %config.bind_address, "🌐 Admin API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ProvisionerError::Internal(format!("Admin API server error: {e}")))
}
