use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use crate::orchestration::WindowStats;
use crate::web::errors::ApiResult;
use crate::web::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    /// Window in days; the configured default when absent
    pub window: Option<u32>,
}

/// GET /v1/stats[?window=]
pub async fn window_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Json<WindowStats>> {
    Ok(Json(state.core.window_stats(query.window).await?))
}
