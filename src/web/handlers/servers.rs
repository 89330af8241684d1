use axum::extract::State;
use axum::Json;

use crate::models::Server;
use crate::web::errors::ApiResult;
use crate::web::state::AppState;

/// GET /v1/servers
pub async fn list_servers(State(state): State<AppState>) -> ApiResult<Json<Vec<Server>>> {
    Ok(Json(state.core.list_servers().await?))
}
