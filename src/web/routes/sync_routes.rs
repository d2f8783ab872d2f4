use axum::{extract::State, routing::get, Json, Router};
use std::sync::Arc;

use crate::services::config_sync::{ProxyConfig, SyncReport};
use crate::web::{AppError, AppState};

async fn get_config_handler(
    State(app_state): State<Arc<AppState>>,
) -> Result<Json<ProxyConfig>, AppError> {
    app_state
        .control
        .sync
        .active_config()
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound("Active config".to_string()))
}

async fn sync_all_handler(
    State(app_state): State<Arc<AppState>>,
    Json(config): Json<ProxyConfig>,
) -> Result<Json<SyncReport>, AppError> {
    Ok(Json(app_state.control.sync.sync_to_all(&config).await?))
}

pub fn create_sync_router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(get_config_handler).post(sync_all_handler))
}
