use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use std::sync::Arc;

use crate::db::entities::{node, node_group};
use crate::db::models::{NewNodeGroup, NodeGroupUpdate};
use crate::services::config_sync::{ProxyConfig, SyncReport};
use crate::services::load_balancer::RebalanceReport;
use crate::web::{AppError, AppState};

async fn list_groups_handler(
    State(app_state): State<Arc<AppState>>,
) -> Result<Json<Vec<node_group::Model>>, AppError> {
    Ok(Json(app_state.control.registry.list_groups().await?))
}

async fn create_group_handler(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<NewNodeGroup>,
) -> Result<(StatusCode, Json<node_group::Model>), AppError> {
    let group = app_state.control.registry.create_group(payload).await?;
    Ok((StatusCode::CREATED, Json(group)))
}

async fn get_group_handler(
    State(app_state): State<Arc<AppState>>,
    Path(group_id): Path<i32>,
) -> Result<Json<node_group::Model>, AppError> {
    Ok(Json(app_state.control.registry.get_group(group_id).await?))
}

async fn update_group_handler(
    State(app_state): State<Arc<AppState>>,
    Path(group_id): Path<i32>,
    Json(payload): Json<NodeGroupUpdate>,
) -> Result<Json<node_group::Model>, AppError> {
    Ok(Json(app_state.control.registry.update_group(group_id, payload).await?))
}

async fn delete_group_handler(
    State(app_state): State<Arc<AppState>>,
    Path(group_id): Path<i32>,
) -> Result<StatusCode, AppError> {
    app_state.control.registry.delete_group(group_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn group_members_handler(
    State(app_state): State<Arc<AppState>>,
    Path(group_id): Path<i32>,
) -> Result<Json<Vec<node::Model>>, AppError> {
    Ok(Json(app_state.control.registry.group_members(group_id).await?))
}

async fn add_member_handler(
    State(app_state): State<Arc<AppState>>,
    Path((group_id, node_id)): Path<(i32, i32)>,
) -> Result<StatusCode, AppError> {
    app_state.control.registry.add_member(group_id, node_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_member_handler(
    State(app_state): State<Arc<AppState>>,
    Path((group_id, node_id)): Path<(i32, i32)>,
) -> Result<StatusCode, AppError> {
    app_state.control.registry.remove_member(group_id, node_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn rebalance_handler(
    State(app_state): State<Arc<AppState>>,
    Path(group_id): Path<i32>,
) -> Result<Json<RebalanceReport>, AppError> {
    Ok(Json(app_state.control.balancer.rebalance(group_id).await?))
}

async fn sync_group_handler(
    State(app_state): State<Arc<AppState>>,
    Path(group_id): Path<i32>,
    Json(config): Json<ProxyConfig>,
) -> Result<Json<SyncReport>, AppError> {
    Ok(Json(app_state.control.sync.sync_to_group(group_id, &config).await?))
}

pub fn create_group_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_groups_handler).post(create_group_handler))
        .route(
            "/{group_id}",
            get(get_group_handler)
                .put(update_group_handler)
                .delete(delete_group_handler),
        )
        .route("/{group_id}/nodes", get(group_members_handler))
        .route(
            "/{group_id}/nodes/{node_id}",
            put(add_member_handler).delete(remove_member_handler),
        )
        .route("/{group_id}/rebalance", post(rebalance_handler))
        .route("/{group_id}/sync", post(sync_group_handler))
}
