use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::agent_service::AgentCommand;
use crate::db::entities::{health_check, node, node_group, node_traffic};
use crate::db::models::{NewNode, NodeFilter, NodeUpdate};
use crate::db::TrafficRepository;
use crate::error::ControlError;
use crate::server::agent_handler::MetricsSnapshot;
use crate::server::command_dispatcher::DispatchOutcome;
use crate::services::config_sync::ProxyConfig;
use crate::services::node_registry::{DeleteReport, RegisteredNode};
use crate::web::{AppError, AppState};

const DEFAULT_HISTORY_LIMIT: u64 = 50;
const MAX_HISTORY_LIMIT: u64 = 1000;

#[derive(Deserialize)]
pub struct HistoryQuery {
    limit: Option<u64>,
}

#[derive(Deserialize)]
pub struct TrafficQuery {
    user_id: Option<i32>,
    limit: Option<u64>,
}

#[derive(Deserialize)]
pub struct CommandRequest {
    command: AgentCommand,
}

#[derive(Deserialize)]
pub struct LatencyReport {
    latency_ms: Option<i32>,
}

#[derive(Serialize)]
pub struct TokenResponse {
    node_id: i32,
    token: String,
}

#[derive(Serialize)]
pub struct ResyncResponse {
    node_id: i32,
    synced: bool,
}

fn clamp_limit(limit: Option<u64>) -> u64 {
    limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT)
}

async fn list_nodes_handler(
    State(app_state): State<Arc<AppState>>,
    Query(filter): Query<NodeFilter>,
) -> Result<Json<Vec<node::Model>>, AppError> {
    Ok(Json(app_state.control.registry.list_nodes(&filter).await?))
}

async fn create_node_handler(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<NewNode>,
) -> Result<(StatusCode, Json<RegisteredNode>), AppError> {
    let created = app_state.control.registry.create_node(payload).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_node_handler(
    State(app_state): State<Arc<AppState>>,
    Path(node_id): Path<i32>,
) -> Result<Json<node::Model>, AppError> {
    Ok(Json(app_state.control.registry.get_node(node_id).await?))
}

async fn update_node_handler(
    State(app_state): State<Arc<AppState>>,
    Path(node_id): Path<i32>,
    Json(payload): Json<NodeUpdate>,
) -> Result<Json<node::Model>, AppError> {
    Ok(Json(app_state.control.registry.update_node(node_id, payload).await?))
}

async fn delete_node_handler(
    State(app_state): State<Arc<AppState>>,
    Path(node_id): Path<i32>,
) -> Result<Json<DeleteReport>, AppError> {
    Ok(Json(app_state.control.delete_node(node_id).await?))
}

async fn node_groups_handler(
    State(app_state): State<Arc<AppState>>,
    Path(node_id): Path<i32>,
) -> Result<Json<Vec<node_group::Model>>, AppError> {
    Ok(Json(app_state.control.registry.groups_for_node(node_id).await?))
}

async fn trigger_health_check_handler(
    State(app_state): State<Arc<AppState>>,
    Path(node_id): Path<i32>,
) -> Result<Json<health_check::Model>, AppError> {
    Ok(Json(app_state.control.health.check_now(node_id).await?))
}

async fn health_history_handler(
    State(app_state): State<Arc<AppState>>,
    Path(node_id): Path<i32>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<health_check::Model>>, AppError> {
    let rows = app_state
        .control
        .health
        .history(node_id, clamp_limit(query.limit))
        .await?;
    Ok(Json(rows))
}

async fn traffic_handler(
    State(app_state): State<Arc<AppState>>,
    Path(node_id): Path<i32>,
    Query(query): Query<TrafficQuery>,
) -> Result<Json<Vec<node_traffic::Model>>, AppError> {
    app_state.control.registry.get_node(node_id).await?;
    let rows = app_state
        .control
        .store
        .list_traffic(node_id, query.user_id, clamp_limit(query.limit))
        .await
        .map_err(ControlError::from)?;
    Ok(Json(rows))
}

async fn metrics_handler(
    State(app_state): State<Arc<AppState>>,
    Path(node_id): Path<i32>,
) -> Result<Json<MetricsSnapshot>, AppError> {
    app_state
        .control
        .agents
        .latest_metrics(node_id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Metrics for node {node_id}")))
}

async fn update_metrics_handler(
    State(app_state): State<Arc<AppState>>,
    Path(node_id): Path<i32>,
    Json(payload): Json<LatencyReport>,
) -> Result<StatusCode, AppError> {
    app_state
        .control
        .registry
        .update_metrics(node_id, payload.latency_ms)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn issue_token_handler(
    State(app_state): State<Arc<AppState>>,
    Path(node_id): Path<i32>,
) -> Result<Json<TokenResponse>, AppError> {
    let token = app_state.control.auth.issue_token(node_id).await?;
    Ok(Json(TokenResponse { node_id, token }))
}

async fn rotate_token_handler(
    State(app_state): State<Arc<AppState>>,
    Path(node_id): Path<i32>,
) -> Result<Json<TokenResponse>, AppError> {
    let token = app_state.control.auth.rotate_token(node_id).await?;
    Ok(Json(TokenResponse { node_id, token }))
}

async fn revoke_token_handler(
    State(app_state): State<Arc<AppState>>,
    Path(node_id): Path<i32>,
) -> Result<StatusCode, AppError> {
    app_state.control.auth.revoke_token(node_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn command_handler(
    State(app_state): State<Arc<AppState>>,
    Path(node_id): Path<i32>,
    Json(payload): Json<CommandRequest>,
) -> Result<Json<DispatchOutcome>, AppError> {
    let outcome = app_state
        .control
        .dispatcher
        .execute(node_id, payload.command)
        .await?;
    Ok(Json(outcome))
}

async fn sync_node_handler(
    State(app_state): State<Arc<AppState>>,
    Path(node_id): Path<i32>,
    Json(config): Json<ProxyConfig>,
) -> Result<StatusCode, AppError> {
    app_state.control.sync.sync_to_node(node_id, &config).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn resync_node_handler(
    State(app_state): State<Arc<AppState>>,
    Path(node_id): Path<i32>,
) -> Result<Json<ResyncResponse>, AppError> {
    let synced = app_state.control.sync.resync_node(node_id).await?;
    Ok(Json(ResyncResponse { node_id, synced }))
}

pub fn create_node_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_nodes_handler).post(create_node_handler))
        .route(
            "/{node_id}",
            get(get_node_handler)
                .put(update_node_handler)
                .delete(delete_node_handler),
        )
        .route("/{node_id}/groups", get(node_groups_handler))
        .route("/{node_id}/health-check", post(trigger_health_check_handler))
        .route("/{node_id}/health-checks", get(health_history_handler))
        .route("/{node_id}/traffic", get(traffic_handler))
        .route(
            "/{node_id}/metrics",
            get(metrics_handler).put(update_metrics_handler),
        )
        .route(
            "/{node_id}/token",
            post(issue_token_handler).delete(revoke_token_handler),
        )
        .route("/{node_id}/token/rotate", post(rotate_token_handler))
        .route("/{node_id}/command", post(command_handler))
        .route("/{node_id}/sync", post(sync_node_handler))
        .route("/{node_id}/resync", post(resync_node_handler))
}
