use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::entities::{node, user_node_assignment};
use crate::db::AssignmentRepository;
use crate::error::ControlError;
use crate::services::load_balancer::SelectOptions;
use crate::web::{AppError, AppState};

#[derive(Deserialize)]
pub struct SelectRequest {
    user_id: i32,
    #[serde(default)]
    options: SelectOptions,
}

/// With `node_id` the user is pinned to that node; otherwise the balancer picks.
#[derive(Deserialize, Default)]
pub struct AssignRequest {
    node_id: Option<i32>,
    #[serde(default)]
    options: SelectOptions,
}

#[derive(Serialize)]
pub struct AssignmentResponse {
    node: node::Model,
    assignment: user_node_assignment::Model,
}

async fn select_node_handler(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<SelectRequest>,
) -> Result<Json<node::Model>, AppError> {
    let node = app_state
        .control
        .balancer
        .select_node(payload.user_id, &payload.options)
        .await?;
    Ok(Json(node))
}

async fn get_assignment_handler(
    State(app_state): State<Arc<AppState>>,
    Path(user_id): Path<i32>,
) -> Result<Json<user_node_assignment::Model>, AppError> {
    app_state
        .control
        .store
        .get_assignment(user_id)
        .await
        .map_err(ControlError::from)?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Assignment for user {user_id}")))
}

async fn assign_handler(
    State(app_state): State<Arc<AppState>>,
    Path(user_id): Path<i32>,
    Json(payload): Json<AssignRequest>,
) -> Result<Json<AssignmentResponse>, AppError> {
    let balancer = &app_state.control.balancer;
    let (node, assignment) = match payload.node_id {
        Some(node_id) => {
            let assignment = balancer.assign_user(user_id, node_id).await?;
            let node = app_state.control.registry.get_node(node_id).await?;
            (node, assignment)
        }
        None => balancer.select_and_assign(user_id, &payload.options).await?,
    };
    Ok(Json(AssignmentResponse { node, assignment }))
}

async fn unassign_handler(
    State(app_state): State<Arc<AppState>>,
    Path(user_id): Path<i32>,
) -> Result<StatusCode, AppError> {
    match app_state.control.balancer.unassign_user(user_id).await? {
        Some(_) => Ok(StatusCode::NO_CONTENT),
        None => Err(AppError::NotFound(format!("Assignment for user {user_id}"))),
    }
}

pub fn create_user_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/select", post(select_node_handler))
        .route(
            "/{user_id}/assignment",
            get(get_assignment_handler)
                .post(assign_handler)
                .delete(unassign_handler),
        )
}
