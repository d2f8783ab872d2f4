//! Routes called by node agents. They authenticate with their node token,
//! never with the admin key.

use axum::{
    extract::{ConnectInfo, State},
    routing::post,
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::agent_service::{
    Ack, HeartbeatRequest, HeartbeatResponse, RegisterRequest, RegisterResponse,
    ReportMetricsRequest,
};
use crate::web::{AppError, AppState};

async fn register_handler(
    State(app_state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, AppError> {
    Ok(Json(app_state.control.agents.register(payload, addr.ip()).await?))
}

async fn heartbeat_handler(
    State(app_state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, AppError> {
    Ok(Json(app_state.control.agents.heartbeat(payload, addr.ip()).await?))
}

async fn metrics_handler(
    State(app_state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<ReportMetricsRequest>,
) -> Result<Json<Ack>, AppError> {
    Ok(Json(app_state.control.agents.report_metrics(payload, addr.ip()).await?))
}

pub fn create_agent_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/register", post(register_handler))
        .route("/heartbeat", post(heartbeat_handler))
        .route("/metrics", post(metrics_handler))
}
