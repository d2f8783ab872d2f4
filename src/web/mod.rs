use axum::{
    http::Method,
    middleware as axum_middleware,
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::server::config::ServerConfig;
use crate::server::control_plane::ControlPlane;
use crate::version::VERSION;
use crate::web::{middleware::auth, routes::*};

pub mod error;
pub mod middleware;
pub mod routes;

pub use error::AppError;

#[derive(Clone)]
pub struct AppState {
    pub control: Arc<ControlPlane>,
    pub config: Arc<ServerConfig>,
}

async fn health_check_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "version": VERSION }))
}

pub fn create_axum_router(control: Arc<ControlPlane>, config: Arc<ServerConfig>) -> Router {
    let app_state = Arc::new(AppState { control, config });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(vec![
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_check_handler))
        .nest("/agent", agent_routes::create_agent_router())
        .nest(
            "/api/nodes",
            node_routes::create_node_router()
                .route_layer(axum_middleware::from_fn_with_state(app_state.clone(), auth::auth)),
        )
        .nest(
            "/api/groups",
            group_routes::create_group_router()
                .route_layer(axum_middleware::from_fn_with_state(app_state.clone(), auth::auth)),
        )
        .nest(
            "/api/users",
            user_routes::create_user_router()
                .route_layer(axum_middleware::from_fn_with_state(app_state.clone(), auth::auth)),
        )
        .nest(
            "/api/config",
            sync_routes::create_sync_router()
                .route_layer(axum_middleware::from_fn_with_state(app_state.clone(), auth::auth)),
        )
        .with_state(app_state)
        .layer(cors)
}
