use axum::{
    body::Body as AxumBody,
    extract::State,
    http::{header, Request},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::warn;

use crate::services::auth_guard::tokens_match;
use crate::web::{error::AppError, AppState};

pub const API_KEY_HEADER: &str = "x-api-key";

/// Admin routes accept the configured API key as a bearer token or in `X-API-Key`.
pub async fn auth(
    State(state): State<Arc<AppState>>,
    req: Request<AxumBody>,
    next: Next,
) -> Result<Response, AppError> {
    let headers = req.headers();
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .or_else(|| headers.get(API_KEY_HEADER).and_then(|value| value.to_str().ok()))
        .ok_or_else(|| AppError::Unauthorized("missing API key".to_string()))?;

    if !tokens_match(presented, &state.config.admin_api_key) {
        warn!(path = %req.uri().path(), "Rejected admin request with a wrong API key.");
        return Err(AppError::Unauthorized("invalid API key".to_string()));
    }
    Ok(next.run(req).await)
}
