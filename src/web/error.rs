use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::error::ControlError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Not Found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Control(#[from] ControlError),
}

fn control_status(err: &ControlError) -> StatusCode {
    match err {
        ControlError::NotFound(_) => StatusCode::NOT_FOUND,
        ControlError::InvalidAddress(_) | ControlError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        ControlError::InvalidToken | ControlError::TokenRevoked => StatusCode::UNAUTHORIZED,
        ControlError::IpNotAllowed(_) => StatusCode::FORBIDDEN,
        ControlError::IpBlocked(_) => StatusCode::TOO_MANY_REQUESTS,
        ControlError::NoHealthyNodes
        | ControlError::NodeAtCapacity(_)
        | ControlError::NodeOffline(_)
        | ControlError::NodeUnhealthy(_) => StatusCode::SERVICE_UNAVAILABLE,
        ControlError::SyncFailed { .. } | ControlError::Transport(_) => StatusCode::BAD_GATEWAY,
        ControlError::Conflict(_) | ControlError::NodeHasUsers { .. } => StatusCode::CONFLICT,
        ControlError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::InvalidInput(msg) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": msg }),
            ),
            AppError::Unauthorized(msg) => (
                StatusCode::UNAUTHORIZED,
                serde_json::json!({ "error": msg }),
            ),
            AppError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                serde_json::json!({ "error": format!("{msg} not found") }),
            ),
            AppError::Control(err) => {
                let status = control_status(&err);
                if status == StatusCode::INTERNAL_SERVER_ERROR {
                    tracing::error!(error = %err, "Request failed with an internal error.");
                }
                let body = match &err {
                    ControlError::NodeHasUsers { unmigrated, .. } => serde_json::json!({
                        "error": err.to_string(),
                        "unmigrated": unmigrated,
                    }),
                    _ => serde_json::json!({ "error": err.to_string() }),
                };
                (status, body)
            }
        };
        (status, Json(body)).into_response()
    }
}
