use thiserror::Error;

use crate::db::StoreError;

/// Errors surfaced by the control-plane components.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("Node {0} is offline")]
    NodeOffline(i32),
    #[error("Node {0} is unhealthy")]
    NodeUnhealthy(i32),
    #[error("Node {0} is at capacity")]
    NodeAtCapacity(i32),
    #[error("Invalid token")]
    InvalidToken,
    #[error("Token has been revoked")]
    TokenRevoked,
    #[error("IP {0} is temporarily blocked")]
    IpBlocked(String),
    #[error("IP {0} is not allowed")]
    IpNotAllowed(String),
    #[error("Config sync to node {node_id} failed: {reason}")]
    SyncFailed { node_id: i32, reason: String },
    #[error("No healthy nodes available")]
    NoHealthyNodes,
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Node {node_id} still has unmigrated users: {unmigrated:?}")]
    NodeHasUsers { node_id: i32, unmigrated: Vec<i32> },
    #[error("Agent transport error: {0}")]
    Transport(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

pub type ControlResult<T> = Result<T, ControlError>;

impl From<StoreError> for ControlError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ControlError::NotFound(what),
            StoreError::Conflict(msg) => ControlError::Conflict(msg),
            StoreError::AtCapacity(node_id) => ControlError::NodeAtCapacity(node_id),
            StoreError::Database(e) => ControlError::Storage(e.to_string()),
        }
    }
}

impl From<sea_orm::DbErr> for ControlError {
    fn from(err: sea_orm::DbErr) -> Self {
        ControlError::Storage(err.to_string())
    }
}
