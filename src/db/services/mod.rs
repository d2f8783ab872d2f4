//! SeaORM data access, one module per entity. Functions take any
//! `ConnectionTrait` so they run equally against a pool or inside a
//! transaction; the multi-row operations open their own transaction.

pub mod assignment_service;
pub mod auth_failure_service;
pub mod group_service;
pub mod health_check_service;
pub mod node_service;
pub mod proxy_config_service;
pub mod traffic_service;

use sea_orm::{DbErr, SqlErr, TransactionError};

use crate::db::repository::StoreError;

pub(crate) fn flatten_txn(err: TransactionError<StoreError>) -> StoreError {
    match err {
        TransactionError::Connection(e) => StoreError::Database(e),
        TransactionError::Transaction(e) => e,
    }
}

/// Maps unique-constraint violations to `Conflict`, everything else to `Database`.
pub(crate) fn conflict_on_unique(err: DbErr, what: &str) -> StoreError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(_)) => StoreError::Conflict(what.to_string()),
        _ => StoreError::Database(err),
    }
}
