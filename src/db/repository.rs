//! Repository interfaces for every persisted entity.
//!
//! Operations that must be atomic across rows (token rotation, capacity-guarded
//! assignment, failure counting) are single repository calls so that each
//! backend can implement them under its own lock or transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::db::entities::{
    health_check, node, node_auth_failure, node_group, node_traffic, user_node_assignment,
};
use crate::db::enums::{NodeStatus, SyncStatus};
use crate::db::models::{
    AuthFailurePolicy, ConfigScope, MigrationKind, NewHealthCheck, NewNode, NewNodeGroup,
    NodeFilter, NodeGroupUpdate, NodeUpdate, TrafficSample,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Node {0} is at capacity")]
    AtCapacity(i32),
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait NodeRepository: Send + Sync {
    async fn create_node(&self, new: NewNode, token: String) -> StoreResult<node::Model>;
    async fn get_node(&self, node_id: i32) -> StoreResult<Option<node::Model>>;
    async fn find_node_by_token(&self, token: &str) -> StoreResult<Option<node::Model>>;
    async fn token_exists(&self, token: &str) -> StoreResult<bool>;
    /// Nodes matching `filter`, ordered by id.
    async fn list_nodes(&self, filter: &NodeFilter) -> StoreResult<Vec<node::Model>>;
    /// Fails with `Conflict`, writing nothing, when a nonzero `max_users`
    /// would be below the node's `current_users`.
    async fn update_node(&self, node_id: i32, update: NodeUpdate) -> StoreResult<node::Model>;
    /// Removes the node, its group memberships and its stored config override.
    /// Fails with `Conflict` while any user is still assigned to it.
    async fn delete_node(&self, node_id: i32) -> StoreResult<()>;
    /// Replaces the token in a single write and clears the revoked flag.
    async fn replace_node_token(&self, node_id: i32, token: String) -> StoreResult<()>;
    async fn revoke_node_token(&self, node_id: i32) -> StoreResult<()>;
    async fn set_node_status(&self, node_id: i32, status: NodeStatus) -> StoreResult<()>;
    /// Field-level write of probe results; `seen_at = None` keeps `last_seen_at`.
    async fn record_node_probe(
        &self,
        node_id: i32,
        latency_ms: Option<i32>,
        seen_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;
    async fn touch_node(&self, node_id: i32, seen_at: DateTime<Utc>) -> StoreResult<()>;
    async fn set_sync_status(
        &self,
        node_id: i32,
        status: SyncStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;
}

#[async_trait]
pub trait GroupRepository: Send + Sync {
    async fn create_group(&self, new: NewNodeGroup) -> StoreResult<node_group::Model>;
    async fn get_group(&self, group_id: i32) -> StoreResult<Option<node_group::Model>>;
    async fn list_groups(&self) -> StoreResult<Vec<node_group::Model>>;
    async fn update_group(
        &self,
        group_id: i32,
        update: NodeGroupUpdate,
    ) -> StoreResult<node_group::Model>;
    /// Removes the group and its membership rows; nodes are untouched.
    async fn delete_group(&self, group_id: i32) -> StoreResult<()>;
    async fn add_group_member(&self, group_id: i32, node_id: i32) -> StoreResult<()>;
    async fn remove_group_member(&self, group_id: i32, node_id: i32) -> StoreResult<()>;
    async fn list_group_node_ids(&self, group_id: i32) -> StoreResult<Vec<i32>>;
    /// Groups the node belongs to, ordered by id.
    async fn groups_for_node(&self, node_id: i32) -> StoreResult<Vec<node_group::Model>>;
}

#[async_trait]
pub trait HealthCheckRepository: Send + Sync {
    async fn append_health_check(&self, check: NewHealthCheck)
        -> StoreResult<health_check::Model>;
    /// Newest first.
    async fn recent_health_checks(
        &self,
        node_id: i32,
        limit: u64,
    ) -> StoreResult<Vec<health_check::Model>>;
}

#[async_trait]
pub trait AssignmentRepository: Send + Sync {
    async fn get_assignment(&self, user_id: i32)
        -> StoreResult<Option<user_node_assignment::Model>>;
    /// Ordered by user id.
    async fn list_node_assignments(
        &self,
        node_id: i32,
    ) -> StoreResult<Vec<user_node_assignment::Model>>;
    /// Assignments whose remembered original node is `node_id`.
    async fn list_displaced_assignments(
        &self,
        node_id: i32,
    ) -> StoreResult<Vec<user_node_assignment::Model>>;
    /// Points the user at `node_id`, moving them off any previous node. The
    /// capacity check, both `current_users` adjustments and the row upsert
    /// happen together or not at all.
    async fn assign_user(
        &self,
        user_id: i32,
        node_id: i32,
    ) -> StoreResult<user_node_assignment::Model>;
    /// Like `assign_user` but only succeeds while the user is still on `from`.
    async fn migrate_user(
        &self,
        user_id: i32,
        from: i32,
        to: i32,
        kind: MigrationKind,
    ) -> StoreResult<user_node_assignment::Model>;
    async fn unassign_user(&self, user_id: i32)
        -> StoreResult<Option<user_node_assignment::Model>>;
}

#[async_trait]
pub trait TrafficRepository: Send + Sync {
    async fn append_traffic(
        &self,
        node_id: i32,
        samples: &[TrafficSample],
        recorded_at: DateTime<Utc>,
    ) -> StoreResult<usize>;
    /// Newest first.
    async fn list_traffic(
        &self,
        node_id: i32,
        user_id: Option<i32>,
        limit: u64,
    ) -> StoreResult<Vec<node_traffic::Model>>;
}

#[async_trait]
pub trait AuthFailureRepository: Send + Sync {
    async fn get_auth_failure(&self, ip: &str) -> StoreResult<Option<node_auth_failure::Model>>;
    /// Counts one failed attempt inside a fixed window and sets `blocked_until`
    /// once `policy.max_failures` is reached.
    async fn record_auth_failure(
        &self,
        ip: &str,
        now: DateTime<Utc>,
        policy: &AuthFailurePolicy,
    ) -> StoreResult<node_auth_failure::Model>;
}

/// Config sources, kept as JSON so the storage layer stays format-agnostic.
#[async_trait]
pub trait ProxyConfigRepository: Send + Sync {
    async fn get_proxy_config(&self, scope: ConfigScope) -> StoreResult<Option<serde_json::Value>>;
    /// Inserts or replaces the config stored for `scope`.
    async fn put_proxy_config(&self, scope: ConfigScope, config: serde_json::Value)
        -> StoreResult<()>;
    /// Stores the fleet-wide config and drops every node override in one write.
    async fn replace_global_proxy_config(&self, config: serde_json::Value) -> StoreResult<()>;
}

/// Everything the control plane persists.
pub trait Store:
    NodeRepository
    + GroupRepository
    + HealthCheckRepository
    + AssignmentRepository
    + TrafficRepository
    + AuthFailureRepository
    + ProxyConfigRepository
{
}

impl<T> Store for T where
    T: NodeRepository
        + GroupRepository
        + HealthCheckRepository
        + AssignmentRepository
        + TrafficRepository
        + AuthFailureRepository
        + ProxyConfigRepository
{
}

/// Fixed-window failure accounting shared by every backend.
pub fn apply_auth_failure(
    record: &mut node_auth_failure::Model,
    now: DateTime<Utc>,
    policy: &AuthFailurePolicy,
) {
    let window_expired = now - record.window_started_at >= policy.window;
    if window_expired && !record.is_blocked_at(now) {
        record.attempts = 0;
        record.window_started_at = now;
        record.blocked_until = None;
    }
    record.attempts += 1;
    record.last_attempt_at = now;
    if record.attempts >= policy.max_failures {
        record.blocked_until = Some(now + policy.block);
    }
}

pub fn new_auth_failure(ip: &str, now: DateTime<Utc>) -> node_auth_failure::Model {
    node_auth_failure::Model {
        ip: ip.to_owned(),
        attempts: 0,
        window_started_at: now,
        last_attempt_at: now,
        blocked_until: None,
    }
}
