//! `Store` backed by a SeaORM connection (Postgres in production, SQLite in tests).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter, ColumnTrait};

use crate::db::entities::{
    health_check, node, node_auth_failure, node_group, node_traffic, user_node_assignment,
};
use crate::db::enums::{NodeStatus, SyncStatus};
use crate::db::models::{
    AuthFailurePolicy, ConfigScope, MigrationKind, NewHealthCheck, NewNode, NewNodeGroup,
    NodeFilter, NodeGroupUpdate, NodeUpdate, TrafficSample,
};
use crate::db::repository::{
    AssignmentRepository, AuthFailureRepository, GroupRepository, HealthCheckRepository,
    NodeRepository, ProxyConfigRepository, StoreError, StoreResult, TrafficRepository,
};
use crate::db::services::{
    assignment_service, auth_failure_service, group_service, health_check_service, node_service,
    proxy_config_service, traffic_service,
};

#[derive(Clone)]
pub struct SeaOrmStore {
    db: DatabaseConnection,
}

impl SeaOrmStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

#[async_trait]
impl NodeRepository for SeaOrmStore {
    async fn create_node(&self, new: NewNode, token: String) -> StoreResult<node::Model> {
        node_service::create_node(&self.db, new, token).await
    }

    async fn get_node(&self, node_id: i32) -> StoreResult<Option<node::Model>> {
        Ok(node_service::get_node_by_id(&self.db, node_id).await?)
    }

    async fn find_node_by_token(&self, token: &str) -> StoreResult<Option<node::Model>> {
        Ok(node_service::get_node_by_token(&self.db, token).await?)
    }

    async fn token_exists(&self, token: &str) -> StoreResult<bool> {
        let count = node::Entity::find()
            .filter(node::Column::Token.eq(token))
            .count(&self.db)
            .await?;
        Ok(count > 0)
    }

    async fn list_nodes(&self, filter: &NodeFilter) -> StoreResult<Vec<node::Model>> {
        Ok(node_service::list_nodes(&self.db, filter).await?)
    }

    async fn update_node(&self, node_id: i32, update: NodeUpdate) -> StoreResult<node::Model> {
        node_service::update_node(&self.db, node_id, update).await
    }

    async fn delete_node(&self, node_id: i32) -> StoreResult<()> {
        node_service::delete_node(&self.db, node_id).await
    }

    async fn replace_node_token(&self, node_id: i32, token: String) -> StoreResult<()> {
        node_service::replace_node_token(&self.db, node_id, token).await
    }

    async fn revoke_node_token(&self, node_id: i32) -> StoreResult<()> {
        node_service::revoke_node_token(&self.db, node_id).await
    }

    async fn set_node_status(&self, node_id: i32, status: NodeStatus) -> StoreResult<()> {
        node_service::update_node_status(&self.db, node_id, status).await
    }

    async fn record_node_probe(
        &self,
        node_id: i32,
        latency_ms: Option<i32>,
        seen_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        node_service::record_node_probe(&self.db, node_id, latency_ms, seen_at).await
    }

    async fn touch_node(&self, node_id: i32, seen_at: DateTime<Utc>) -> StoreResult<()> {
        node_service::touch_node(&self.db, node_id, seen_at).await
    }

    async fn set_sync_status(
        &self,
        node_id: i32,
        status: SyncStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        node_service::update_sync_status(&self.db, node_id, status, error, at).await
    }
}

#[async_trait]
impl GroupRepository for SeaOrmStore {
    async fn create_group(&self, new: NewNodeGroup) -> StoreResult<node_group::Model> {
        group_service::create_node_group(&self.db, new).await
    }

    async fn get_group(&self, group_id: i32) -> StoreResult<Option<node_group::Model>> {
        Ok(group_service::get_node_group_by_id(&self.db, group_id).await?)
    }

    async fn list_groups(&self) -> StoreResult<Vec<node_group::Model>> {
        Ok(group_service::get_all_node_groups(&self.db).await?)
    }

    async fn update_group(
        &self,
        group_id: i32,
        update: NodeGroupUpdate,
    ) -> StoreResult<node_group::Model> {
        group_service::update_node_group(&self.db, group_id, update).await
    }

    async fn delete_group(&self, group_id: i32) -> StoreResult<()> {
        group_service::delete_node_group(&self.db, group_id).await
    }

    async fn add_group_member(&self, group_id: i32, node_id: i32) -> StoreResult<()> {
        group_service::add_member(&self.db, group_id, node_id).await
    }

    async fn remove_group_member(&self, group_id: i32, node_id: i32) -> StoreResult<()> {
        group_service::remove_member(&self.db, group_id, node_id).await
    }

    async fn list_group_node_ids(&self, group_id: i32) -> StoreResult<Vec<i32>> {
        Ok(group_service::list_group_node_ids(&self.db, group_id).await?)
    }

    async fn groups_for_node(&self, node_id: i32) -> StoreResult<Vec<node_group::Model>> {
        Ok(group_service::get_groups_for_node(&self.db, node_id).await?)
    }
}

#[async_trait]
impl HealthCheckRepository for SeaOrmStore {
    async fn append_health_check(
        &self,
        check: NewHealthCheck,
    ) -> StoreResult<health_check::Model> {
        Ok(health_check_service::insert_health_check(&self.db, check).await?)
    }

    async fn recent_health_checks(
        &self,
        node_id: i32,
        limit: u64,
    ) -> StoreResult<Vec<health_check::Model>> {
        Ok(health_check_service::get_recent_health_checks(&self.db, node_id, limit).await?)
    }
}

#[async_trait]
impl AssignmentRepository for SeaOrmStore {
    async fn get_assignment(
        &self,
        user_id: i32,
    ) -> StoreResult<Option<user_node_assignment::Model>> {
        Ok(assignment_service::get_assignment(&self.db, user_id).await?)
    }

    async fn list_node_assignments(
        &self,
        node_id: i32,
    ) -> StoreResult<Vec<user_node_assignment::Model>> {
        Ok(assignment_service::get_assignments_for_node(&self.db, node_id).await?)
    }

    async fn list_displaced_assignments(
        &self,
        node_id: i32,
    ) -> StoreResult<Vec<user_node_assignment::Model>> {
        Ok(assignment_service::get_displaced_assignments(&self.db, node_id).await?)
    }

    async fn assign_user(
        &self,
        user_id: i32,
        node_id: i32,
    ) -> StoreResult<user_node_assignment::Model> {
        assignment_service::assign_user(&self.db, user_id, node_id).await
    }

    async fn migrate_user(
        &self,
        user_id: i32,
        from: i32,
        to: i32,
        kind: MigrationKind,
    ) -> StoreResult<user_node_assignment::Model> {
        assignment_service::migrate_user(&self.db, user_id, from, to, kind).await
    }

    async fn unassign_user(
        &self,
        user_id: i32,
    ) -> StoreResult<Option<user_node_assignment::Model>> {
        assignment_service::unassign_user(&self.db, user_id).await
    }
}

#[async_trait]
impl TrafficRepository for SeaOrmStore {
    async fn append_traffic(
        &self,
        node_id: i32,
        samples: &[TrafficSample],
        recorded_at: DateTime<Utc>,
    ) -> StoreResult<usize> {
        if node_service::get_node_by_id(&self.db, node_id).await?.is_none() {
            return Err(StoreError::NotFound(format!("Node {node_id}")));
        }
        Ok(traffic_service::insert_traffic_samples(&self.db, node_id, samples, recorded_at).await?)
    }

    async fn list_traffic(
        &self,
        node_id: i32,
        user_id: Option<i32>,
        limit: u64,
    ) -> StoreResult<Vec<node_traffic::Model>> {
        Ok(traffic_service::get_node_traffic(&self.db, node_id, user_id, limit).await?)
    }
}

#[async_trait]
impl AuthFailureRepository for SeaOrmStore {
    async fn get_auth_failure(&self, ip: &str) -> StoreResult<Option<node_auth_failure::Model>> {
        Ok(auth_failure_service::get_auth_failure(&self.db, ip).await?)
    }

    async fn record_auth_failure(
        &self,
        ip: &str,
        now: DateTime<Utc>,
        policy: &AuthFailurePolicy,
    ) -> StoreResult<node_auth_failure::Model> {
        auth_failure_service::record_auth_failure(&self.db, ip, now, *policy).await
    }
}

#[async_trait]
impl ProxyConfigRepository for SeaOrmStore {
    async fn get_proxy_config(&self, scope: ConfigScope) -> StoreResult<Option<serde_json::Value>> {
        Ok(proxy_config_service::get_proxy_config(&self.db, scope)
            .await?
            .map(|row| row.config))
    }

    async fn put_proxy_config(
        &self,
        scope: ConfigScope,
        config: serde_json::Value,
    ) -> StoreResult<()> {
        Ok(proxy_config_service::upsert_proxy_config(&self.db, scope, config).await?)
    }

    async fn replace_global_proxy_config(&self, config: serde_json::Value) -> StoreResult<()> {
        proxy_config_service::replace_global_proxy_config(&self.db, config).await
    }
}
