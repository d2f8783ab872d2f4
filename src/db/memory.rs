//! In-process store. Relational tables live behind one async mutex so that
//! cross-row operations are atomic; auth-failure counters sit in a `DashMap`
//! so concurrent authentications only contend per source IP.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::Mutex;

use crate::db::entities::{
    health_check, node, node_auth_failure, node_group, node_traffic, user_node_assignment,
};
use crate::db::enums::{NodeStatus, SyncStatus};
use crate::db::models::{
    AuthFailurePolicy, ConfigScope, MigrationKind, NewHealthCheck, NewNode, NewNodeGroup,
    NodeFilter, NodeGroupUpdate, NodeUpdate, TrafficSample,
};
use crate::db::repository::{
    apply_auth_failure, new_auth_failure, AssignmentRepository, AuthFailureRepository,
    GroupRepository, HealthCheckRepository, NodeRepository, ProxyConfigRepository, StoreError,
    StoreResult, TrafficRepository,
};

#[derive(Default)]
struct Tables {
    nodes: BTreeMap<i32, node::Model>,
    groups: BTreeMap<i32, node_group::Model>,
    // (group_id, node_id)
    members: BTreeSet<(i32, i32)>,
    health_checks: Vec<health_check::Model>,
    // keyed by user_id
    assignments: BTreeMap<i32, user_node_assignment::Model>,
    traffic: Vec<node_traffic::Model>,
    proxy_configs: HashMap<ConfigScope, serde_json::Value>,
    next_node_id: i32,
    next_group_id: i32,
    next_check_id: i32,
    next_assignment_id: i32,
    next_traffic_id: i32,
}

fn next_id(counter: &mut i32) -> i32 {
    *counter += 1;
    *counter
}

impl Tables {
    fn node_mut(&mut self, node_id: i32) -> StoreResult<&mut node::Model> {
        self.nodes
            .get_mut(&node_id)
            .ok_or_else(|| StoreError::NotFound(format!("Node {node_id}")))
    }

    fn matches(&self, node: &node::Model, filter: &NodeFilter) -> bool {
        if filter.status.is_some_and(|s| s != node.status) {
            return false;
        }
        if let Some(region) = &filter.region {
            if node.region.as_deref() != Some(region.as_str()) {
                return false;
            }
        }
        if let Some(tag) = &filter.tag {
            if !node.tag_list().iter().any(|t| t == tag) {
                return false;
            }
        }
        if let Some(group_id) = filter.group_id {
            if !self.members.contains(&(group_id, node.id)) {
                return false;
            }
        }
        true
    }

    /// Moves `user_id` onto `to`, releasing the slot on its previous node.
    fn move_user(
        &mut self,
        user_id: i32,
        to: i32,
        original_node_id: Option<i32>,
    ) -> StoreResult<user_node_assignment::Model> {
        let now = Utc::now();
        let previous = self.assignments.get(&user_id).map(|a| a.node_id);
        if previous == Some(to) {
            let existing = self
                .assignments
                .get_mut(&user_id)
                .ok_or_else(|| StoreError::NotFound(format!("Assignment for user {user_id}")))?;
            existing.original_node_id = original_node_id;
            existing.updated_at = now;
            return Ok(existing.clone());
        }

        let target = self.node_mut(to)?;
        if target.is_full() {
            return Err(StoreError::AtCapacity(to));
        }
        target.current_users += 1;
        target.updated_at = now;

        if let Some(prev) = previous {
            if let Some(prev_node) = self.nodes.get_mut(&prev) {
                prev_node.current_users = (prev_node.current_users - 1).max(0);
                prev_node.updated_at = now;
            }
        }

        let id = match self.assignments.get(&user_id) {
            Some(existing) => existing.id,
            None => next_id(&mut self.next_assignment_id),
        };
        let assigned_at = self
            .assignments
            .get(&user_id)
            .map(|a| a.assigned_at)
            .unwrap_or(now);
        let row = user_node_assignment::Model {
            id,
            user_id,
            node_id: to,
            original_node_id,
            assigned_at,
            updated_at: now,
        };
        self.assignments.insert(user_id, row.clone());
        Ok(row)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    auth_failures: DashMap<String, node_auth_failure::Model>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeRepository for MemoryStore {
    async fn create_node(&self, new: NewNode, token: String) -> StoreResult<node::Model> {
        let mut tables = self.tables.lock().await;
        if tables.nodes.values().any(|n| n.token == token) {
            return Err(StoreError::Conflict("node token already in use".to_string()));
        }
        let now = Utc::now();
        let id = next_id(&mut tables.next_node_id);
        let model = node::Model {
            id,
            name: new.name,
            address: new.address,
            agent_port: new.agent_port,
            token,
            token_revoked: false,
            status: NodeStatus::Offline,
            tags: Some(json!(new.tags)),
            region: new.region,
            latitude: new.latitude,
            longitude: new.longitude,
            weight: new.weight,
            max_users: new.max_users,
            current_users: 0,
            latency_ms: None,
            last_seen_at: None,
            sync_status: SyncStatus::Pending,
            synced_at: None,
            last_sync_error: None,
            created_at: now,
            updated_at: now,
        };
        tables.nodes.insert(id, model.clone());
        Ok(model)
    }

    async fn get_node(&self, node_id: i32) -> StoreResult<Option<node::Model>> {
        Ok(self.tables.lock().await.nodes.get(&node_id).cloned())
    }

    async fn find_node_by_token(&self, token: &str) -> StoreResult<Option<node::Model>> {
        let tables = self.tables.lock().await;
        Ok(tables.nodes.values().find(|n| n.token == token).cloned())
    }

    async fn token_exists(&self, token: &str) -> StoreResult<bool> {
        let tables = self.tables.lock().await;
        Ok(tables.nodes.values().any(|n| n.token == token))
    }

    async fn list_nodes(&self, filter: &NodeFilter) -> StoreResult<Vec<node::Model>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .nodes
            .values()
            .filter(|n| tables.matches(n, filter))
            .cloned()
            .collect())
    }

    async fn update_node(&self, node_id: i32, update: NodeUpdate) -> StoreResult<node::Model> {
        let mut tables = self.tables.lock().await;
        let node = tables.node_mut(node_id)?;
        if let Some(max_users) = update.max_users {
            if max_users > 0 && node.current_users > max_users {
                return Err(StoreError::Conflict(format!(
                    "node {node_id} has {} users, more than max_users {max_users}",
                    node.current_users
                )));
            }
        }
        if let Some(v) = update.name {
            node.name = v;
        }
        if let Some(v) = update.address {
            node.address = v;
        }
        if let Some(v) = update.agent_port {
            node.agent_port = v;
        }
        if let Some(v) = update.tags {
            node.tags = Some(json!(v));
        }
        if let Some(v) = update.region {
            node.region = v;
        }
        if let Some(v) = update.latitude {
            node.latitude = v;
        }
        if let Some(v) = update.longitude {
            node.longitude = v;
        }
        if let Some(v) = update.weight {
            node.weight = v;
        }
        if let Some(v) = update.max_users {
            node.max_users = v;
        }
        node.updated_at = Utc::now();
        Ok(node.clone())
    }

    async fn delete_node(&self, node_id: i32) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        if !tables.nodes.contains_key(&node_id) {
            return Err(StoreError::NotFound(format!("Node {node_id}")));
        }
        if tables.assignments.values().any(|a| a.node_id == node_id) {
            return Err(StoreError::Conflict(format!(
                "node {node_id} still has assigned users"
            )));
        }
        tables.nodes.remove(&node_id);
        tables.members.retain(|(_, n)| *n != node_id);
        tables.proxy_configs.remove(&ConfigScope::Node(node_id));
        Ok(())
    }

    async fn replace_node_token(&self, node_id: i32, token: String) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        if tables
            .nodes
            .values()
            .any(|n| n.id != node_id && n.token == token)
        {
            return Err(StoreError::Conflict("node token already in use".to_string()));
        }
        let node = tables.node_mut(node_id)?;
        node.token = token;
        node.token_revoked = false;
        node.updated_at = Utc::now();
        Ok(())
    }

    async fn revoke_node_token(&self, node_id: i32) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        let node = tables.node_mut(node_id)?;
        node.token_revoked = true;
        node.updated_at = Utc::now();
        Ok(())
    }

    async fn set_node_status(&self, node_id: i32, status: NodeStatus) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        let node = tables.node_mut(node_id)?;
        node.status = status;
        node.updated_at = Utc::now();
        Ok(())
    }

    async fn record_node_probe(
        &self,
        node_id: i32,
        latency_ms: Option<i32>,
        seen_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        let node = tables.node_mut(node_id)?;
        node.latency_ms = latency_ms;
        if seen_at.is_some() {
            node.last_seen_at = seen_at;
        }
        Ok(())
    }

    async fn touch_node(&self, node_id: i32, seen_at: DateTime<Utc>) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        tables.node_mut(node_id)?.last_seen_at = Some(seen_at);
        Ok(())
    }

    async fn set_sync_status(
        &self,
        node_id: i32,
        status: SyncStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        let node = tables.node_mut(node_id)?;
        node.sync_status = status;
        node.last_sync_error = error;
        if status == SyncStatus::Synced {
            node.synced_at = Some(at);
        }
        Ok(())
    }
}

#[async_trait]
impl GroupRepository for MemoryStore {
    async fn create_group(&self, new: NewNodeGroup) -> StoreResult<node_group::Model> {
        let mut tables = self.tables.lock().await;
        if tables.groups.values().any(|g| g.name == new.name) {
            return Err(StoreError::Conflict(format!(
                "group name '{}' already exists",
                new.name
            )));
        }
        let now = Utc::now();
        let id = next_id(&mut tables.next_group_id);
        let model = node_group::Model {
            id,
            name: new.name,
            region: new.region,
            strategy: new.strategy,
            created_at: now,
            updated_at: now,
        };
        tables.groups.insert(id, model.clone());
        Ok(model)
    }

    async fn get_group(&self, group_id: i32) -> StoreResult<Option<node_group::Model>> {
        Ok(self.tables.lock().await.groups.get(&group_id).cloned())
    }

    async fn list_groups(&self) -> StoreResult<Vec<node_group::Model>> {
        Ok(self.tables.lock().await.groups.values().cloned().collect())
    }

    async fn update_group(
        &self,
        group_id: i32,
        update: NodeGroupUpdate,
    ) -> StoreResult<node_group::Model> {
        let mut tables = self.tables.lock().await;
        if let Some(name) = &update.name {
            if tables
                .groups
                .values()
                .any(|g| g.id != group_id && &g.name == name)
            {
                return Err(StoreError::Conflict(format!(
                    "group name '{name}' already exists"
                )));
            }
        }
        let group = tables
            .groups
            .get_mut(&group_id)
            .ok_or_else(|| StoreError::NotFound(format!("Group {group_id}")))?;
        if let Some(v) = update.name {
            group.name = v;
        }
        if let Some(v) = update.region {
            group.region = Some(v);
        }
        if let Some(v) = update.strategy {
            group.strategy = v;
        }
        group.updated_at = Utc::now();
        Ok(group.clone())
    }

    async fn delete_group(&self, group_id: i32) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        if tables.groups.remove(&group_id).is_none() {
            return Err(StoreError::NotFound(format!("Group {group_id}")));
        }
        tables.members.retain(|(g, _)| *g != group_id);
        Ok(())
    }

    async fn add_group_member(&self, group_id: i32, node_id: i32) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        if !tables.groups.contains_key(&group_id) {
            return Err(StoreError::NotFound(format!("Group {group_id}")));
        }
        if !tables.nodes.contains_key(&node_id) {
            return Err(StoreError::NotFound(format!("Node {node_id}")));
        }
        if !tables.members.insert((group_id, node_id)) {
            return Err(StoreError::Conflict(format!(
                "node {node_id} is already a member of group {group_id}"
            )));
        }
        Ok(())
    }

    async fn remove_group_member(&self, group_id: i32, node_id: i32) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        if !tables.members.remove(&(group_id, node_id)) {
            return Err(StoreError::NotFound(format!(
                "Membership of node {node_id} in group {group_id}"
            )));
        }
        Ok(())
    }

    async fn list_group_node_ids(&self, group_id: i32) -> StoreResult<Vec<i32>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .members
            .iter()
            .filter(|(g, _)| *g == group_id)
            .map(|(_, n)| *n)
            .collect())
    }

    async fn groups_for_node(&self, node_id: i32) -> StoreResult<Vec<node_group::Model>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .members
            .iter()
            .filter(|(_, n)| *n == node_id)
            .filter_map(|(g, _)| tables.groups.get(g).cloned())
            .collect())
    }
}

#[async_trait]
impl HealthCheckRepository for MemoryStore {
    async fn append_health_check(
        &self,
        check: NewHealthCheck,
    ) -> StoreResult<health_check::Model> {
        let mut tables = self.tables.lock().await;
        let id = next_id(&mut tables.next_check_id);
        let row = health_check::Model {
            id,
            node_id: check.node_id,
            status: check.status,
            latency_ms: check.latency_ms,
            tcp_ok: check.tcp_ok,
            api_ok: check.api_ok,
            process_ok: check.process_ok,
            message: check.message,
            checked_at: check.checked_at,
        };
        tables.health_checks.push(row.clone());
        Ok(row)
    }

    async fn recent_health_checks(
        &self,
        node_id: i32,
        limit: u64,
    ) -> StoreResult<Vec<health_check::Model>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .health_checks
            .iter()
            .rev()
            .filter(|c| c.node_id == node_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AssignmentRepository for MemoryStore {
    async fn get_assignment(
        &self,
        user_id: i32,
    ) -> StoreResult<Option<user_node_assignment::Model>> {
        Ok(self.tables.lock().await.assignments.get(&user_id).cloned())
    }

    async fn list_node_assignments(
        &self,
        node_id: i32,
    ) -> StoreResult<Vec<user_node_assignment::Model>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .assignments
            .values()
            .filter(|a| a.node_id == node_id)
            .cloned()
            .collect())
    }

    async fn list_displaced_assignments(
        &self,
        node_id: i32,
    ) -> StoreResult<Vec<user_node_assignment::Model>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .assignments
            .values()
            .filter(|a| a.original_node_id == Some(node_id))
            .cloned()
            .collect())
    }

    async fn assign_user(
        &self,
        user_id: i32,
        node_id: i32,
    ) -> StoreResult<user_node_assignment::Model> {
        let mut tables = self.tables.lock().await;
        tables.move_user(user_id, node_id, None)
    }

    async fn migrate_user(
        &self,
        user_id: i32,
        from: i32,
        to: i32,
        kind: MigrationKind,
    ) -> StoreResult<user_node_assignment::Model> {
        let mut tables = self.tables.lock().await;
        let current = tables
            .assignments
            .get(&user_id)
            .ok_or_else(|| StoreError::NotFound(format!("Assignment for user {user_id}")))?;
        if current.node_id != from {
            return Err(StoreError::Conflict(format!(
                "user {user_id} is no longer assigned to node {from}"
            )));
        }
        let original = match kind {
            MigrationKind::Failover => current.original_node_id.or(Some(from)),
            MigrationKind::Recovery | MigrationKind::Administrative => None,
        };
        tables.move_user(user_id, to, original)
    }

    async fn unassign_user(
        &self,
        user_id: i32,
    ) -> StoreResult<Option<user_node_assignment::Model>> {
        let mut tables = self.tables.lock().await;
        let removed = tables.assignments.remove(&user_id);
        if let Some(row) = &removed {
            if let Some(node) = tables.nodes.get_mut(&row.node_id) {
                node.current_users = (node.current_users - 1).max(0);
                node.updated_at = Utc::now();
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl TrafficRepository for MemoryStore {
    async fn append_traffic(
        &self,
        node_id: i32,
        samples: &[TrafficSample],
        recorded_at: DateTime<Utc>,
    ) -> StoreResult<usize> {
        let mut tables = self.tables.lock().await;
        if !tables.nodes.contains_key(&node_id) {
            return Err(StoreError::NotFound(format!("Node {node_id}")));
        }
        for sample in samples {
            let id = next_id(&mut tables.next_traffic_id);
            tables.traffic.push(node_traffic::Model {
                id,
                node_id,
                user_id: sample.user_id,
                upload_bytes: sample.upload_bytes,
                download_bytes: sample.download_bytes,
                recorded_at,
            });
        }
        Ok(samples.len())
    }

    async fn list_traffic(
        &self,
        node_id: i32,
        user_id: Option<i32>,
        limit: u64,
    ) -> StoreResult<Vec<node_traffic::Model>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .traffic
            .iter()
            .rev()
            .filter(|t| t.node_id == node_id && user_id.map_or(true, |u| u == t.user_id))
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AuthFailureRepository for MemoryStore {
    async fn get_auth_failure(&self, ip: &str) -> StoreResult<Option<node_auth_failure::Model>> {
        Ok(self.auth_failures.get(ip).map(|r| r.value().clone()))
    }

    async fn record_auth_failure(
        &self,
        ip: &str,
        now: DateTime<Utc>,
        policy: &AuthFailurePolicy,
    ) -> StoreResult<node_auth_failure::Model> {
        // The entry guard holds the shard lock for this IP until dropped.
        let mut entry = self
            .auth_failures
            .entry(ip.to_owned())
            .or_insert_with(|| new_auth_failure(ip, now));
        apply_auth_failure(entry.value_mut(), now, policy);
        Ok(entry.value().clone())
    }
}

#[async_trait]
impl ProxyConfigRepository for MemoryStore {
    async fn get_proxy_config(&self, scope: ConfigScope) -> StoreResult<Option<serde_json::Value>> {
        Ok(self.tables.lock().await.proxy_configs.get(&scope).cloned())
    }

    async fn put_proxy_config(
        &self,
        scope: ConfigScope,
        config: serde_json::Value,
    ) -> StoreResult<()> {
        self.tables.lock().await.proxy_configs.insert(scope, config);
        Ok(())
    }

    async fn replace_global_proxy_config(&self, config: serde_json::Value) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        tables.proxy_configs.clear();
        tables.proxy_configs.insert(ConfigScope::Global, config);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn new_node(name: &str, max_users: i32) -> NewNode {
        NewNode {
            name: name.to_string(),
            address: "10.0.0.1".to_string(),
            agent_port: 8443,
            tags: vec!["edge".to_string()],
            region: Some("eu".to_string()),
            latitude: None,
            longitude: None,
            weight: 1,
            max_users,
        }
    }

    #[tokio::test]
    async fn test_assign_respects_capacity_and_moves_counts() {
        let store = MemoryStore::new();
        let a = store.create_node(new_node("a", 1), "tok-a".into()).await.unwrap();
        let b = store.create_node(new_node("b", 0), "tok-b".into()).await.unwrap();

        store.assign_user(1, a.id).await.unwrap();
        let err = store.assign_user(2, a.id).await.unwrap_err();
        assert!(matches!(err, StoreError::AtCapacity(id) if id == a.id));

        store.assign_user(1, b.id).await.unwrap();
        let a = store.get_node(a.id).await.unwrap().unwrap();
        let b = store.get_node(b.id).await.unwrap().unwrap();
        assert_eq!(a.current_users, 0);
        assert_eq!(b.current_users, 1);
    }

    #[tokio::test]
    async fn test_reassigning_to_same_node_does_not_double_count() {
        let store = MemoryStore::new();
        let a = store.create_node(new_node("a", 1), "tok-a".into()).await.unwrap();
        store.assign_user(7, a.id).await.unwrap();
        store.assign_user(7, a.id).await.unwrap();
        let a = store.get_node(a.id).await.unwrap().unwrap();
        assert_eq!(a.current_users, 1);
    }

    #[tokio::test]
    async fn test_migrate_user_requires_current_node() {
        let store = MemoryStore::new();
        let a = store.create_node(new_node("a", 0), "tok-a".into()).await.unwrap();
        let b = store.create_node(new_node("b", 0), "tok-b".into()).await.unwrap();
        let c = store.create_node(new_node("c", 0), "tok-c".into()).await.unwrap();
        store.assign_user(1, a.id).await.unwrap();

        let err = store
            .migrate_user(1, b.id, c.id, MigrationKind::Failover)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let row = store
            .migrate_user(1, a.id, b.id, MigrationKind::Failover)
            .await
            .unwrap();
        assert_eq!(row.original_node_id, Some(a.id));
        // A second failover keeps the first origin.
        let row = store
            .migrate_user(1, b.id, c.id, MigrationKind::Failover)
            .await
            .unwrap();
        assert_eq!(row.original_node_id, Some(a.id));
        let displaced = store.list_displaced_assignments(a.id).await.unwrap();
        assert_eq!(displaced.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_node_refuses_while_users_assigned() {
        let store = MemoryStore::new();
        let a = store.create_node(new_node("a", 0), "tok-a".into()).await.unwrap();
        let g = store
            .create_group(NewNodeGroup {
                name: "eu".into(),
                region: None,
                strategy: Default::default(),
            })
            .await
            .unwrap();
        store.add_group_member(g.id, a.id).await.unwrap();
        store.assign_user(1, a.id).await.unwrap();

        assert!(matches!(
            store.delete_node(a.id).await,
            Err(StoreError::Conflict(_))
        ));
        store.unassign_user(1).await.unwrap();
        store.delete_node(a.id).await.unwrap();
        assert!(store.list_group_node_ids(g.id).await.unwrap().is_empty());
        assert!(store.get_group(g.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_membership_is_conflict() {
        let store = MemoryStore::new();
        let a = store.create_node(new_node("a", 0), "tok-a".into()).await.unwrap();
        let g = store
            .create_group(NewNodeGroup {
                name: "eu".into(),
                region: None,
                strategy: Default::default(),
            })
            .await
            .unwrap();
        store.add_group_member(g.id, a.id).await.unwrap();
        assert!(matches!(
            store.add_group_member(g.id, a.id).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_auth_failure_fixed_window() {
        let store = MemoryStore::new();
        let policy = AuthFailurePolicy {
            max_failures: 3,
            window: Duration::seconds(60),
            block: Duration::seconds(300),
        };
        let t0 = Utc::now();
        for i in 0..2 {
            let rec = store
                .record_auth_failure("1.2.3.4", t0 + Duration::seconds(i), &policy)
                .await
                .unwrap();
            assert!(rec.blocked_until.is_none());
        }
        let rec = store
            .record_auth_failure("1.2.3.4", t0 + Duration::seconds(2), &policy)
            .await
            .unwrap();
        assert_eq!(rec.attempts, 3);
        assert!(rec.is_blocked_at(t0 + Duration::seconds(3)));
        assert!(!rec.is_blocked_at(t0 + Duration::seconds(303)));

        // Once both the block and the window have lapsed, counting restarts.
        let rec = store
            .record_auth_failure("1.2.3.4", t0 + Duration::seconds(400), &policy)
            .await
            .unwrap();
        assert_eq!(rec.attempts, 1);
        assert!(rec.blocked_until.is_none());
    }
}
