//! Node and group bookkeeping with input validation, plus the node delete saga.

use std::net::IpAddr;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::db::entities::{node, node_group};
use crate::db::models::{MigrationKind, NewNode, NewNodeGroup, NodeFilter, NodeGroupUpdate, NodeUpdate};
use crate::db::{AssignmentRepository, GroupRepository, NodeRepository, Store, StoreError};
use crate::error::{ControlError, ControlResult};
use crate::notifications::{AdminAlert, AdminNotifier, AlertKind};
use crate::services::auth_guard::AuthGuard;
use crate::services::load_balancer::{LoadBalancer, UserMove};

const MAX_CREATE_ATTEMPTS: usize = 3;

/// Accepts an IPv4 or IPv6 literal, or an RFC 1123 host name.
pub fn validate_address(address: &str) -> ControlResult<()> {
    if address.parse::<IpAddr>().is_ok() || is_valid_hostname(address) {
        Ok(())
    } else {
        Err(ControlError::InvalidAddress(address.to_string()))
    }
}

fn is_valid_hostname(host: &str) -> bool {
    // A single trailing dot marks the name as fully qualified.
    let host = host.strip_suffix('.').unwrap_or(host);
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    let labels: Vec<&str> = host.split('.').collect();
    let labels_ok = labels.iter().all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    });
    // An all-numeric top label would make "300.1.1.1" a host name.
    let tld_ok = labels
        .last()
        .is_some_and(|tld| !tld.bytes().all(|b| b.is_ascii_digit()));
    labels_ok && tld_ok
}

fn validate_port(port: i32) -> ControlResult<()> {
    if (1..=65535).contains(&port) {
        Ok(())
    } else {
        Err(ControlError::InvalidConfig(format!("agent port {port} is outside 1-65535")))
    }
}

fn validate_capacity(weight: Option<i32>, max_users: Option<i32>) -> ControlResult<()> {
    if weight.is_some_and(|w| w < 1) {
        return Err(ControlError::InvalidConfig("weight must be at least 1".into()));
    }
    if max_users.is_some_and(|m| m < 0) {
        return Err(ControlError::InvalidConfig(
            "max_users must be zero (unlimited) or positive".into(),
        ));
    }
    Ok(())
}

fn validate_name(name: &str) -> ControlResult<()> {
    if name.trim().is_empty() {
        return Err(ControlError::InvalidConfig("name must not be empty".into()));
    }
    Ok(())
}

/// A freshly created node together with its token, which is only ever
/// handed out here.
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredNode {
    pub node: node::Model,
    pub token: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeleteReport {
    pub node_id: i32,
    pub migrated: Vec<UserMove>,
}

pub struct NodeRegistry {
    store: Arc<dyn Store>,
    auth: Arc<AuthGuard>,
    balancer: Arc<LoadBalancer>,
    notifier: Arc<dyn AdminNotifier>,
}

impl NodeRegistry {
    pub fn new(
        store: Arc<dyn Store>,
        auth: Arc<AuthGuard>,
        balancer: Arc<LoadBalancer>,
        notifier: Arc<dyn AdminNotifier>,
    ) -> Self {
        Self {
            store,
            auth,
            balancer,
            notifier,
        }
    }

    /// New nodes start `offline` until their first successful probe or heartbeat.
    pub async fn create_node(&self, new: NewNode) -> ControlResult<RegisteredNode> {
        validate_name(&new.name)?;
        validate_address(&new.address)?;
        validate_port(new.agent_port)?;
        validate_capacity(Some(new.weight), Some(new.max_users))?;

        for _ in 0..MAX_CREATE_ATTEMPTS {
            let token = self.auth.new_unique_token().await?;
            match self.store.create_node(new.clone(), token.clone()).await {
                Ok(node) => {
                    info!(node_id = node.id, name = %node.name, address = %node.address, "Node created.");
                    return Ok(RegisteredNode { node, token });
                }
                Err(StoreError::Conflict(msg)) => {
                    warn!(conflict = %msg, "Node token collided on insert; retrying.");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ControlError::Conflict(
            "could not generate a unique node token".to_string(),
        ))
    }

    pub async fn get_node(&self, node_id: i32) -> ControlResult<node::Model> {
        self.store
            .get_node(node_id)
            .await?
            .ok_or_else(|| ControlError::NotFound(format!("Node {node_id}")))
    }

    pub async fn list_nodes(&self, filter: &NodeFilter) -> ControlResult<Vec<node::Model>> {
        Ok(self.store.list_nodes(filter).await?)
    }

    pub async fn update_node(&self, node_id: i32, update: NodeUpdate) -> ControlResult<node::Model> {
        if let Some(name) = &update.name {
            validate_name(name)?;
        }
        if let Some(address) = &update.address {
            validate_address(address)?;
        }
        if let Some(port) = update.agent_port {
            validate_port(port)?;
        }
        validate_capacity(update.weight, update.max_users)?;
        let node = self.store.update_node(node_id, update).await?;
        info!(node_id, "Node updated.");
        Ok(node)
    }

    /// Writes the measured latency without touching any other column.
    pub async fn update_metrics(&self, node_id: i32, latency_ms: Option<i32>) -> ControlResult<()> {
        self.store.record_node_probe(node_id, latency_ms, None).await?;
        Ok(())
    }

    /// Moves every assigned user to another online node, then removes the
    /// node. If any user cannot be moved the node is kept and the remaining
    /// users are reported.
    pub async fn delete_node(&self, node_id: i32) -> ControlResult<DeleteReport> {
        self.get_node(node_id).await?;
        let assignments = self.store.list_node_assignments(node_id).await?;
        let groups = self.store.groups_for_node(node_id).await?;

        let mut report = DeleteReport {
            node_id,
            ..Default::default()
        };
        let mut unmigrated = Vec::new();
        for assignment in assignments {
            let user_id = assignment.user_id;
            match self
                .balancer
                .relocate_user(user_id, node_id, &groups, MigrationKind::Administrative)
                .await
            {
                Ok(target) => report.migrated.push(UserMove {
                    user_id,
                    from: node_id,
                    to: target.id,
                }),
                Err(e) => {
                    warn!(node_id, user_id, error = %e, "Could not move user off node being deleted.");
                    unmigrated.push(user_id);
                }
            }
        }

        if !unmigrated.is_empty() {
            error!(node_id, remaining = unmigrated.len(), "Node delete aborted; users remain assigned.");
            let alert = AdminAlert::new(
                AlertKind::NodeDeleteBlocked,
                node_id,
                format!("node {node_id} was not deleted: {} user(s) could not be moved", unmigrated.len()),
                unmigrated.clone(),
            );
            if let Err(e) = self.notifier.notify(&alert).await {
                error!(node_id, error = %e, "Failed to notify administrators.");
            }
            return Err(ControlError::NodeHasUsers { node_id, unmigrated });
        }

        self.store.delete_node(node_id).await?;
        info!(node_id, migrated = report.migrated.len(), "Node deleted.");
        Ok(report)
    }

    pub async fn create_group(&self, new: NewNodeGroup) -> ControlResult<node_group::Model> {
        validate_name(&new.name)?;
        let group = self.store.create_group(new).await?;
        info!(group_id = group.id, name = %group.name, "Node group created.");
        Ok(group)
    }

    pub async fn get_group(&self, group_id: i32) -> ControlResult<node_group::Model> {
        self.store
            .get_group(group_id)
            .await?
            .ok_or_else(|| ControlError::NotFound(format!("Group {group_id}")))
    }

    pub async fn list_groups(&self) -> ControlResult<Vec<node_group::Model>> {
        Ok(self.store.list_groups().await?)
    }

    pub async fn update_group(
        &self,
        group_id: i32,
        update: NodeGroupUpdate,
    ) -> ControlResult<node_group::Model> {
        if let Some(name) = &update.name {
            validate_name(name)?;
        }
        Ok(self.store.update_group(group_id, update).await?)
    }

    pub async fn delete_group(&self, group_id: i32) -> ControlResult<()> {
        self.store.delete_group(group_id).await?;
        info!(group_id, "Node group deleted.");
        Ok(())
    }

    pub async fn add_member(&self, group_id: i32, node_id: i32) -> ControlResult<()> {
        self.store.add_group_member(group_id, node_id).await?;
        info!(group_id, node_id, "Node added to group.");
        Ok(())
    }

    pub async fn remove_member(&self, group_id: i32, node_id: i32) -> ControlResult<()> {
        self.store.remove_group_member(group_id, node_id).await?;
        info!(group_id, node_id, "Node removed from group.");
        Ok(())
    }

    pub async fn group_members(&self, group_id: i32) -> ControlResult<Vec<node::Model>> {
        self.get_group(group_id).await?;
        let filter = NodeFilter {
            group_id: Some(group_id),
            ..Default::default()
        };
        Ok(self.store.list_nodes(&filter).await?)
    }

    pub async fn groups_for_node(&self, node_id: i32) -> ControlResult<Vec<node_group::Model>> {
        self.get_node(node_id).await?;
        Ok(self.store.groups_for_node(node_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::enums::NodeStatus;
    use crate::db::MemoryStore;
    use crate::notifications::LogNotifier;
    use crate::server::config::{AuthSettings, BalancerSettings};
    use crate::services::geo::StaticGeoLocator;
    use crate::services::test_support::{new_node, online_node};

    fn registry(store: &Arc<MemoryStore>) -> NodeRegistry {
        let auth = Arc::new(AuthGuard::new(store.clone(), &AuthSettings::default()).unwrap());
        let balancer = Arc::new(LoadBalancer::new(
            store.clone(),
            Arc::new(StaticGeoLocator::new()),
            BalancerSettings::default(),
        ));
        NodeRegistry::new(store.clone(), auth, balancer, Arc::new(LogNotifier))
    }

    #[test]
    fn test_validate_address() {
        let long_label = "a".repeat(64);
        for ok in [
            "10.0.0.1",
            "255.255.255.255",
            "::1",
            "2001:db8::8a2e:370:7334",
            "::ffff:192.0.2.1",
            "localhost",
            "node-1.example.com",
            "a.b-c.d1",
            "xn--bcher-kva.example",
            "node.example.com.",
        ] {
            assert!(validate_address(ok).is_ok(), "{ok} should be accepted");
        }
        for bad in [
            "",
            "256.1.1.1",
            "1.2.3",
            "10.0.0.1 ",
            "[::1]",
            "2001:db8:::1",
            "-node.example.com",
            "node-.example.com",
            "node..example.com",
            "node.example.com..",
            ".",
            "under_score.example.com",
            "http://example.com",
            long_label.as_str(),
        ] {
            assert!(
                matches!(validate_address(bad), Err(ControlError::InvalidAddress(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_create_node_validates_and_starts_offline() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store);

        let bad = NewNode {
            address: "not a host".into(),
            ..new_node("bad")
        };
        assert!(matches!(
            registry.create_node(bad).await,
            Err(ControlError::InvalidAddress(_))
        ));
        let bad_port = NewNode {
            agent_port: 0,
            ..new_node("bad-port")
        };
        assert!(matches!(
            registry.create_node(bad_port).await,
            Err(ControlError::InvalidConfig(_))
        ));
        assert!(store.list_nodes(&NodeFilter::default()).await.unwrap().is_empty());

        let created = registry.create_node(new_node("ok")).await.unwrap();
        assert_eq!(created.node.status, NodeStatus::Offline);
        assert_eq!(created.token.len(), 64);
        let found = store.find_node_by_token(&created.token).await.unwrap().unwrap();
        assert_eq!(found.id, created.node.id);
    }

    #[tokio::test]
    async fn test_delete_migrates_every_user_first() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store);
        let doomed = online_node(&store, "doomed", 1, 0).await;
        let a = online_node(&store, "a", 1, 0).await;
        let b = online_node(&store, "b", 1, 0).await;
        for user in 1..=4 {
            store.assign_user(user, doomed.id).await.unwrap();
        }

        let report = registry.delete_node(doomed.id).await.unwrap();
        assert_eq!(report.migrated.len(), 4);
        assert!(store.get_node(doomed.id).await.unwrap().is_none());
        for user in 1..=4 {
            let row = store.get_assignment(user).await.unwrap().unwrap();
            assert!(row.node_id == a.id || row.node_id == b.id);
        }
        let total = store_users(&store, a.id).await + store_users(&store, b.id).await;
        assert_eq!(total, 4);
    }

    async fn store_users(store: &Arc<MemoryStore>, node_id: i32) -> i32 {
        store.get_node(node_id).await.unwrap().unwrap().current_users
    }

    #[tokio::test]
    async fn test_delete_keeps_node_when_users_cannot_move() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store);
        let doomed = online_node(&store, "doomed", 1, 0).await;
        let small = online_node(&store, "small", 1, 1).await;
        for user in 1..=3 {
            store.assign_user(user, doomed.id).await.unwrap();
        }

        let err = registry.delete_node(doomed.id).await.unwrap_err();
        match err {
            ControlError::NodeHasUsers { node_id, unmigrated } => {
                assert_eq!(node_id, doomed.id);
                assert_eq!(unmigrated.len(), 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let kept = store.get_node(doomed.id).await.unwrap().unwrap();
        assert_eq!(kept.current_users, 2);
        assert_eq!(store_users(&store, small.id).await, 1);
        // Nobody is left without an assignment.
        for user in 1..=3 {
            assert!(store.get_assignment(user).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_delete_without_users_and_unknown_node() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store);
        let idle = online_node(&store, "idle", 1, 0).await;
        registry.delete_node(idle.id).await.unwrap();
        assert!(matches!(
            registry.delete_node(idle.id).await,
            Err(ControlError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_metrics_leaves_user_count_alone() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store);
        let node = online_node(&store, "a", 1, 0).await;
        store.assign_user(7, node.id).await.unwrap();

        registry.update_metrics(node.id, Some(42)).await.unwrap();
        let node = registry.get_node(node.id).await.unwrap();
        assert_eq!(node.latency_ms, Some(42));
        assert_eq!(node.current_users, 1);

        assert!(matches!(
            registry.update_metrics(999, Some(1)).await,
            Err(ControlError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_max_users_cannot_drop_below_current_users() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store);
        let node = online_node(&store, "a", 1, 0).await;
        for user_id in 1..=3 {
            store.assign_user(user_id, node.id).await.unwrap();
        }

        let shrink = NodeUpdate {
            name: Some("renamed".into()),
            max_users: Some(1),
            ..Default::default()
        };
        assert!(matches!(
            registry.update_node(node.id, shrink).await,
            Err(ControlError::Conflict(_))
        ));
        let unchanged = registry.get_node(node.id).await.unwrap();
        assert_eq!(unchanged.max_users, 0);
        assert_eq!(unchanged.name, "a");

        let fits = NodeUpdate {
            max_users: Some(3),
            ..Default::default()
        };
        assert_eq!(registry.update_node(node.id, fits).await.unwrap().max_users, 3);
    }

    #[tokio::test]
    async fn test_update_can_clear_location() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store);
        let node = online_node(&store, "a", 1, 0).await;
        let placed = registry
            .update_node(
                node.id,
                NodeUpdate {
                    region: Some(Some("eu".into())),
                    latitude: Some(Some(52.5)),
                    longitude: Some(Some(13.4)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(placed.region.as_deref(), Some("eu"));

        let cleared = registry
            .update_node(
                node.id,
                NodeUpdate {
                    region: Some(None),
                    latitude: Some(None),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(cleared.region, None);
        assert_eq!(cleared.latitude, None);
        assert_eq!(cleared.longitude, Some(13.4));
    }

    #[tokio::test]
    async fn test_group_membership_round() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store);
        let node = online_node(&store, "a", 1, 0).await;
        let group = registry
            .create_group(NewNodeGroup {
                name: "eu".into(),
                region: Some("eu-west".into()),
                strategy: Default::default(),
            })
            .await
            .unwrap();
        registry.add_member(group.id, node.id).await.unwrap();
        assert!(matches!(
            registry.add_member(group.id, node.id).await,
            Err(ControlError::Conflict(_))
        ));
        assert_eq!(registry.group_members(group.id).await.unwrap().len(), 1);
        assert_eq!(registry.groups_for_node(node.id).await.unwrap()[0].id, group.id);

        registry.remove_member(group.id, node.id).await.unwrap();
        assert!(registry.group_members(group.id).await.unwrap().is_empty());
        registry.delete_group(group.id).await.unwrap();
        assert!(matches!(
            registry.get_group(group.id).await,
            Err(ControlError::NotFound(_))
        ));
    }
}
