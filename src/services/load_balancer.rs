//! Node selection and user assignment.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::db::entities::{node, node_group, user_node_assignment};
use crate::db::enums::{BalanceStrategy, NodeStatus};
use crate::db::models::{MigrationKind, NodeFilter};
use crate::db::{AssignmentRepository, GroupRepository, NodeRepository, Store, StoreError};
use crate::error::{ControlError, ControlResult};
use crate::server::config::BalancerSettings;
use crate::services::geo::{Coordinates, GeoLocator};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SelectOptions {
    /// Overrides the group's (or the global default) strategy.
    pub strategy: Option<BalanceStrategy>,
    pub group_id: Option<i32>,
    #[serde(default)]
    pub exclude: Vec<i32>,
    pub user_ip: Option<IpAddr>,
    /// Falls back to the configured default when unset.
    pub sticky: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UserMove {
    pub user_id: i32,
    pub from: i32,
    pub to: i32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RebalanceReport {
    pub group_id: i32,
    pub moved: Vec<UserMove>,
    pub failed: Vec<i32>,
}

pub struct LoadBalancer {
    store: Arc<dyn Store>,
    geo: Arc<dyn GeoLocator>,
    settings: BalancerSettings,
    // Round-robin cursor per group scope; `None` is the global scope.
    cursors: DashMap<Option<i32>, AtomicU64>,
}

impl LoadBalancer {
    pub fn new(store: Arc<dyn Store>, geo: Arc<dyn GeoLocator>, settings: BalancerSettings) -> Self {
        Self {
            store,
            geo,
            settings,
            cursors: DashMap::new(),
        }
    }

    async fn resolve_strategy(&self, opts: &SelectOptions) -> ControlResult<BalanceStrategy> {
        let group_strategy = match opts.group_id {
            Some(group_id) => Some(
                self.store
                    .get_group(group_id)
                    .await?
                    .ok_or_else(|| ControlError::NotFound(format!("Group {group_id}")))?
                    .strategy,
            ),
            None => None,
        };
        Ok(opts
            .strategy
            .or(group_strategy)
            .unwrap_or(self.settings.default_strategy))
    }

    pub async fn select_node(&self, user_id: i32, opts: &SelectOptions) -> ControlResult<node::Model> {
        let strategy = self.resolve_strategy(opts).await?;
        let excluded: HashSet<i32> = opts.exclude.iter().copied().collect();
        let online: Vec<node::Model> = self
            .store
            .list_nodes(&NodeFilter::online_in_group(opts.group_id))
            .await?
            .into_iter()
            .filter(|n| !excluded.contains(&n.id))
            .collect();

        if opts.sticky.unwrap_or(self.settings.sticky) {
            if let Some(current) = self.store.get_assignment(user_id).await? {
                // The user already occupies one of this node's slots.
                let usable = |n: &&node::Model| {
                    n.id == current.node_id && (n.max_users == 0 || n.current_users <= n.max_users)
                };
                if let Some(node) = online.iter().find(usable) {
                    debug!(user_id, node_id = node.id, "Sticky selection kept the current node.");
                    return Ok(node.clone());
                }
            }
        }

        let candidates: Vec<node::Model> = online.into_iter().filter(|n| !n.is_full()).collect();
        if candidates.is_empty() {
            return Err(ControlError::NoHealthyNodes);
        }

        let chosen = match strategy {
            BalanceStrategy::RoundRobin => self.round_robin(opts.group_id, &candidates),
            BalanceStrategy::LeastConnections => least_connections(&candidates),
            BalanceStrategy::Weighted => weighted(&candidates),
            BalanceStrategy::Geographic => self.nearest(opts.user_ip, &candidates).await,
        }
        .ok_or(ControlError::NoHealthyNodes)?;
        debug!(user_id, node_id = chosen.id, %strategy, "Selected node.");
        Ok(chosen)
    }

    fn round_robin(&self, scope: Option<i32>, candidates: &[node::Model]) -> Option<node::Model> {
        let ticket = self
            .cursors
            .entry(scope)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
        candidates
            .get((ticket % candidates.len() as u64) as usize)
            .cloned()
    }

    async fn nearest(&self, user_ip: Option<IpAddr>, candidates: &[node::Model]) -> Option<node::Model> {
        let user_location = match user_ip {
            Some(ip) => self.geo.locate(ip).await,
            None => None,
        };
        let Some(user_location) = user_location else {
            return least_connections(candidates);
        };

        let mut distances = Vec::with_capacity(candidates.len());
        for node in candidates {
            let location = match node.coordinates() {
                Some((lat, lon)) => Some(Coordinates::new(lat, lon)),
                None => match node.address.parse::<IpAddr>() {
                    Ok(ip) => self.geo.locate(ip).await,
                    Err(_) => None,
                },
            };
            if let Some(location) = location {
                distances.push((node, user_location.distance_km(&location)));
            }
        }
        if distances.is_empty() {
            return least_connections(candidates);
        }
        let min = distances
            .iter()
            .map(|(_, d)| *d)
            .fold(f64::INFINITY, f64::min);
        let nearest: Vec<node::Model> = distances
            .into_iter()
            .filter(|(_, d)| (*d - min).abs() < 1e-6)
            .map(|(n, _)| n.clone())
            .collect();
        least_connections(&nearest)
    }

    /// Points the user at a specific node, which must be online and not full.
    pub async fn assign_user(
        &self,
        user_id: i32,
        node_id: i32,
    ) -> ControlResult<user_node_assignment::Model> {
        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or_else(|| ControlError::NotFound(format!("Node {node_id}")))?;
        match node.status {
            NodeStatus::Online => {}
            NodeStatus::Offline => return Err(ControlError::NodeOffline(node_id)),
            NodeStatus::Unhealthy => return Err(ControlError::NodeUnhealthy(node_id)),
        }
        let row = self.store.assign_user(user_id, node_id).await?;
        info!(user_id, node_id, "Assigned user to node.");
        Ok(row)
    }

    pub async fn unassign_user(
        &self,
        user_id: i32,
    ) -> ControlResult<Option<user_node_assignment::Model>> {
        let removed = self.store.unassign_user(user_id).await?;
        if let Some(row) = &removed {
            info!(user_id, node_id = row.node_id, "Unassigned user.");
        }
        Ok(removed)
    }

    /// Selects and assigns in one step. A node that filled up between the
    /// two is excluded and selection runs again.
    pub async fn select_and_assign(
        &self,
        user_id: i32,
        opts: &SelectOptions,
    ) -> ControlResult<(node::Model, user_node_assignment::Model)> {
        let mut opts = opts.clone();
        loop {
            let node = self.select_node(user_id, &opts).await?;
            match self.store.assign_user(user_id, node.id).await {
                Ok(row) => {
                    info!(user_id, node_id = node.id, "Assigned user to node.");
                    return Ok((node, row));
                }
                Err(StoreError::AtCapacity(node_id)) => {
                    debug!(user_id, node_id, "Node filled up during selection; retrying.");
                    opts.exclude.push(node_id);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Moves a user off `from`, trying each preferred group in order before
    /// any online node outside them. The move only happens while the user
    /// is still on `from`.
    pub async fn relocate_user(
        &self,
        user_id: i32,
        from: i32,
        preferred_groups: &[node_group::Model],
        kind: MigrationKind,
    ) -> ControlResult<node::Model> {
        let mut excluded = vec![from];
        let scopes = preferred_groups
            .iter()
            .map(|g| Some(g.id))
            .chain(std::iter::once(None));
        for group_id in scopes {
            loop {
                let opts = SelectOptions {
                    group_id,
                    exclude: excluded.clone(),
                    sticky: Some(false),
                    ..Default::default()
                };
                let target = match self.select_node(user_id, &opts).await {
                    Ok(node) => node,
                    Err(ControlError::NoHealthyNodes) => break,
                    Err(e) => return Err(e),
                };
                match self.store.migrate_user(user_id, from, target.id, kind).await {
                    Ok(_) => return Ok(target),
                    Err(StoreError::AtCapacity(node_id)) => excluded.push(node_id),
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Err(ControlError::NoHealthyNodes)
    }

    /// Moves users between the group's online nodes toward the target
    /// distribution of the group's strategy: proportional to weight for
    /// `weighted`, even otherwise, capped by `max_users`. Users with the
    /// highest ids move first. Running it twice moves nobody the second time.
    pub async fn rebalance(&self, group_id: i32) -> ControlResult<RebalanceReport> {
        let group = self
            .store
            .get_group(group_id)
            .await?
            .ok_or_else(|| ControlError::NotFound(format!("Group {group_id}")))?;
        let mut report = RebalanceReport {
            group_id,
            ..Default::default()
        };
        if group.strategy == BalanceStrategy::Geographic {
            info!(group_id, "Geographic groups are placed by location; nothing to rebalance.");
            return Ok(report);
        }

        let nodes = self
            .store
            .list_nodes(&NodeFilter::online_in_group(Some(group_id)))
            .await?;
        if nodes.len() < 2 {
            return Ok(report);
        }
        let mut users_per_node = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let mut users: Vec<i32> = self
                .store
                .list_node_assignments(node.id)
                .await?
                .into_iter()
                .map(|a| a.user_id)
                .collect();
            users.sort_unstable();
            users_per_node.push(users);
        }

        let total: usize = users_per_node.iter().map(Vec::len).sum();
        let weights: Vec<u64> = nodes
            .iter()
            .map(|n| match group.strategy {
                BalanceStrategy::Weighted => n.weight.max(1) as u64,
                _ => 1,
            })
            .collect();
        let caps: Vec<Option<usize>> = nodes
            .iter()
            .map(|n| (n.max_users > 0).then_some(n.max_users as usize))
            .collect();
        let targets = distribute(total, &weights, &caps);

        let mut movers = Vec::new();
        let mut open_slots = Vec::new();
        for (i, node) in nodes.iter().enumerate() {
            let users = &users_per_node[i];
            if users.len() > targets[i] {
                movers.extend(users[targets[i]..].iter().map(|&u| (u, node.id)));
            } else {
                open_slots.extend(std::iter::repeat(node.id).take(targets[i] - users.len()));
            }
        }

        for ((user_id, from), to) in movers.into_iter().zip(open_slots) {
            match self
                .store
                .migrate_user(user_id, from, to, MigrationKind::Administrative)
                .await
            {
                Ok(_) => report.moved.push(UserMove { user_id, from, to }),
                Err(e) => {
                    warn!(user_id, from, to, error = %e, "Rebalance could not move user.");
                    report.failed.push(user_id);
                }
            }
        }
        info!(
            group_id,
            moved = report.moved.len(),
            failed = report.failed.len(),
            "Rebalanced group."
        );
        Ok(report)
    }
}

fn least_connections(candidates: &[node::Model]) -> Option<node::Model> {
    candidates
        .iter()
        .min_by_key(|n| (n.current_users, n.id))
        .cloned()
}

fn weighted(candidates: &[node::Model]) -> Option<node::Model> {
    let total: u64 = candidates.iter().map(|n| n.weight.max(1) as u64).sum();
    if total == 0 {
        return None;
    }
    let mut roll = rand::rng().random_range(0..total);
    for node in candidates {
        let weight = node.weight.max(1) as u64;
        if roll < weight {
            return Some(node.clone());
        }
        roll -= weight;
    }
    candidates.last().cloned()
}

/// Splits `total` across `weights` by largest remainder; ties go to the lower index.
fn largest_remainder(total: usize, weights: &[u64]) -> Vec<usize> {
    let sum: u64 = weights.iter().sum();
    if sum == 0 {
        return vec![0; weights.len()];
    }
    let mut shares = Vec::with_capacity(weights.len());
    let mut remainders = Vec::with_capacity(weights.len());
    for (i, &w) in weights.iter().enumerate() {
        let scaled = total as u64 * w;
        shares.push((scaled / sum) as usize);
        remainders.push((scaled % sum, i));
    }
    let leftover = total - shares.iter().sum::<usize>();
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    for &(_, i) in remainders.iter().take(leftover) {
        shares[i] += 1;
    }
    shares
}

/// Target user count per node. Nodes whose share exceeds their cap are
/// pinned at the cap and the rest is split among the others.
fn distribute(total: usize, weights: &[u64], caps: &[Option<usize>]) -> Vec<usize> {
    let mut targets = vec![0; weights.len()];
    let mut pinned = vec![false; weights.len()];
    let mut remaining = total;
    loop {
        let active: Vec<usize> = (0..weights.len()).filter(|&i| !pinned[i]).collect();
        if active.is_empty() {
            break;
        }
        let active_weights: Vec<u64> = active.iter().map(|&i| weights[i]).collect();
        let shares = largest_remainder(remaining, &active_weights);
        let mut capped = false;
        for (k, &i) in active.iter().enumerate() {
            if let Some(cap) = caps[i] {
                if shares[k] > cap {
                    targets[i] = cap;
                    pinned[i] = true;
                    remaining -= cap;
                    capped = true;
                }
            }
        }
        if !capped {
            for (k, &i) in active.iter().enumerate() {
                targets[i] = shares[k];
            }
            break;
        }
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::NewNodeGroup;
    use crate::db::MemoryStore;
    use crate::services::geo::StaticGeoLocator;
    use crate::services::test_support::{add_node, online_node};
    use std::collections::HashMap;

    fn balancer(store: &Arc<MemoryStore>) -> LoadBalancer {
        LoadBalancer::new(
            store.clone(),
            Arc::new(StaticGeoLocator::new()),
            BalancerSettings::default(),
        )
    }

    fn no_sticky(strategy: BalanceStrategy) -> SelectOptions {
        SelectOptions {
            strategy: Some(strategy),
            sticky: Some(false),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_round_robin_alternates_until_capacity_is_exhausted() {
        let store = Arc::new(MemoryStore::new());
        let a = online_node(&store, "a", 1, 2).await;
        let b = online_node(&store, "b", 1, 2).await;
        let lb = balancer(&store);
        let opts = no_sticky(BalanceStrategy::RoundRobin);

        let mut placed = Vec::new();
        for user in 1..=4 {
            let (node, _) = lb.select_and_assign(user, &opts).await.unwrap();
            placed.push(node.id);
        }
        assert_eq!(placed, vec![a.id, b.id, a.id, b.id]);
        assert!(matches!(
            lb.select_and_assign(5, &opts).await,
            Err(ControlError::NoHealthyNodes)
        ));
        assert!(matches!(
            lb.assign_user(5, a.id).await,
            Err(ControlError::NodeAtCapacity(id)) if id == a.id
        ));
    }

    #[tokio::test]
    async fn test_least_connections_breaks_ties_by_lowest_id() {
        let store = Arc::new(MemoryStore::new());
        let a = online_node(&store, "a", 1, 0).await;
        let b = online_node(&store, "b", 1, 0).await;
        let lb = balancer(&store);
        let opts = no_sticky(BalanceStrategy::LeastConnections);

        assert_eq!(lb.select_node(1, &opts).await.unwrap().id, a.id);
        lb.assign_user(1, a.id).await.unwrap();
        assert_eq!(lb.select_node(2, &opts).await.unwrap().id, b.id);
    }

    #[tokio::test]
    async fn test_weighted_selection_tracks_weight_ratios() {
        let store = Arc::new(MemoryStore::new());
        let nodes = [
            online_node(&store, "w1", 1, 0).await,
            online_node(&store, "w2", 2, 0).await,
            online_node(&store, "w3", 3, 0).await,
        ];
        let lb = balancer(&store);
        let opts = no_sticky(BalanceStrategy::Weighted);

        let trials = 6000;
        let mut counts: HashMap<i32, usize> = HashMap::new();
        for user in 0..trials {
            let node = lb.select_node(user, &opts).await.unwrap();
            *counts.entry(node.id).or_default() += 1;
        }
        for (node, weight) in nodes.iter().zip([1.0, 2.0, 3.0]) {
            let observed = counts[&node.id] as f64 / trials as f64;
            let expected = weight / 6.0;
            assert!(
                (observed - expected).abs() < 0.03,
                "node {} observed {observed:.3}, expected {expected:.3}",
                node.name
            );
        }
    }

    #[tokio::test]
    async fn test_sticky_keeps_user_on_current_node() {
        let store = Arc::new(MemoryStore::new());
        let a = online_node(&store, "a", 1, 1).await;
        let b = online_node(&store, "b", 1, 0).await;
        let lb = balancer(&store);
        lb.assign_user(42, a.id).await.unwrap();

        // `a` is full, but the slot is the user's own.
        let sticky = SelectOptions {
            strategy: Some(BalanceStrategy::LeastConnections),
            sticky: Some(true),
            ..Default::default()
        };
        for _ in 0..5 {
            assert_eq!(lb.select_node(42, &sticky).await.unwrap().id, a.id);
        }

        let excluded = SelectOptions {
            exclude: vec![a.id],
            ..sticky.clone()
        };
        assert_eq!(lb.select_node(42, &excluded).await.unwrap().id, b.id);

        store.set_node_status(a.id, NodeStatus::Unhealthy).await.unwrap();
        assert_eq!(lb.select_node(42, &sticky).await.unwrap().id, b.id);
    }

    #[tokio::test]
    async fn test_offline_and_full_nodes_are_never_selected() {
        let store = Arc::new(MemoryStore::new());
        add_node(&store, "down", 1, 0, NodeStatus::Offline).await;
        let full = online_node(&store, "full", 1, 1).await;
        let open = online_node(&store, "open", 1, 0).await;
        let lb = balancer(&store);
        lb.assign_user(1, full.id).await.unwrap();

        for user in 2..20 {
            let node = lb
                .select_node(user, &no_sticky(BalanceStrategy::RoundRobin))
                .await
                .unwrap();
            assert_eq!(node.id, open.id);
        }
    }

    #[tokio::test]
    async fn test_assign_to_down_node_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let off = add_node(&store, "off", 1, 0, NodeStatus::Offline).await;
        let sick = add_node(&store, "sick", 1, 0, NodeStatus::Unhealthy).await;
        let lb = balancer(&store);
        assert!(matches!(lb.assign_user(1, off.id).await, Err(ControlError::NodeOffline(_))));
        assert!(matches!(lb.assign_user(1, sick.id).await, Err(ControlError::NodeUnhealthy(_))));
        assert!(matches!(lb.assign_user(1, 999).await, Err(ControlError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_geographic_picks_nearest_and_falls_back_without_location() {
        let store = Arc::new(MemoryStore::new());
        let paris = store
            .create_node(
                crate::db::models::NewNode {
                    latitude: Some(48.85),
                    longitude: Some(2.35),
                    ..crate::services::test_support::new_node("paris")
                },
                "tok-paris".into(),
            )
            .await
            .unwrap();
        let tokyo = store
            .create_node(
                crate::db::models::NewNode {
                    latitude: Some(35.68),
                    longitude: Some(139.69),
                    ..crate::services::test_support::new_node("tokyo")
                },
                "tok-tokyo".into(),
            )
            .await
            .unwrap();
        store.set_node_status(paris.id, NodeStatus::Online).await.unwrap();
        store.set_node_status(tokyo.id, NodeStatus::Online).await.unwrap();
        store.assign_user(100, paris.id).await.unwrap();

        let geo = StaticGeoLocator::new()
            .with_entry("203.0.113.0/24".parse().unwrap(), Coordinates::new(35.0, 135.0));
        let lb = LoadBalancer::new(store.clone(), Arc::new(geo), BalancerSettings::default());

        let near_tokyo = SelectOptions {
            user_ip: Some("203.0.113.7".parse().unwrap()),
            ..no_sticky(BalanceStrategy::Geographic)
        };
        assert_eq!(lb.select_node(1, &near_tokyo).await.unwrap().id, tokyo.id);

        // Unknown location: least-connections, and paris already has a user.
        let unknown = SelectOptions {
            user_ip: Some("192.0.2.1".parse().unwrap()),
            ..no_sticky(BalanceStrategy::Geographic)
        };
        assert_eq!(lb.select_node(2, &unknown).await.unwrap().id, tokyo.id);
    }

    #[tokio::test]
    async fn test_group_scope_and_missing_group() {
        let store = Arc::new(MemoryStore::new());
        let a = online_node(&store, "a", 1, 0).await;
        let b = online_node(&store, "b", 1, 0).await;
        let group = store
            .create_group(NewNodeGroup {
                name: "eu".into(),
                region: None,
                strategy: BalanceStrategy::LeastConnections,
            })
            .await
            .unwrap();
        store.add_group_member(group.id, b.id).await.unwrap();
        let lb = balancer(&store);

        let scoped = SelectOptions {
            group_id: Some(group.id),
            sticky: Some(false),
            ..Default::default()
        };
        for user in 0..4 {
            assert_eq!(lb.select_node(user, &scoped).await.unwrap().id, b.id);
        }
        assert_ne!(a.id, b.id);

        let missing = SelectOptions {
            group_id: Some(999),
            ..Default::default()
        };
        assert!(matches!(lb.select_node(1, &missing).await, Err(ControlError::NotFound(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_assignments_never_overshoot_capacity() {
        let store = Arc::new(MemoryStore::new());
        let node = online_node(&store, "tight", 1, 5).await;
        let lb = Arc::new(balancer(&store));

        let mut handles = Vec::new();
        for user in 0..40 {
            let lb = lb.clone();
            handles.push(tokio::spawn(async move {
                lb.select_and_assign(user, &no_sticky(BalanceStrategy::LeastConnections))
                    .await
            }));
        }
        let mut ok = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(ControlError::NoHealthyNodes) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ok, 5);
        let node = store.get_node(node.id).await.unwrap().unwrap();
        assert_eq!(node.current_users, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_round_robin_spreads_evenly() {
        let store = Arc::new(MemoryStore::new());
        let mut nodes = Vec::new();
        for name in ["r1", "r2", "r3", "r4"] {
            nodes.push(online_node(&store, name, 1, 0).await);
        }
        let lb = Arc::new(balancer(&store));
        let rounds = 25;

        let mut handles = Vec::new();
        for user in 0..(nodes.len() * rounds) as i32 {
            let lb = lb.clone();
            handles.push(tokio::spawn(async move {
                lb.select_node(user, &no_sticky(BalanceStrategy::RoundRobin))
                    .await
            }));
        }
        let mut counts: HashMap<i32, usize> = HashMap::new();
        for handle in handles {
            let node = handle.await.unwrap().unwrap();
            *counts.entry(node.id).or_default() += 1;
        }
        for node in &nodes {
            assert_eq!(counts.get(&node.id), Some(&rounds), "node {}", node.name);
        }
    }

    #[tokio::test]
    async fn test_rebalance_evens_out_and_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let a = online_node(&store, "a", 1, 0).await;
        let b = online_node(&store, "b", 1, 0).await;
        let group = store
            .create_group(NewNodeGroup {
                name: "pool".into(),
                region: None,
                strategy: BalanceStrategy::RoundRobin,
            })
            .await
            .unwrap();
        store.add_group_member(group.id, a.id).await.unwrap();
        store.add_group_member(group.id, b.id).await.unwrap();
        for user in 1..=6 {
            store.assign_user(user, a.id).await.unwrap();
        }
        let lb = balancer(&store);

        let report = lb.rebalance(group.id).await.unwrap();
        assert_eq!(report.moved.len(), 3);
        assert!(report.moved.iter().all(|m| m.from == a.id && m.to == b.id));
        let moved: Vec<i32> = report.moved.iter().map(|m| m.user_id).collect();
        assert_eq!(moved, vec![4, 5, 6]);

        let again = lb.rebalance(group.id).await.unwrap();
        assert!(again.moved.is_empty());
        assert_eq!(store.get_node(a.id).await.unwrap().unwrap().current_users, 3);
        assert_eq!(store.get_node(b.id).await.unwrap().unwrap().current_users, 3);
    }

    #[test]
    fn test_distribute_respects_weights_and_caps() {
        assert_eq!(distribute(6, &[1, 2, 3], &[None, None, None]), vec![1, 2, 3]);
        assert_eq!(distribute(7, &[1, 1, 1], &[None, None, None]), vec![3, 2, 2]);
        assert_eq!(distribute(9, &[1, 1, 1], &[Some(1), None, None]), vec![1, 4, 4]);
    }
}
