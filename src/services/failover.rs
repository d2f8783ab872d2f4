//! Moves users off nodes that went down, and optionally back once they recover.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::db::entities::node_group;
use crate::db::enums::NodeStatus;
use crate::db::models::{MigrationKind, NodeFilter};
use crate::db::{AssignmentRepository, GroupRepository, NodeRepository, Store};
use crate::error::{ControlError, ControlResult};
use crate::notifications::{AdminAlert, AdminNotifier, AlertKind};
use crate::server::config::FailoverSettings;
use crate::services::health_checker::HealthEvent;
use crate::services::load_balancer::{LoadBalancer, UserMove};

#[derive(Debug, Clone, Default, Serialize)]
pub struct FailoverReport {
    pub node_id: i32,
    pub migrated: Vec<UserMove>,
    /// Users that could not be moved and are still on their previous node.
    pub failed: Vec<i32>,
}

#[derive(Clone)]
enum Plan {
    Away {
        from: i32,
        groups: Arc<Vec<node_group::Model>>,
    },
    Back {
        to: i32,
    },
}

pub struct FailoverManager {
    store: Arc<dyn Store>,
    balancer: Arc<LoadBalancer>,
    notifier: Arc<dyn AdminNotifier>,
    settings: FailoverSettings,
    permits: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

impl FailoverManager {
    pub fn new(
        store: Arc<dyn Store>,
        balancer: Arc<LoadBalancer>,
        notifier: Arc<dyn AdminNotifier>,
        settings: FailoverSettings,
    ) -> Self {
        Self {
            store,
            balancer,
            notifier,
            permits: Arc::new(Semaphore::new(settings.max_concurrent.max(1))),
            settings,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of migrations observed running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub async fn handle_event(&self, event: &HealthEvent) -> ControlResult<Option<FailoverReport>> {
        if event.went_down() {
            return self.fail_over_node(event.node_id).await.map(Some);
        }
        if event.came_back() && self.settings.recover_on_online {
            return self.recover_node(event.node_id).await.map(Some);
        }
        Ok(None)
    }

    /// Migrates every user on `node_id` elsewhere: nodes sharing a group with
    /// it first, in group id order, then any other online node.
    pub async fn fail_over_node(&self, node_id: i32) -> ControlResult<FailoverReport> {
        self.evacuate(node_id, true).await
    }

    async fn evacuate(&self, node_id: i32, alert_on_failure: bool) -> ControlResult<FailoverReport> {
        let users: Vec<(i32, i32)> = self
            .store
            .list_node_assignments(node_id)
            .await?
            .into_iter()
            .map(|a| (a.user_id, a.node_id))
            .collect();
        if users.is_empty() {
            return Ok(FailoverReport {
                node_id,
                ..Default::default()
            });
        }
        let groups = Arc::new(self.store.groups_for_node(node_id).await?);
        info!(node_id, users = users.len(), "Starting failover.");

        let report = self
            .run(node_id, users, Plan::Away { from: node_id, groups })
            .await;

        if report.failed.is_empty() {
            info!(node_id, migrated = report.migrated.len(), "Failover complete.");
        } else if !alert_on_failure {
            warn!(
                node_id,
                migrated = report.migrated.len(),
                failed = report.failed.len(),
                "Users are still stranded on a failed node."
            );
        } else {
            error!(
                node_id,
                migrated = report.migrated.len(),
                failed = report.failed.len(),
                "Failover left users on a failed node."
            );
            let alert = AdminAlert::new(
                AlertKind::FailoverIncomplete,
                node_id,
                format!(
                    "{} user(s) could not be moved off node {node_id}: no healthy node available",
                    report.failed.len()
                ),
                report.failed.clone(),
            );
            if let Err(e) = self.notifier.notify(&alert).await {
                error!(node_id, error = %e, "Failed to notify administrators.");
            }
        }
        Ok(report)
    }

    /// Moves users that failover took off `node_id` back onto it.
    pub async fn recover_node(&self, node_id: i32) -> ControlResult<FailoverReport> {
        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or_else(|| ControlError::NotFound(format!("Node {node_id}")))?;
        if node.status != NodeStatus::Online {
            return Err(ControlError::NodeUnhealthy(node_id));
        }
        let users: Vec<(i32, i32)> = self
            .store
            .list_displaced_assignments(node_id)
            .await?
            .into_iter()
            .filter(|a| a.node_id != node_id)
            .map(|a| (a.user_id, a.node_id))
            .collect();
        if users.is_empty() {
            return Ok(FailoverReport {
                node_id,
                ..Default::default()
            });
        }
        info!(node_id, users = users.len(), "Starting recovery migration.");
        let report = self.run(node_id, users, Plan::Back { to: node_id }).await;
        if !report.failed.is_empty() {
            // They stay on healthy nodes and keep their origin for a later attempt.
            warn!(node_id, failed = report.failed.len(), "Some users could not be moved back.");
            let alert = AdminAlert::new(
                AlertKind::RecoveryIncomplete,
                node_id,
                format!(
                    "{} user(s) could not be moved back to node {node_id}",
                    report.failed.len()
                ),
                report.failed.clone(),
            );
            if let Err(e) = self.notifier.notify(&alert).await {
                error!(node_id, error = %e, "Failed to notify administrators.");
            }
        }
        Ok(report)
    }

    /// Fails over every down node that still has users. Used to catch up
    /// after missed health events.
    pub async fn fail_over_down_nodes(&self) -> ControlResult<Vec<FailoverReport>> {
        let mut reports = Vec::new();
        for node_id in self.down_nodes_with_users().await? {
            reports.push(self.fail_over_node(node_id).await?);
        }
        Ok(reports)
    }

    /// Retries users left on down nodes by an earlier failover, e.g. because
    /// no node had room then. Does not alert again. Returns how many moved.
    pub async fn sweep_stranded_users(&self) -> ControlResult<usize> {
        let mut moved = 0;
        for node_id in self.down_nodes_with_users().await? {
            moved += self.evacuate(node_id, false).await?.migrated.len();
        }
        Ok(moved)
    }

    /// Runs [`Self::sweep_stranded_users`] every `period` until shutdown.
    pub async fn run_sweep(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => match self.sweep_stranded_users().await {
                    Ok(0) => {}
                    Ok(moved) => info!(moved, "Failover sweep moved stranded users."),
                    Err(e) => error!(error = %e, "Failover sweep failed."),
                },
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
    }

    async fn down_nodes_with_users(&self) -> ControlResult<Vec<i32>> {
        let mut down = Vec::new();
        for status in [NodeStatus::Unhealthy, NodeStatus::Offline] {
            let filter = NodeFilter {
                status: Some(status),
                ..Default::default()
            };
            for node in self.store.list_nodes(&filter).await? {
                if node.current_users > 0 {
                    down.push(node.id);
                }
            }
        }
        Ok(down)
    }

    async fn run(&self, node_id: i32, users: Vec<(i32, i32)>, plan: Plan) -> FailoverReport {
        let mut tasks = JoinSet::new();
        for (user_id, current) in users {
            let permits = self.permits.clone();
            let in_flight = self.in_flight.clone();
            let peak = self.peak_in_flight.clone();
            let balancer = self.balancer.clone();
            let store = self.store.clone();
            let plan = plan.clone();
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return (user_id, Err(ControlError::Transport("migration pool closed".into())));
                };
                let running = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(running, Ordering::SeqCst);
                let outcome = match plan {
                    Plan::Away { from, groups } => balancer
                        .relocate_user(user_id, from, &groups, MigrationKind::Failover)
                        .await
                        .map(|target| UserMove {
                            user_id,
                            from,
                            to: target.id,
                        }),
                    Plan::Back { to } => store
                        .migrate_user(user_id, current, to, MigrationKind::Recovery)
                        .await
                        .map(|_| UserMove {
                            user_id,
                            from: current,
                            to,
                        })
                        .map_err(ControlError::from),
                };
                in_flight.fetch_sub(1, Ordering::SeqCst);
                (user_id, outcome)
            });
        }

        let mut report = FailoverReport {
            node_id,
            ..Default::default()
        };
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(moved))) => report.migrated.push(moved),
                Ok((user_id, Err(e))) => {
                    error!(node_id, user_id, error = %e, "User migration failed.");
                    report.failed.push(user_id);
                }
                Err(e) => error!(node_id, error = %e, "Migration task panicked."),
            }
        }
        report.migrated.sort_by_key(|m| m.user_id);
        report.failed.sort_unstable();
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::enums::BalanceStrategy;
    use crate::db::models::NewNodeGroup;
    use crate::db::MemoryStore;
    use crate::notifications::NotifyError;
    use crate::server::config::BalancerSettings;
    use crate::services::geo::StaticGeoLocator;
    use crate::services::test_support::{add_node, online_node};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingNotifier {
        alerts: StdMutex<Vec<AdminAlert>>,
    }

    #[async_trait]
    impl AdminNotifier for RecordingNotifier {
        async fn notify(&self, alert: &AdminAlert) -> Result<(), NotifyError> {
            self.alerts.lock().unwrap().push(alert.clone());
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        notifier: Arc<RecordingNotifier>,
        manager: FailoverManager,
    }

    fn fixture(store: Arc<MemoryStore>, settings: FailoverSettings) -> Fixture {
        let notifier = Arc::new(RecordingNotifier::default());
        let balancer = Arc::new(LoadBalancer::new(
            store.clone(),
            Arc::new(StaticGeoLocator::new()),
            BalancerSettings {
                default_strategy: BalanceStrategy::LeastConnections,
                sticky: false,
            },
        ));
        let manager = FailoverManager::new(store.clone(), balancer, notifier.clone(), settings);
        Fixture {
            store,
            notifier,
            manager,
        }
    }

    async fn group_with(store: &Arc<MemoryStore>, name: &str, members: &[i32]) -> i32 {
        let group = store
            .create_group(NewNodeGroup {
                name: name.into(),
                region: None,
                strategy: BalanceStrategy::LeastConnections,
            })
            .await
            .unwrap();
        for &node_id in members {
            store.add_group_member(group.id, node_id).await.unwrap();
        }
        group.id
    }

    async fn node_of(store: &Arc<MemoryStore>, user_id: i32) -> i32 {
        store.get_assignment(user_id).await.unwrap().unwrap().node_id
    }

    #[tokio::test]
    async fn test_same_group_nodes_are_preferred() {
        let store = Arc::new(MemoryStore::new());
        let x = online_node(&store, "x", 1, 0).await;
        let peer = online_node(&store, "peer", 1, 0).await;
        let outsider = online_node(&store, "outsider", 1, 0).await;
        group_with(&store, "g", &[x.id, peer.id]).await;
        // Give the peer more load than the outsider so least-connections alone
        // would pick the outsider.
        for user in 100..105 {
            store.assign_user(user, peer.id).await.unwrap();
        }
        for user in 1..=4 {
            store.assign_user(user, x.id).await.unwrap();
        }
        store.set_node_status(x.id, NodeStatus::Unhealthy).await.unwrap();

        let f = fixture(store.clone(), FailoverSettings::default());
        let report = f.manager.fail_over_node(x.id).await.unwrap();
        assert_eq!(report.migrated.len(), 4);
        assert!(report.failed.is_empty());
        for user in 1..=4 {
            assert_eq!(node_of(&store, user).await, peer.id);
        }
        assert_ne!(outsider.id, peer.id);
        assert_eq!(store.get_node(x.id).await.unwrap().unwrap().current_users, 0);
    }

    #[tokio::test]
    async fn test_cross_group_fallback_when_group_is_down() {
        let store = Arc::new(MemoryStore::new());
        let x = online_node(&store, "x", 1, 0).await;
        let peer = add_node(&store, "peer", 1, 0, NodeStatus::Unhealthy).await;
        let elsewhere = online_node(&store, "elsewhere", 1, 0).await;
        group_with(&store, "g", &[x.id, peer.id]).await;
        group_with(&store, "other", &[elsewhere.id]).await;
        store.assign_user(1, x.id).await.unwrap();
        store.set_node_status(x.id, NodeStatus::Unhealthy).await.unwrap();

        let f = fixture(store.clone(), FailoverSettings::default());
        let report = f.manager.fail_over_node(x.id).await.unwrap();
        assert_eq!(report.migrated, vec![UserMove { user_id: 1, from: x.id, to: elsewhere.id }]);
        let row = store.get_assignment(1).await.unwrap().unwrap();
        assert_eq!(row.original_node_id, Some(x.id));
    }

    #[tokio::test]
    async fn test_full_peer_spills_over_to_other_groups() {
        let store = Arc::new(MemoryStore::new());
        let x = online_node(&store, "x", 1, 0).await;
        let peer = online_node(&store, "peer", 1, 2).await;
        let spare = online_node(&store, "spare", 1, 0).await;
        group_with(&store, "g", &[x.id, peer.id]).await;
        for user in 1..=5 {
            store.assign_user(user, x.id).await.unwrap();
        }
        store.set_node_status(x.id, NodeStatus::Offline).await.unwrap();

        let f = fixture(store.clone(), FailoverSettings::default());
        let report = f.manager.fail_over_node(x.id).await.unwrap();
        assert_eq!(report.migrated.len(), 5);
        let peer_after = store.get_node(peer.id).await.unwrap().unwrap();
        let spare_after = store.get_node(spare.id).await.unwrap().unwrap();
        assert_eq!(peer_after.current_users, 2);
        assert_eq!(spare_after.current_users, 3);
    }

    #[tokio::test]
    async fn test_no_destination_reports_and_notifies() {
        let store = Arc::new(MemoryStore::new());
        let x = online_node(&store, "x", 1, 0).await;
        store.assign_user(1, x.id).await.unwrap();
        store.assign_user(2, x.id).await.unwrap();
        store.set_node_status(x.id, NodeStatus::Unhealthy).await.unwrap();

        let f = fixture(store.clone(), FailoverSettings::default());
        let report = f.manager.fail_over_node(x.id).await.unwrap();
        assert!(report.migrated.is_empty());
        assert_eq!(report.failed, vec![1, 2]);
        // Left in place, never unassigned.
        assert_eq!(node_of(&store, 1).await, x.id);
        assert_eq!(node_of(&store, 2).await, x.id);

        let alerts = f.notifier.alerts.lock().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::FailoverIncomplete);
        assert_eq!(alerts[0].user_ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_sweep_moves_stranded_users_once_capacity_appears() {
        let store = Arc::new(MemoryStore::new());
        let x = online_node(&store, "x", 1, 0).await;
        store.assign_user(1, x.id).await.unwrap();
        store.set_node_status(x.id, NodeStatus::Offline).await.unwrap();

        let f = fixture(store.clone(), FailoverSettings::default());
        f.manager.fail_over_node(x.id).await.unwrap();
        assert_eq!(node_of(&store, 1).await, x.id);
        assert_eq!(f.manager.sweep_stranded_users().await.unwrap(), 0);

        let spare = online_node(&store, "spare", 1, 0).await;
        assert_eq!(f.manager.sweep_stranded_users().await.unwrap(), 1);
        assert_eq!(node_of(&store, 1).await, spare.id);
        assert_eq!(f.manager.sweep_stranded_users().await.unwrap(), 0);

        // Only the first, event-driven attempt alerted.
        assert_eq!(f.notifier.alerts.lock().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_migrations_stay_within_limit() {
        let store = Arc::new(MemoryStore::new());
        let x = online_node(&store, "x", 1, 0).await;
        for i in 0..4 {
            online_node(&store, &format!("dest-{i}"), 1, 0).await;
        }
        for user in 0..60 {
            store.assign_user(user, x.id).await.unwrap();
        }
        store.set_node_status(x.id, NodeStatus::Unhealthy).await.unwrap();

        let f = fixture(
            store.clone(),
            FailoverSettings {
                max_concurrent: 3,
                recover_on_online: false,
            },
        );
        let report = f.manager.fail_over_node(x.id).await.unwrap();
        assert_eq!(report.migrated.len(), 60);
        assert!(f.manager.peak_in_flight() >= 1);
        assert!(f.manager.peak_in_flight() <= 3);
        assert_eq!(f.manager.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_recovery_moves_displaced_users_back_when_enabled() {
        let store = Arc::new(MemoryStore::new());
        let x = online_node(&store, "x", 1, 0).await;
        let y = online_node(&store, "y", 1, 0).await;
        store.assign_user(1, x.id).await.unwrap();
        store.assign_user(2, y.id).await.unwrap();

        let f = fixture(
            store.clone(),
            FailoverSettings {
                max_concurrent: 2,
                recover_on_online: true,
            },
        );
        store.set_node_status(x.id, NodeStatus::Unhealthy).await.unwrap();
        let down = HealthEvent {
            node_id: x.id,
            from: NodeStatus::Online,
            to: NodeStatus::Unhealthy,
            at: chrono::Utc::now(),
        };
        f.manager.handle_event(&down).await.unwrap().unwrap();
        assert_eq!(node_of(&store, 1).await, y.id);

        store.set_node_status(x.id, NodeStatus::Online).await.unwrap();
        let up = HealthEvent {
            from: NodeStatus::Unhealthy,
            to: NodeStatus::Online,
            ..down
        };
        let report = f.manager.handle_event(&up).await.unwrap().unwrap();
        assert_eq!(report.migrated.len(), 1);
        let row = store.get_assignment(1).await.unwrap().unwrap();
        assert_eq!(row.node_id, x.id);
        assert_eq!(row.original_node_id, None);
        // User 2 always lived on y and stays there.
        assert_eq!(node_of(&store, 2).await, y.id);
    }

    #[tokio::test]
    async fn test_recovery_is_off_by_default() {
        let store = Arc::new(MemoryStore::new());
        let x = online_node(&store, "x", 1, 0).await;
        let f = fixture(store.clone(), FailoverSettings::default());
        let up = HealthEvent {
            node_id: x.id,
            from: NodeStatus::Unhealthy,
            to: NodeStatus::Online,
            at: chrono::Utc::now(),
        };
        assert!(f.manager.handle_event(&up).await.unwrap().is_none());
    }
}
