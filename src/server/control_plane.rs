//! Owns every control-plane component and the background loops that tie
//! health transitions to failover, recovery and config resync.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::agent_service::AgentClient;
use crate::db::Store;
use crate::error::ControlResult;
use crate::notifications::AdminNotifier;
use crate::server::agent_handler::AgentHandler;
use crate::server::command_dispatcher::CommandDispatcher;
use crate::server::config::ServerConfig;
use crate::services::auth_guard::AuthGuard;
use crate::services::config_sync::ConfigSync;
use crate::services::failover::FailoverManager;
use crate::services::geo::GeoLocator;
use crate::services::health_checker::{HealthChecker, HealthEvent, NodeProber};
use crate::services::load_balancer::LoadBalancer;
use crate::services::node_registry::{DeleteReport, NodeRegistry};

/// External collaborators the control plane is built on.
pub struct ControlDeps {
    pub store: Arc<dyn Store>,
    pub agent_client: Arc<dyn AgentClient>,
    pub prober: Arc<dyn NodeProber>,
    pub geo: Arc<dyn GeoLocator>,
    pub notifier: Arc<dyn AdminNotifier>,
}

pub struct ControlPlane {
    pub store: Arc<dyn Store>,
    pub auth: Arc<AuthGuard>,
    pub registry: Arc<NodeRegistry>,
    pub health: Arc<HealthChecker>,
    pub balancer: Arc<LoadBalancer>,
    pub failover: Arc<FailoverManager>,
    pub sync: Arc<ConfigSync>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub agents: Arc<AgentHandler>,
    health_interval: Duration,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ControlPlane {
    pub fn new(config: &ServerConfig, deps: ControlDeps) -> ControlResult<Self> {
        let ControlDeps {
            store,
            agent_client,
            prober,
            geo,
            notifier,
        } = deps;

        let auth = Arc::new(AuthGuard::new(store.clone(), &config.auth)?);
        let balancer = Arc::new(LoadBalancer::new(store.clone(), geo, config.balancer.clone()));
        let registry = Arc::new(NodeRegistry::new(
            store.clone(),
            auth.clone(),
            balancer.clone(),
            notifier.clone(),
        ));
        let health = Arc::new(HealthChecker::new(store.clone(), prober, config.health.clone()));
        let failover = Arc::new(FailoverManager::new(
            store.clone(),
            balancer.clone(),
            notifier,
            config.failover.clone(),
        ));
        let sync = Arc::new(ConfigSync::new(
            store.clone(),
            agent_client.clone(),
            config.sync.clone(),
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(
            store.clone(),
            agent_client,
            config.sync.timeout(),
        ));
        let agents = Arc::new(AgentHandler::new(
            store.clone(),
            auth.clone(),
            registry.clone(),
            health.clone(),
            sync.clone(),
            dispatcher.clone(),
            config.bootstrap_token.clone(),
            config.agent_port_default,
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            store,
            auth,
            registry,
            health,
            balancer,
            failover,
            sync,
            dispatcher,
            agents,
            health_interval: config.health.interval(),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Starts the probe loop, the heartbeat watchdog, the failover sweep and
    /// the event loop.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            warn!("Control plane already started.");
            return;
        }
        // Subscribe before the loops run so no transition is missed.
        let events = self.health.subscribe();
        tasks.push(tokio::spawn(
            self.health.clone().run(self.shutdown_tx.subscribe()),
        ));
        tasks.push(tokio::spawn(
            self.health
                .clone()
                .run_heartbeat_watchdog(self.shutdown_tx.subscribe()),
        ));
        tasks.push(tokio::spawn(self.failover.clone().run_sweep(
            self.health_interval,
            self.shutdown_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(run_event_loop(
            events,
            self.failover.clone(),
            self.sync.clone(),
            self.shutdown_tx.subscribe(),
        )));
        info!("Control plane started.");
    }

    /// Signals every loop to stop and waits for them.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Background task ended abnormally.");
            }
        }
        info!("Control plane stopped.");
    }

    /// Delete saga plus cleanup of per-node in-memory state.
    pub async fn delete_node(&self, node_id: i32) -> ControlResult<DeleteReport> {
        let report = self.registry.delete_node(node_id).await?;
        self.health.forget(node_id);
        self.dispatcher.forget(node_id);
        self.agents.forget(node_id);
        Ok(report)
    }
}

async fn run_event_loop(
    mut events: tokio::sync::broadcast::Receiver<HealthEvent>,
    failover: Arc<FailoverManager>,
    sync: Arc<ConfigSync>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => {
                    let failover = failover.clone();
                    let sync = sync.clone();
                    tokio::spawn(async move { handle_event(event, &failover, &sync).await });
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Health events were dropped; sweeping down nodes.");
                    let failover = failover.clone();
                    tokio::spawn(async move {
                        if let Err(e) = failover.fail_over_down_nodes().await {
                            error!(error = %e, "Failover sweep failed.");
                        }
                    });
                }
                Err(RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
    }
}

async fn handle_event(event: HealthEvent, failover: &FailoverManager, sync: &ConfigSync) {
    let node_id = event.node_id;
    if event.came_back() {
        // Its config may be stale after the outage.
        match sync.resync_node(node_id).await {
            Ok(true) => info!(node_id, "Resynced config after node came back."),
            Ok(false) => {}
            Err(e) => error!(node_id, error = %e, "Resync after recovery failed."),
        }
    }
    if let Err(e) = failover.handle_event(&event).await {
        error!(node_id, error = %e, "Failed to handle health transition.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_service::{
        AgentCommand, AgentHealth, CommandResult, SyncOutcome, TransportError,
    };
    use crate::db::entities::node;
    use crate::db::enums::NodeStatus;
    use crate::db::{AssignmentRepository, MemoryStore, NodeRepository};
    use crate::notifications::LogNotifier;
    use crate::services::config_sync::ProxyConfig;
    use crate::services::geo::StaticGeoLocator;
    use crate::services::health_checker::ProbeResult;
    use crate::services::test_support::online_node;
    use async_trait::async_trait;

    /// Reachable agent; the test moves nodes down by hand.
    struct SteadyAgent;

    #[async_trait]
    impl AgentClient for SteadyAgent {
        async fn execute_command(
            &self,
            _node: &node::Model,
            _command: AgentCommand,
        ) -> Result<CommandResult, TransportError> {
            Ok(CommandResult {
                success: true,
                output: String::new(),
            })
        }

        async fn sync_config(
            &self,
            _node: &node::Model,
            _config: &ProxyConfig,
        ) -> Result<SyncOutcome, TransportError> {
            Ok(SyncOutcome::Applied)
        }

        async fn health_check(&self, _node: &node::Model) -> Result<AgentHealth, TransportError> {
            Ok(AgentHealth {
                api_ok: true,
                process_ok: true,
            })
        }
    }

    #[async_trait]
    impl NodeProber for SteadyAgent {
        async fn probe(&self, _node: &node::Model) -> ProbeResult {
            ProbeResult {
                tcp_ok: true,
                api_ok: true,
                process_ok: true,
                latency_ms: Some(5),
                message: "ok".to_string(),
            }
        }
    }

    fn test_config() -> ServerConfig {
        let mut config = ServerConfig::new("k");
        config.health.interval_secs = 3600;
        config
    }

    #[tokio::test]
    async fn test_down_transition_triggers_failover() {
        let store = Arc::new(MemoryStore::new());
        let x = online_node(&store, "x", 1, 0).await;
        let y = online_node(&store, "y", 1, 0).await;
        store.assign_user(1, x.id).await.unwrap();

        let agent = Arc::new(SteadyAgent);
        let plane = ControlPlane::new(
            &test_config(),
            ControlDeps {
                store: store.clone(),
                agent_client: agent.clone(),
                prober: agent,
                geo: Arc::new(StaticGeoLocator::new()),
                notifier: Arc::new(LogNotifier),
            },
        )
        .unwrap();
        plane.start().await;

        plane.health.mark_offline(x.id, "test").await.unwrap();
        let mut moved = false;
        for _ in 0..100 {
            if store.get_assignment(1).await.unwrap().unwrap().node_id == y.id {
                moved = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(moved, "user should have been failed over to y");
        assert_eq!(
            store.get_node(x.id).await.unwrap().unwrap().status,
            NodeStatus::Offline
        );

        plane.stop().await;
    }

    #[tokio::test]
    async fn test_startup_sweep_moves_users_off_already_down_nodes() {
        let store = Arc::new(MemoryStore::new());
        let x = online_node(&store, "x", 1, 0).await;
        let y = online_node(&store, "y", 1, 0).await;
        store.assign_user(1, x.id).await.unwrap();
        // Went down without a health event reaching the event loop.
        store.set_node_status(x.id, NodeStatus::Unhealthy).await.unwrap();

        let agent = Arc::new(SteadyAgent);
        let plane = ControlPlane::new(
            &test_config(),
            ControlDeps {
                store: store.clone(),
                agent_client: agent.clone(),
                prober: agent,
                geo: Arc::new(StaticGeoLocator::new()),
                notifier: Arc::new(LogNotifier),
            },
        )
        .unwrap();
        plane.start().await;

        let mut moved = false;
        for _ in 0..100 {
            if store.get_assignment(1).await.unwrap().unwrap().node_id == y.id {
                moved = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(moved, "sweep should have moved the user to y");

        plane.stop().await;
    }
}
