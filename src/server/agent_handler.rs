//! Agent-initiated calls: `Register`, `Heartbeat` and `ReportMetrics`.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info};

use crate::agent_service::{
    Ack, AgentMetrics, HeartbeatRequest, HeartbeatResponse, RegisterRequest, RegisterResponse,
    ReportMetricsRequest,
};
use crate::db::models::NewNode;
use crate::db::{Store, TrafficRepository};
use crate::error::{ControlError, ControlResult};
use crate::server::command_dispatcher::CommandDispatcher;
use crate::services::auth_guard::{tokens_match, AuthGuard};
use crate::services::config_sync::ConfigSync;
use crate::services::health_checker::HealthChecker;
use crate::services::node_registry::NodeRegistry;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MetricsSnapshot {
    pub metrics: AgentMetrics,
    pub reported_at: DateTime<Utc>,
}

pub struct AgentHandler {
    store: Arc<dyn Store>,
    auth: Arc<AuthGuard>,
    registry: Arc<NodeRegistry>,
    health: Arc<HealthChecker>,
    sync: Arc<ConfigSync>,
    dispatcher: Arc<CommandDispatcher>,
    bootstrap_token: Option<String>,
    agent_port_default: i32,
    metrics: DashMap<i32, MetricsSnapshot>,
}

impl AgentHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        auth: Arc<AuthGuard>,
        registry: Arc<NodeRegistry>,
        health: Arc<HealthChecker>,
        sync: Arc<ConfigSync>,
        dispatcher: Arc<CommandDispatcher>,
        bootstrap_token: Option<String>,
        agent_port_default: i32,
    ) -> Self {
        Self {
            store,
            auth,
            registry,
            health,
            sync,
            dispatcher,
            bootstrap_token: bootstrap_token.filter(|t| !t.is_empty()),
            agent_port_default,
            metrics: DashMap::new(),
        }
    }

    fn is_bootstrap(&self, token: &str) -> bool {
        self.bootstrap_token
            .as_deref()
            .is_some_and(|expected| tokens_match(token, expected))
    }

    /// Self-registration with the bootstrap token creates a node and hands
    /// out its token once. A node token re-registers the existing node.
    pub async fn register(&self, req: RegisterRequest, source_ip: IpAddr) -> ControlResult<RegisterResponse> {
        self.auth.check_source(source_ip).await?;

        if !self.is_bootstrap(&req.token) {
            let node = self.auth.authenticate(&req.token, source_ip).await?;
            info!(node_id = node.id, ip = %source_ip, "Agent re-registered.");
            return Ok(RegisterResponse {
                accepted: true,
                node_id: node.id,
                node_token: None,
                initial_config: self.sync.config_for(node.id).await?,
            });
        }

        let name = req
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| ControlError::InvalidConfig("registration requires a node name".into()))?;
        let new = NewNode {
            name,
            address: req.address.unwrap_or_else(|| source_ip.to_string()),
            agent_port: req.agent_port.unwrap_or(self.agent_port_default),
            tags: req.tags,
            region: req.region,
            latitude: req.latitude,
            longitude: req.longitude,
            weight: 1,
            max_users: req.max_users.unwrap_or(0),
        };
        let created = self.registry.create_node(new).await?;
        info!(node_id = created.node.id, ip = %source_ip, "Agent self-registered a new node.");
        Ok(RegisterResponse {
            accepted: true,
            node_id: created.node.id,
            node_token: Some(created.token),
            initial_config: self.sync.config_for(created.node.id).await?,
        })
    }

    pub async fn heartbeat(&self, req: HeartbeatRequest, source_ip: IpAddr) -> ControlResult<HeartbeatResponse> {
        let node = self.auth.authenticate(&req.token, source_ip).await?;
        self.health.record_heartbeat(node.id).await?;
        self.remember(node.id, req.metrics);

        let commands = self.dispatcher.drain(node.id);
        if commands.is_empty() {
            debug!(node_id = node.id, "Heartbeat acknowledged.");
            Ok(HeartbeatResponse::Ack)
        } else {
            info!(node_id = node.id, count = commands.len(), "Delivering queued commands.");
            Ok(HeartbeatResponse::Command { commands })
        }
    }

    pub async fn report_metrics(&self, req: ReportMetricsRequest, source_ip: IpAddr) -> ControlResult<Ack> {
        let node = self.auth.authenticate(&req.token, source_ip).await?;
        self.remember(node.id, req.metrics);
        let stored = self
            .store
            .append_traffic(node.id, &req.traffic, Utc::now())
            .await?;
        debug!(node_id = node.id, samples = stored, "Traffic samples stored.");
        Ok(Ack { ok: true })
    }

    pub fn latest_metrics(&self, node_id: i32) -> Option<MetricsSnapshot> {
        self.metrics.get(&node_id).map(|entry| *entry)
    }

    pub fn forget(&self, node_id: i32) {
        self.metrics.remove(&node_id);
    }

    fn remember(&self, node_id: i32, metrics: AgentMetrics) {
        self.metrics.insert(
            node_id,
            MetricsSnapshot {
                metrics,
                reported_at: Utc::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_service::{
        AgentClient, AgentCommand, AgentHealth, CommandResult, SyncOutcome, TransportError,
    };
    use crate::db::entities::node;
    use crate::db::enums::NodeStatus;
    use crate::db::models::TrafficSample;
    use crate::db::{MemoryStore, NodeRepository};
    use crate::notifications::LogNotifier;
    use crate::server::config::{AuthSettings, BalancerSettings, HealthSettings, SyncSettings};
    use crate::services::config_sync::{Inbound, ProxyConfig};
    use crate::services::geo::StaticGeoLocator;
    use crate::services::health_checker::{NodeProber, ProbeResult};
    use crate::services::load_balancer::LoadBalancer;
    use async_trait::async_trait;
    use std::time::Duration;

    struct NullAgent;

    #[async_trait]
    impl AgentClient for NullAgent {
        async fn execute_command(
            &self,
            _node: &node::Model,
            _command: AgentCommand,
        ) -> Result<CommandResult, TransportError> {
            Err(TransportError::Timeout)
        }

        async fn sync_config(
            &self,
            _node: &node::Model,
            _config: &ProxyConfig,
        ) -> Result<SyncOutcome, TransportError> {
            Ok(SyncOutcome::Applied)
        }

        async fn health_check(&self, _node: &node::Model) -> Result<AgentHealth, TransportError> {
            Err(TransportError::Timeout)
        }
    }

    #[async_trait]
    impl NodeProber for NullAgent {
        async fn probe(&self, _node: &node::Model) -> ProbeResult {
            ProbeResult::timed_out(Duration::from_secs(1))
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        sync: Arc<ConfigSync>,
        dispatcher: Arc<CommandDispatcher>,
        handler: AgentHandler,
    }

    fn harness(bootstrap: Option<&str>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let agent = Arc::new(NullAgent);
        let auth = Arc::new(AuthGuard::new(store.clone(), &AuthSettings::default()).unwrap());
        let balancer = Arc::new(LoadBalancer::new(
            store.clone(),
            Arc::new(StaticGeoLocator::new()),
            BalancerSettings::default(),
        ));
        let registry = Arc::new(NodeRegistry::new(
            store.clone(),
            auth.clone(),
            balancer,
            Arc::new(LogNotifier),
        ));
        let health = Arc::new(HealthChecker::new(store.clone(), agent.clone(), HealthSettings::default()));
        let sync = Arc::new(ConfigSync::new(store.clone(), agent.clone(), SyncSettings::default()));
        let dispatcher = Arc::new(CommandDispatcher::new(
            store.clone(),
            agent,
            Duration::from_secs(5),
        ));
        let handler = AgentHandler::new(
            store.clone(),
            auth,
            registry,
            health,
            sync.clone(),
            dispatcher.clone(),
            bootstrap.map(str::to_string),
            8443,
        );
        Harness {
            store,
            sync,
            dispatcher,
            handler,
        }
    }

    fn ip() -> IpAddr {
        "203.0.113.7".parse().unwrap()
    }

    fn register_request(token: &str) -> RegisterRequest {
        RegisterRequest {
            token: token.to_string(),
            name: Some("edge-1".into()),
            address: None,
            agent_port: None,
            region: Some("eu".into()),
            tags: vec![],
            latitude: None,
            longitude: None,
            max_users: Some(100),
        }
    }

    fn config() -> ProxyConfig {
        ProxyConfig {
            inbounds: vec![Inbound {
                tag: "in".into(),
                protocol: "trojan".into(),
                port: 443,
                listen: None,
                settings: serde_json::Value::Null,
            }],
            outbounds: vec![],
        }
    }

    #[tokio::test]
    async fn test_bootstrap_registration_creates_offline_node() {
        let h = harness(Some("join-secret"));
        h.sync.sync_to_all(&config()).await.unwrap();

        let resp = h.handler.register(register_request("join-secret"), ip()).await.unwrap();
        assert!(resp.accepted);
        let token = resp.node_token.clone().unwrap();
        assert_eq!(token.len(), 64);
        assert_eq!(resp.initial_config, Some(config()));

        let node = h.store.get_node(resp.node_id).await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Offline);
        assert_eq!(node.address, "203.0.113.7");
        assert_eq!(node.agent_port, 8443);

        // The issued token re-registers without creating another node.
        let again = h.handler.register(register_request(&token), ip()).await.unwrap();
        assert_eq!(again.node_id, resp.node_id);
        assert!(again.node_token.is_none());
    }

    #[tokio::test]
    async fn test_registration_without_bootstrap_token_is_rejected() {
        let h = harness(None);
        assert!(matches!(
            h.handler.register(register_request("join-secret"), ip()).await,
            Err(ControlError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_brings_node_online_and_delivers_commands() {
        let h = harness(Some("join-secret"));
        let resp = h.handler.register(register_request("join-secret"), ip()).await.unwrap();
        let token = resp.node_token.unwrap();
        h.dispatcher.execute(resp.node_id, AgentCommand::Restart).await.unwrap();

        let reply = h
            .handler
            .heartbeat(
                HeartbeatRequest {
                    token: token.clone(),
                    metrics: AgentMetrics {
                        cpu: 12.5,
                        mem: 40.0,
                        bandwidth: 1024,
                        connections: 3,
                    },
                },
                ip(),
            )
            .await
            .unwrap();
        assert_eq!(
            reply,
            HeartbeatResponse::Command {
                commands: vec![AgentCommand::Restart]
            }
        );
        let node = h.store.get_node(resp.node_id).await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Online);
        assert!(node.last_seen_at.is_some());
        assert_eq!(h.handler.latest_metrics(resp.node_id).unwrap().metrics.connections, 3);

        let reply = h
            .handler
            .heartbeat(
                HeartbeatRequest {
                    token,
                    metrics: AgentMetrics::default(),
                },
                ip(),
            )
            .await
            .unwrap();
        assert_eq!(reply, HeartbeatResponse::Ack);
    }

    #[tokio::test]
    async fn test_report_metrics_stores_traffic() {
        let h = harness(Some("join-secret"));
        let resp = h.handler.register(register_request("join-secret"), ip()).await.unwrap();
        let ack = h
            .handler
            .report_metrics(
                ReportMetricsRequest {
                    token: resp.node_token.unwrap(),
                    metrics: AgentMetrics::default(),
                    traffic: vec![TrafficSample {
                        user_id: 7,
                        upload_bytes: 100,
                        download_bytes: 2000,
                    }],
                },
                ip(),
            )
            .await
            .unwrap();
        assert!(ack.ok);
        let rows = h.store.list_traffic(resp.node_id, Some(7), 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].download_bytes, 2000);
    }

    #[tokio::test]
    async fn test_bad_token_heartbeat_is_rejected() {
        let h = harness(None);
        assert!(matches!(
            h.handler
                .heartbeat(
                    HeartbeatRequest {
                        token: "nope".into(),
                        metrics: AgentMetrics::default(),
                    },
                    ip(),
                )
                .await,
            Err(ControlError::InvalidToken)
        ));
    }
}
