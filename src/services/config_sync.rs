//! Validated proxy configuration fan-out to node agents.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::agent_service::{AgentClient, SyncOutcome};
use crate::db::entities::node;
use crate::db::enums::{NodeStatus, SyncStatus};
use crate::db::models::{ConfigScope, NodeFilter};
use crate::db::{GroupRepository, NodeRepository, ProxyConfigRepository, Store};
use crate::error::{ControlError, ControlResult};
use crate::server::config::SyncSettings;

const SUPPORTED_PROTOCOLS: &[&str] = &["vmess", "vless", "trojan", "shadowsocks", "socks", "http"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inbound {
    pub tag: String,
    pub protocol: String,
    pub port: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
    #[serde(default)]
    pub settings: serde_json::Value,
}

/// Configuration blob pushed to a node's proxy process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub inbounds: Vec<Inbound>,
    #[serde(default)]
    pub outbounds: Vec<serde_json::Value>,
}

/// Rejects configs an agent could never apply. Runs before any node is contacted.
pub fn validate_config(config: &ProxyConfig) -> ControlResult<()> {
    if config.inbounds.is_empty() {
        return Err(ControlError::InvalidConfig(
            "at least one inbound is required".into(),
        ));
    }
    let mut tags = HashSet::new();
    let mut ports = HashSet::new();
    for inbound in &config.inbounds {
        if inbound.tag.trim().is_empty() {
            return Err(ControlError::InvalidConfig("inbound tag must not be empty".into()));
        }
        if !tags.insert(inbound.tag.as_str()) {
            return Err(ControlError::InvalidConfig(format!(
                "duplicate inbound tag '{}'",
                inbound.tag
            )));
        }
        if !(1..=65535).contains(&inbound.port) {
            return Err(ControlError::InvalidConfig(format!(
                "inbound '{}' has port {} outside 1-65535",
                inbound.tag, inbound.port
            )));
        }
        if !ports.insert((inbound.listen.as_deref(), inbound.port)) {
            return Err(ControlError::InvalidConfig(format!(
                "port {} is used by more than one inbound",
                inbound.port
            )));
        }
        if !SUPPORTED_PROTOCOLS.contains(&inbound.protocol.as_str()) {
            return Err(ControlError::InvalidConfig(format!(
                "inbound '{}' uses unsupported protocol '{}'",
                inbound.tag, inbound.protocol
            )));
        }
        if !(inbound.settings.is_null() || inbound.settings.is_object()) {
            return Err(ControlError::InvalidConfig(format!(
                "settings of inbound '{}' must be an object",
                inbound.tag
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    pub node_id: i32,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub synced: Vec<i32>,
    pub failed: Vec<SyncFailure>,
    /// Nodes that were not online; they receive the config once they are.
    pub pending: Vec<i32>,
}

fn to_json(config: &ProxyConfig) -> ControlResult<serde_json::Value> {
    serde_json::to_value(config).map_err(|e| ControlError::InvalidConfig(e.to_string()))
}

enum PushError {
    Rejected(String),
    Exhausted(String),
}

impl PushError {
    fn reason(&self) -> String {
        match self {
            PushError::Rejected(reason) => format!("rejected by agent: {reason}"),
            PushError::Exhausted(last) => last.clone(),
        }
    }
}

/// Config sources are persisted, so a restarted control plane still knows
/// what every node should run.
pub struct ConfigSync {
    store: Arc<dyn Store>,
    client: Arc<dyn AgentClient>,
    settings: SyncSettings,
}

impl ConfigSync {
    pub fn new(store: Arc<dyn Store>, client: Arc<dyn AgentClient>, settings: SyncSettings) -> Self {
        Self {
            store,
            client,
            settings,
        }
    }

    /// The config a node should be running: its own if one was pushed to it
    /// or its groups, otherwise the fleet-wide one.
    pub async fn config_for(&self, node_id: i32) -> ControlResult<Option<ProxyConfig>> {
        if let Some(config) = self.load(ConfigScope::Node(node_id)).await? {
            return Ok(Some(config));
        }
        self.load(ConfigScope::Global).await
    }

    pub async fn active_config(&self) -> ControlResult<Option<ProxyConfig>> {
        self.load(ConfigScope::Global).await
    }

    async fn load(&self, scope: ConfigScope) -> ControlResult<Option<ProxyConfig>> {
        let Some(value) = self.store.get_proxy_config(scope).await? else {
            return Ok(None);
        };
        serde_json::from_value(value).map(Some).map_err(|e| {
            ControlError::InvalidConfig(format!("stored config '{}' is unreadable: {e}", scope.key()))
        })
    }

    async fn save(&self, scope: ConfigScope, config: &ProxyConfig) -> ControlResult<()> {
        self.store.put_proxy_config(scope, to_json(config)?).await?;
        Ok(())
    }

    /// Pushes `config` to one node. A node that is not online is marked
    /// pending and gets the config when it comes back.
    pub async fn sync_to_node(&self, node_id: i32, config: &ProxyConfig) -> ControlResult<()> {
        validate_config(config)?;
        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or_else(|| ControlError::NotFound(format!("Node {node_id}")))?;
        self.save(ConfigScope::Node(node_id), config).await?;
        match node.status {
            NodeStatus::Online => {}
            NodeStatus::Offline => {
                self.mark_pending(node_id).await?;
                return Err(ControlError::NodeOffline(node_id));
            }
            NodeStatus::Unhealthy => {
                self.mark_pending(node_id).await?;
                return Err(ControlError::NodeUnhealthy(node_id));
            }
        }
        self.deliver(&node, config)
            .await
            .map_err(|reason| ControlError::SyncFailed { node_id, reason })
    }

    pub async fn sync_to_group(&self, group_id: i32, config: &ProxyConfig) -> ControlResult<SyncReport> {
        validate_config(config)?;
        if self.store.get_group(group_id).await?.is_none() {
            return Err(ControlError::NotFound(format!("Group {group_id}")));
        }
        let filter = NodeFilter {
            group_id: Some(group_id),
            ..Default::default()
        };
        let nodes = self.store.list_nodes(&filter).await?;
        for node in &nodes {
            self.save(ConfigScope::Node(node.id), config).await?;
        }
        info!(group_id, nodes = nodes.len(), "Syncing config to group.");
        self.fan_out(nodes, config).await
    }

    /// Makes `config` the fleet-wide config, replacing per-node overrides.
    pub async fn sync_to_all(&self, config: &ProxyConfig) -> ControlResult<SyncReport> {
        validate_config(config)?;
        self.store.replace_global_proxy_config(to_json(config)?).await?;
        let nodes = self.store.list_nodes(&NodeFilter::default()).await?;
        info!(nodes = nodes.len(), "Syncing config to all nodes.");
        self.fan_out(nodes, config).await
    }

    /// Re-sends the node's current config. Returns `false` when there is
    /// nothing to send yet.
    pub async fn resync_node(&self, node_id: i32) -> ControlResult<bool> {
        let Some(config) = self.config_for(node_id).await? else {
            return Ok(false);
        };
        self.sync_to_node(node_id, &config).await?;
        Ok(true)
    }

    async fn fan_out(&self, nodes: Vec<node::Model>, config: &ProxyConfig) -> ControlResult<SyncReport> {
        let mut report = SyncReport::default();
        let mut online = Vec::new();
        for node in nodes {
            if node.status == NodeStatus::Online {
                online.push(node);
            } else {
                self.mark_pending(node.id).await?;
                report.pending.push(node.id);
            }
        }

        let outcomes: Vec<(i32, Result<(), String>)> = stream::iter(online)
            .map(|node| async move { (node.id, self.deliver(&node, config).await) })
            .buffer_unordered(self.settings.max_concurrent.max(1))
            .collect()
            .await;

        for (node_id, outcome) in outcomes {
            match outcome {
                Ok(()) => report.synced.push(node_id),
                Err(reason) => report.failed.push(SyncFailure { node_id, reason }),
            }
        }
        report.synced.sort_unstable();
        report.failed.sort_by_key(|f| f.node_id);
        report.pending.sort_unstable();
        Ok(report)
    }

    async fn mark_pending(&self, node_id: i32) -> ControlResult<()> {
        self.store
            .set_sync_status(node_id, SyncStatus::Pending, None, Utc::now())
            .await?;
        Ok(())
    }

    /// One node's push with its status bookkeeping. Errors are returned as
    /// the reason recorded on the node.
    async fn deliver(&self, node: &node::Model, config: &ProxyConfig) -> Result<(), String> {
        let node_id = node.id;
        if let Err(e) = self.mark_pending(node_id).await {
            return Err(e.to_string());
        }
        match self.push(node, config).await {
            Ok(attempts) => {
                info!(node_id, attempts, "Config applied.");
                self.store
                    .set_sync_status(node_id, SyncStatus::Synced, None, Utc::now())
                    .await
                    .map_err(|e| e.to_string())
            }
            Err(e) => {
                let reason = e.reason();
                error!(node_id, reason = %reason, "Config sync failed.");
                if let Err(store_err) = self
                    .store
                    .set_sync_status(node_id, SyncStatus::Failed, Some(reason.clone()), Utc::now())
                    .await
                {
                    error!(node_id, error = %store_err, "Failed to record sync failure.");
                }
                Err(reason)
            }
        }
    }

    async fn push(&self, node: &node::Model, config: &ProxyConfig) -> Result<u32, PushError> {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            match tokio::time::timeout(self.settings.timeout(), self.client.sync_config(node, config)).await {
                Ok(Ok(SyncOutcome::Applied)) => return Ok(attempt),
                Ok(Ok(SyncOutcome::Rejected { reason })) => return Err(PushError::Rejected(reason)),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = "request timed out".to_string(),
            }
            if attempt < max_attempts {
                let delay = self.settings.backoff(attempt);
                warn!(
                    node_id = node.id,
                    attempt,
                    error = %last_error,
                    delay_ms = delay.as_millis() as u64,
                    "Config push failed; retrying."
                );
                tokio::time::sleep(delay).await;
            }
        }
        Err(PushError::Exhausted(format!(
            "gave up after {max_attempts} attempts: {last_error}"
        )))
    }
}
