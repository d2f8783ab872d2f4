//! Node probing and the per-node health state machine.
//!
//! `online -> unhealthy` after `failure_threshold` consecutive failed probes,
//! `unhealthy -> online` after `recovery_threshold` consecutive successes and
//! `offline -> online` after a single success (probe or heartbeat). `offline`
//! is otherwise entered only by an explicit signal: an agent going silent.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::agent_service::AgentClient;
use crate::db::entities::{health_check, node};
use crate::db::enums::{HealthCheckStatus, NodeStatus};
use crate::db::models::{NewHealthCheck, NodeFilter};
use crate::db::{HealthCheckRepository, NodeRepository, Store};
use crate::error::{ControlError, ControlResult};
use crate::server::config::HealthSettings;

const EVENT_CAPACITY: usize = 256;

/// A node status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthEvent {
    pub node_id: i32,
    pub from: NodeStatus,
    pub to: NodeStatus,
    pub at: DateTime<Utc>,
}

impl HealthEvent {
    pub fn went_down(&self) -> bool {
        self.from == NodeStatus::Online && self.to.is_down()
    }

    pub fn came_back(&self) -> bool {
        self.from.is_down() && self.to == NodeStatus::Online
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub tcp_ok: bool,
    pub api_ok: bool,
    pub process_ok: bool,
    pub latency_ms: Option<i32>,
    pub message: String,
}

impl ProbeResult {
    pub fn is_success(&self) -> bool {
        self.tcp_ok && self.api_ok && self.process_ok
    }

    pub fn timed_out(after: std::time::Duration) -> Self {
        Self {
            tcp_ok: false,
            api_ok: false,
            process_ok: false,
            latency_ms: None,
            message: format!("probe timed out after {}ms", after.as_millis()),
        }
    }
}

#[async_trait]
pub trait NodeProber: Send + Sync {
    async fn probe(&self, node: &node::Model) -> ProbeResult;
}

/// TCP reachability of the agent port, then the agent's own health report
/// (API responsiveness and proxy process liveness).
pub struct AgentProber {
    client: Arc<dyn AgentClient>,
    step_timeout: std::time::Duration,
}

impl AgentProber {
    pub fn new(client: Arc<dyn AgentClient>, step_timeout: std::time::Duration) -> Self {
        Self {
            client,
            step_timeout,
        }
    }
}

fn elapsed_ms(started: Instant) -> Option<i32> {
    Some(started.elapsed().as_millis().min(i32::MAX as u128) as i32)
}

#[async_trait]
impl NodeProber for AgentProber {
    async fn probe(&self, node: &node::Model) -> ProbeResult {
        let started = Instant::now();
        let port = u16::try_from(node.agent_port).unwrap_or(0);
        let connect = timeout(
            self.step_timeout,
            TcpStream::connect((node.address.as_str(), port)),
        )
        .await;
        match connect {
            Ok(Ok(_stream)) => {}
            Ok(Err(e)) => {
                return ProbeResult {
                    tcp_ok: false,
                    api_ok: false,
                    process_ok: false,
                    latency_ms: None,
                    message: format!("tcp connect failed: {e}"),
                }
            }
            Err(_) => return ProbeResult::timed_out(self.step_timeout),
        }

        match timeout(self.step_timeout, self.client.health_check(node)).await {
            Ok(Ok(health)) => ProbeResult {
                tcp_ok: true,
                api_ok: health.api_ok,
                process_ok: health.process_ok,
                latency_ms: elapsed_ms(started),
                message: if health.process_ok {
                    "ok".to_string()
                } else {
                    "proxy process is not running".to_string()
                },
            },
            Ok(Err(e)) => ProbeResult {
                tcp_ok: true,
                api_ok: false,
                process_ok: false,
                latency_ms: elapsed_ms(started),
                message: format!("agent api error: {e}"),
            },
            Err(_) => ProbeResult {
                tcp_ok: true,
                api_ok: false,
                process_ok: false,
                latency_ms: elapsed_ms(started),
                message: "agent api timed out".to_string(),
            },
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Streak {
    successes: u32,
    failures: u32,
}

fn next_status(current: NodeStatus, streak: Streak, settings: &HealthSettings) -> Option<NodeStatus> {
    match current {
        NodeStatus::Online if streak.failures >= settings.failure_threshold => {
            Some(NodeStatus::Unhealthy)
        }
        NodeStatus::Unhealthy if streak.successes >= settings.recovery_threshold => {
            Some(NodeStatus::Online)
        }
        NodeStatus::Offline if streak.successes >= 1 => Some(NodeStatus::Online),
        _ => None,
    }
}

pub struct HealthChecker {
    store: Arc<dyn Store>,
    prober: Arc<dyn NodeProber>,
    settings: HealthSettings,
    streaks: DashMap<i32, Streak>,
    in_flight: DashSet<i32>,
    last_heartbeat: DashMap<i32, Instant>,
    permits: Arc<Semaphore>,
    events: broadcast::Sender<HealthEvent>,
}

impl HealthChecker {
    pub fn new(store: Arc<dyn Store>, prober: Arc<dyn NodeProber>, settings: HealthSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            prober,
            permits: Arc::new(Semaphore::new(settings.max_concurrent_probes.max(1))),
            settings,
            streaks: DashMap::new(),
            in_flight: DashSet::new(),
            last_heartbeat: DashMap::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// Probes every node once per interval until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.settings.interval_secs, "Health check loop started.");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.probe_round().await {
                        error!(error = %e, "Failed to start health probe round.");
                    }
                }
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
        info!("Health check loop stopped.");
    }

    /// Marks nodes whose heartbeats stopped as offline, until shutdown.
    pub async fn run_heartbeat_watchdog(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = (self.settings.heartbeat_timeout() / 3).max(std::time::Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep_heartbeats().await,
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
    }

    /// Launches one independent probe task per node. Nodes whose previous
    /// probe is still running are skipped for this round.
    pub async fn probe_round(self: &Arc<Self>) -> ControlResult<usize> {
        let nodes = self.store.list_nodes(&NodeFilter::default()).await?;
        let mut launched = 0;
        for node in nodes {
            if !self.in_flight.insert(node.id) {
                debug!(node_id = node.id, "Previous probe still running; skipping.");
                continue;
            }
            launched += 1;
            let checker = Arc::clone(self);
            tokio::spawn(async move {
                let node_id = node.id;
                let permit = checker.permits.clone().acquire_owned().await;
                if permit.is_ok() {
                    let result = checker.run_probe(&node).await;
                    if let Err(e) = checker.apply_probe(node_id, result).await {
                        error!(node_id, error = %e, "Failed to record probe result.");
                    }
                }
                checker.in_flight.remove(&node_id);
            });
        }
        Ok(launched)
    }

    async fn run_probe(&self, node: &node::Model) -> ProbeResult {
        let limit = self.settings.probe_timeout();
        match timeout(limit, self.prober.probe(node)).await {
            Ok(result) => result,
            Err(_) => ProbeResult::timed_out(limit),
        }
    }

    /// Probes one node right now and returns the stored history row.
    pub async fn check_now(&self, node_id: i32) -> ControlResult<health_check::Model> {
        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or_else(|| ControlError::NotFound(format!("Node {node_id}")))?;
        let result = self.run_probe(&node).await;
        let (row, _) = self.apply_probe(node_id, result).await?;
        Ok(row)
    }

    /// Records the probe and advances the state machine.
    pub async fn apply_probe(
        &self,
        node_id: i32,
        result: ProbeResult,
    ) -> ControlResult<(health_check::Model, Option<HealthEvent>)> {
        let now = Utc::now();
        let success = result.is_success();
        let row = self
            .store
            .append_health_check(NewHealthCheck {
                node_id,
                status: if success {
                    HealthCheckStatus::Success
                } else {
                    HealthCheckStatus::Failed
                },
                latency_ms: result.latency_ms,
                tcp_ok: result.tcp_ok,
                api_ok: result.api_ok,
                process_ok: result.process_ok,
                message: result.message.clone(),
                checked_at: now,
            })
            .await?;
        // last_seen_at only moves when the node answered at all.
        self.store
            .record_node_probe(node_id, result.latency_ms, result.tcp_ok.then_some(now))
            .await?;

        let streak = {
            let mut entry = self.streaks.entry(node_id).or_default();
            if success {
                entry.successes = entry.successes.saturating_add(1);
                entry.failures = 0;
            } else {
                entry.failures = entry.failures.saturating_add(1);
                entry.successes = 0;
            }
            *entry
        };
        if !success {
            debug!(node_id, failures = streak.failures, message = %result.message, "Probe failed.");
        }

        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or_else(|| ControlError::NotFound(format!("Node {node_id}")))?;
        let event = match next_status(node.status, streak, &self.settings) {
            Some(to) => Some(self.transition(node_id, node.status, to).await?),
            None => None,
        };
        Ok((row, event))
    }

    async fn transition(
        &self,
        node_id: i32,
        from: NodeStatus,
        to: NodeStatus,
    ) -> ControlResult<HealthEvent> {
        self.store.set_node_status(node_id, to).await?;
        let event = HealthEvent {
            node_id,
            from,
            to,
            at: Utc::now(),
        };
        if to == NodeStatus::Online {
            info!(node_id, %from, %to, "Node status changed.");
        } else {
            warn!(node_id, %from, %to, "Node status changed.");
        }
        // No subscribers is fine.
        let _ = self.events.send(event);
        Ok(event)
    }

    /// Agent heartbeat: refreshes `last_seen_at` and brings an offline node online.
    pub async fn record_heartbeat(&self, node_id: i32) -> ControlResult<Option<HealthEvent>> {
        self.store.touch_node(node_id, Utc::now()).await?;
        self.last_heartbeat.insert(node_id, Instant::now());
        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or_else(|| ControlError::NotFound(format!("Node {node_id}")))?;
        if node.status == NodeStatus::Offline {
            self.streaks.insert(node_id, Streak::default());
            return Ok(Some(self.transition(node_id, NodeStatus::Offline, NodeStatus::Online).await?));
        }
        Ok(None)
    }

    /// Explicit external signal that the node's agent is gone.
    pub async fn mark_offline(&self, node_id: i32, reason: &str) -> ControlResult<Option<HealthEvent>> {
        self.last_heartbeat.remove(&node_id);
        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or_else(|| ControlError::NotFound(format!("Node {node_id}")))?;
        if node.status == NodeStatus::Offline {
            return Ok(None);
        }
        self.streaks.insert(node_id, Streak::default());
        info!(node_id, reason, "Marking node offline.");
        Ok(Some(self.transition(node_id, node.status, NodeStatus::Offline).await?))
    }

    pub async fn sweep_heartbeats(&self) {
        let limit = self.settings.heartbeat_timeout();
        let silent: Vec<i32> = self
            .last_heartbeat
            .iter()
            .filter(|entry| entry.value().elapsed() > limit)
            .map(|entry| *entry.key())
            .collect();
        for node_id in silent {
            match self.mark_offline(node_id, "heartbeat timeout").await {
                Ok(_) => {}
                Err(ControlError::NotFound(_)) => {
                    self.last_heartbeat.remove(&node_id);
                }
                Err(e) => error!(node_id, error = %e, "Failed to mark silent node offline."),
            }
        }
    }

    /// Drops in-memory state for a deleted node.
    pub fn forget(&self, node_id: i32) {
        self.streaks.remove(&node_id);
        self.last_heartbeat.remove(&node_id);
    }

    pub async fn history(&self, node_id: i32, limit: u64) -> ControlResult<Vec<health_check::Model>> {
        if self.store.get_node(node_id).await?.is_none() {
            return Err(ControlError::NotFound(format!("Node {node_id}")));
        }
        Ok(self.store.recent_health_checks(node_id, limit).await?)
    }
}
