//! Plain input and filter types passed into the repository layer.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::db::enums::{BalanceStrategy, HealthCheckStatus, NodeStatus};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NewNode {
    pub name: String,
    pub address: String,
    pub agent_port: i32,
    #[serde(default)]
    pub tags: Vec<String>,
    pub region: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(default = "default_weight")]
    pub weight: i32,
    #[serde(default)]
    pub max_users: i32,
}

fn default_weight() -> i32 {
    1
}

/// Partial update of admin-editable node fields. `None` leaves a field
/// unchanged; for the nullable fields `Some(None)` (JSON `null`) clears it.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NodeUpdate {
    pub name: Option<String>,
    pub address: Option<String>,
    pub agent_port: Option<i32>,
    pub tags: Option<Vec<String>>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub region: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub latitude: Option<Option<f64>>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub longitude: Option<Option<f64>>,
    pub weight: Option<i32>,
    pub max_users: Option<i32>,
}

/// Tells an explicit `null` apart from a missing field.
fn nullable<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NodeFilter {
    pub status: Option<NodeStatus>,
    pub region: Option<String>,
    pub tag: Option<String>,
    pub group_id: Option<i32>,
}

impl NodeFilter {
    pub fn online() -> Self {
        Self {
            status: Some(NodeStatus::Online),
            ..Default::default()
        }
    }

    pub fn online_in_group(group_id: Option<i32>) -> Self {
        Self {
            status: Some(NodeStatus::Online),
            group_id,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NewNodeGroup {
    pub name: String,
    pub region: Option<String>,
    #[serde(default)]
    pub strategy: BalanceStrategy,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NodeGroupUpdate {
    pub name: Option<String>,
    pub region: Option<String>,
    pub strategy: Option<BalanceStrategy>,
}

#[derive(Debug, Clone)]
pub struct NewHealthCheck {
    pub node_id: i32,
    pub status: HealthCheckStatus,
    pub latency_ms: Option<i32>,
    pub tcp_ok: bool,
    pub api_ok: bool,
    pub process_ok: bool,
    pub message: String,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct TrafficSample {
    pub user_id: i32,
    pub upload_bytes: i64,
    pub download_bytes: i64,
}

/// Thresholds applied when recording a failed agent authentication.
#[derive(Debug, Clone, Copy)]
pub struct AuthFailurePolicy {
    pub max_failures: i32,
    pub window: Duration,
    pub block: Duration,
}

/// Which stored proxy config a read or write refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigScope {
    Global,
    Node(i32),
}

impl ConfigScope {
    pub fn key(self) -> String {
        match self {
            ConfigScope::Global => "global".to_string(),
            ConfigScope::Node(node_id) => format!("node:{node_id}"),
        }
    }

    pub fn node_id(self) -> Option<i32> {
        match self {
            ConfigScope::Global => None,
            ConfigScope::Node(node_id) => Some(node_id),
        }
    }
}

/// How a user's assignment is being moved between nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationKind {
    /// Failover away from a failed node; the first failed node is remembered.
    Failover,
    /// Return to the remembered original node; the memory is cleared.
    Recovery,
    /// Administrative move (delete saga, rebalance); the memory is cleared.
    Administrative,
}
