//! Request/response surface spoken with the node agents.
//!
//! Panel-initiated calls (`ExecuteCommand`, `SyncConfig`, `HealthCheck`) go
//! through [`AgentClient`]; agent-initiated calls (`Register`, `Heartbeat`,
//! `ReportMetrics`) arrive over the agent REST routes and use the message
//! types below.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::entities::node;
use crate::db::models::TrafficSample;
use crate::services::config_sync::ProxyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AgentCommand {
    Start,
    Stop,
    Restart,
    UpdateConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub success: bool,
    #[serde(default)]
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum SyncOutcome {
    Applied,
    Rejected { reason: String },
}

/// Agent-side view of its own health, as returned by `HealthCheck()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHealth {
    pub api_ok: bool,
    pub process_ok: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMetrics {
    pub cpu: f64,
    pub mem: f64,
    pub bandwidth: u64,
    pub connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    /// Either the bootstrap token (first registration) or the node's own token.
    pub token: String,
    pub name: Option<String>,
    pub address: Option<String>,
    pub agent_port: Option<i32>,
    pub region: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub max_users: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub accepted: bool,
    pub node_id: i32,
    /// Present only when a new node was created; it is not shown again.
    pub node_token: Option<String>,
    pub initial_config: Option<ProxyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub token: String,
    #[serde(default)]
    pub metrics: AgentMetrics,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HeartbeatResponse {
    Ack,
    Command { commands: Vec<AgentCommand> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportMetricsRequest {
    pub token: String,
    #[serde(default)]
    pub metrics: AgentMetrics,
    #[serde(default)]
    pub traffic: Vec<TrafficSample>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("agent returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid agent response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_decode() {
            TransportError::Decode(err.to_string())
        } else {
            TransportError::Connect(err.to_string())
        }
    }
}

/// Outbound calls from the panel to a node's agent.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn execute_command(
        &self,
        node: &node::Model,
        command: AgentCommand,
    ) -> Result<CommandResult, TransportError>;

    async fn sync_config(
        &self,
        node: &node::Model,
        config: &ProxyConfig,
    ) -> Result<SyncOutcome, TransportError>;

    async fn health_check(&self, node: &node::Model) -> Result<AgentHealth, TransportError>;
}

/// JSON-over-HTTPS agent client. Each request authenticates with the node's
/// own token as a bearer credential.
#[derive(Clone)]
pub struct HttpAgentClient {
    client: Client,
    scheme: String,
}

impl HttpAgentClient {
    pub fn new(scheme: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(Self {
            client,
            scheme: scheme.to_string(),
        })
    }

    fn url(&self, node: &node::Model, path: &str) -> String {
        agent_url(&self.scheme, &node.address, node.agent_port, path)
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, TransportError> {
        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<T>().await?)
    }
}

pub(crate) fn agent_url(scheme: &str, address: &str, port: i32, path: &str) -> String {
    match address.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => format!("{scheme}://[{v6}]:{port}{path}"),
        _ => format!("{scheme}://{address}:{port}{path}"),
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn execute_command(
        &self,
        node: &node::Model,
        command: AgentCommand,
    ) -> Result<CommandResult, TransportError> {
        let response = self
            .client
            .post(self.url(node, "/api/command"))
            .bearer_auth(&node.token)
            .json(&serde_json::json!({ "command": command }))
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn sync_config(
        &self,
        node: &node::Model,
        config: &ProxyConfig,
    ) -> Result<SyncOutcome, TransportError> {
        let response = self
            .client
            .post(self.url(node, "/api/config"))
            .bearer_auth(&node.token)
            .json(config)
            .send()
            .await?;
        // Agents answer 422 with a reason when they refuse a config.
        if response.status() == StatusCode::UNPROCESSABLE_ENTITY {
            let reason = response.text().await.unwrap_or_default();
            return Ok(SyncOutcome::Rejected { reason });
        }
        Self::read_json(response).await
    }

    async fn health_check(&self, node: &node::Model) -> Result<AgentHealth, TransportError> {
        let response = self
            .client
            .get(self.url(node, "/api/health"))
            .bearer_auth(&node.token)
            .send()
            .await?;
        Self::read_json(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_url_brackets_ipv6() {
        assert_eq!(
            agent_url("https", "2001:db8::1", 8443, "/api/health"),
            "https://[2001:db8::1]:8443/api/health"
        );
        assert_eq!(
            agent_url("http", "node-1.example.com", 9000, "/api/config"),
            "http://node-1.example.com:9000/api/config"
        );
    }

    #[test]
    fn test_heartbeat_response_wire_shape() {
        let ack = serde_json::to_value(HeartbeatResponse::Ack).unwrap();
        assert_eq!(ack, serde_json::json!({ "type": "ack" }));

        let cmd = serde_json::to_value(HeartbeatResponse::Command {
            commands: vec![AgentCommand::Restart, AgentCommand::UpdateConfig],
        })
        .unwrap();
        assert_eq!(
            cmd,
            serde_json::json!({ "type": "command", "commands": ["restart", "updateConfig"] })
        );
    }

    #[test]
    fn test_sync_outcome_parses_rejection() {
        let outcome: SyncOutcome =
            serde_json::from_str(r#"{"result":"rejected","reason":"bad inbound"}"#).unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Rejected {
                reason: "bad inbound".to_string()
            }
        );
    }
}
