use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

use crate::agent_service::{AgentClient, AgentCommand, CommandResult};
use crate::db::enums::NodeStatus;
use crate::db::{NodeRepository, Store};
use crate::error::{ControlError, ControlResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Executed { result: CommandResult },
    /// The node is not online; the command rides on its next heartbeat response.
    Queued { position: usize },
}

/// Sends agent commands directly to online nodes and parks them for the
/// others until they check in.
pub struct CommandDispatcher {
    store: Arc<dyn Store>,
    client: Arc<dyn AgentClient>,
    timeout: Duration,
    queues: DashMap<i32, VecDeque<AgentCommand>>,
}

impl CommandDispatcher {
    pub fn new(store: Arc<dyn Store>, client: Arc<dyn AgentClient>, timeout: Duration) -> Self {
        Self {
            store,
            client,
            timeout,
            queues: DashMap::new(),
        }
    }

    pub async fn execute(&self, node_id: i32, command: AgentCommand) -> ControlResult<DispatchOutcome> {
        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or_else(|| ControlError::NotFound(format!("Node {node_id}")))?;

        if node.status != NodeStatus::Online {
            let position = {
                let mut queue = self.queues.entry(node_id).or_default();
                queue.push_back(command);
                queue.len()
            };
            info!(node_id, ?command, position, status = %node.status, "Queued command for node.");
            return Ok(DispatchOutcome::Queued { position });
        }

        let result = tokio::time::timeout(self.timeout, self.client.execute_command(&node, command))
            .await
            .map_err(|_| ControlError::Transport(format!("command to node {node_id} timed out")))?
            .map_err(|e| ControlError::Transport(e.to_string()))?;
        if result.success {
            info!(node_id, ?command, "Command executed.");
        } else {
            warn!(node_id, ?command, output = %result.output, "Agent reported command failure.");
        }
        Ok(DispatchOutcome::Executed { result })
    }

    /// Removes and returns every queued command for the node, oldest first.
    pub fn drain(&self, node_id: i32) -> Vec<AgentCommand> {
        self.queues
            .remove(&node_id)
            .map(|(_, queue)| queue.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn pending(&self, node_id: i32) -> Vec<AgentCommand> {
        self.queues
            .get(&node_id)
            .map(|queue| queue.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn forget(&self, node_id: i32) {
        self.queues.remove(&node_id);
    }
}
