//! Administrator notifications for conditions that need a human.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Webhook returned HTTP {0}")]
    Status(u16),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    FailoverIncomplete,
    RecoveryIncomplete,
    NodeDeleteBlocked,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminAlert {
    pub kind: AlertKind,
    pub node_id: i32,
    pub message: String,
    /// Users left on a node that should not be serving them.
    pub user_ids: Vec<i32>,
    pub raised_at: DateTime<Utc>,
}

impl AdminAlert {
    pub fn new(kind: AlertKind, node_id: i32, message: String, user_ids: Vec<i32>) -> Self {
        Self {
            kind,
            node_id,
            message,
            user_ids,
            raised_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait AdminNotifier: Send + Sync {
    async fn notify(&self, alert: &AdminAlert) -> Result<(), NotifyError>;
}

/// Writes alerts to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl AdminNotifier for LogNotifier {
    async fn notify(&self, alert: &AdminAlert) -> Result<(), NotifyError> {
        error!(
            kind = ?alert.kind,
            node_id = alert.node_id,
            users = ?alert.user_ids,
            "ADMIN ALERT: {}",
            alert.message
        );
        Ok(())
    }
}

/// Logs the alert, then POSTs it as JSON to a webhook.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self {
            client: Client::new(),
            url,
        }
    }
}

#[async_trait]
impl AdminNotifier for WebhookNotifier {
    async fn notify(&self, alert: &AdminAlert) -> Result<(), NotifyError> {
        LogNotifier.notify(alert).await?;
        let response = self.client.post(&self.url).json(alert).send().await?;
        if !response.status().is_success() {
            warn!(status = %response.status(), "Admin webhook rejected the alert.");
            return Err(NotifyError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}
