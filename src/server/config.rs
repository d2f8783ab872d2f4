use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::db::enums::BalanceStrategy;
use crate::db::models::AuthFailurePolicy;

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct HealthSettings {
    pub interval_secs: u64,
    pub probe_timeout_secs: u64,
    /// Consecutive failed probes before `online -> unhealthy`.
    pub failure_threshold: u32,
    /// Consecutive successful probes before `unhealthy -> online`.
    pub recovery_threshold: u32,
    pub max_concurrent_probes: usize,
    pub heartbeat_timeout_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            probe_timeout_secs: 5,
            failure_threshold: 3,
            recovery_threshold: 2,
            max_concurrent_probes: 32,
            heartbeat_timeout_secs: 90,
        }
    }
}

impl HealthSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct BalancerSettings {
    pub default_strategy: BalanceStrategy,
    pub sticky: bool,
}

impl Default for BalancerSettings {
    fn default() -> Self {
        Self {
            default_strategy: BalanceStrategy::RoundRobin,
            sticky: true,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct FailoverSettings {
    pub max_concurrent: usize,
    pub recover_on_online: bool,
}

impl Default for FailoverSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            recover_on_online: false,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct SyncSettings {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub timeout_secs: u64,
    pub max_concurrent: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 500,
            timeout_secs: 15,
            max_concurrent: 16,
        }
    }
}

impl SyncSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct AuthSettings {
    pub max_failures: i32,
    pub window_secs: i64,
    pub block_secs: i64,
    /// Plain IPs or CIDR blocks; empty allows every source.
    pub ip_allow_list: Vec<String>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            max_failures: 5,
            window_secs: 300,
            block_secs: 900,
            ip_allow_list: Vec::new(),
        }
    }
}

impl AuthSettings {
    pub fn policy(&self) -> AuthFailurePolicy {
        AuthFailurePolicy {
            max_failures: self.max_failures.max(1),
            window: chrono::Duration::seconds(self.window_secs),
            block: chrono::Duration::seconds(self.block_secs),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// `None` runs against the in-memory store.
    pub database_url: Option<String>,
    pub log_dir: String,
    pub admin_api_key: String,
    pub bootstrap_token: Option<String>,
    pub agent_port_default: i32,
    pub agent_scheme: String,
    pub notification_webhook_url: Option<String>,
    pub health: HealthSettings,
    pub balancer: BalancerSettings,
    pub failover: FailoverSettings,
    pub sync: SyncSettings,
    pub auth: AuthSettings,
}

// File layer: top-level keys optional, sections filled field-by-field from defaults.
#[derive(Deserialize, Default, Debug)]
#[serde(default)]
struct FileServerConfig {
    listen_addr: Option<String>,
    database_url: Option<String>,
    log_dir: Option<String>,
    admin_api_key: Option<String>,
    bootstrap_token: Option<String>,
    agent_port_default: Option<i32>,
    agent_scheme: Option<String>,
    notification_webhook_url: Option<String>,
    health: HealthSettings,
    balancer: BalancerSettings,
    failover: FailoverSettings,
    sync: SyncSettings,
    auth: AuthSettings,
}

// Environment layer: `FLEETCTL_<KEY>`, section keys flattened as `<SECTION>_<KEY>`.
#[derive(Deserialize, Default, Debug)]
struct EnvServerConfig {
    listen_addr: Option<String>,
    database_url: Option<String>,
    log_dir: Option<String>,
    admin_api_key: Option<String>,
    bootstrap_token: Option<String>,
    agent_port_default: Option<i32>,
    agent_scheme: Option<String>,
    notification_webhook_url: Option<String>,
    health_interval_secs: Option<u64>,
    health_probe_timeout_secs: Option<u64>,
    health_failure_threshold: Option<u32>,
    health_recovery_threshold: Option<u32>,
    health_max_concurrent_probes: Option<usize>,
    health_heartbeat_timeout_secs: Option<u64>,
    balancer_default_strategy: Option<BalanceStrategy>,
    balancer_sticky: Option<bool>,
    failover_max_concurrent: Option<usize>,
    failover_recover_on_online: Option<bool>,
    sync_max_attempts: Option<u32>,
    sync_backoff_base_ms: Option<u64>,
    sync_timeout_secs: Option<u64>,
    sync_max_concurrent: Option<usize>,
    auth_max_failures: Option<i32>,
    auth_window_secs: Option<i64>,
    auth_block_secs: Option<i64>,
    auth_ip_allow_list: Option<Vec<String>>,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_agent_scheme() -> String {
    "https".to_string()
}

const DEFAULT_AGENT_PORT: i32 = 8443;

fn override_with<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

impl ServerConfig {
    /// Defaults for every setting except the admin key.
    pub fn new(admin_api_key: impl Into<String>) -> Self {
        Self {
            listen_addr: default_listen_addr(),
            database_url: None,
            log_dir: default_log_dir(),
            admin_api_key: admin_api_key.into(),
            bootstrap_token: None,
            agent_port_default: DEFAULT_AGENT_PORT,
            agent_scheme: default_agent_scheme(),
            notification_webhook_url: None,
            health: HealthSettings::default(),
            balancer: BalancerSettings::default(),
            failover: FailoverSettings::default(),
            sync: SyncSettings::default(),
            auth: AuthSettings::default(),
        }
    }

    pub fn load(config_path: Option<&str>) -> Result<Self, String> {
        dotenv::dotenv().ok();

        // 1. Load from file (optional)
        let file_config: FileServerConfig = match config_path {
            Some(path_str) if Path::new(path_str).exists() => {
                let path = Path::new(path_str);
                let contents = fs::read_to_string(path)
                    .map_err(|e| format!("Failed to read config file at {path:?}: {e}"))?;
                toml::from_str(&contents).map_err(|e| {
                    format!("Failed to parse TOML from config file at {path:?}: {e}")
                })?
            }
            _ => FileServerConfig::default(),
        };

        // 2. Load from environment variables
        let env_config: EnvServerConfig = envy::prefixed("FLEETCTL_")
            .from_env::<EnvServerConfig>()
            .map_err(|e| format!("Failed to load config from environment: {e}"))?;

        // 3. Merge: environment overrides file
        let mut config = ServerConfig {
            listen_addr: env_config
                .listen_addr
                .or(file_config.listen_addr)
                .unwrap_or_else(default_listen_addr),
            database_url: env_config.database_url.or(file_config.database_url),
            log_dir: env_config
                .log_dir
                .or(file_config.log_dir)
                .unwrap_or_else(default_log_dir),
            admin_api_key: env_config
                .admin_api_key
                .or(file_config.admin_api_key)
                .ok_or("FLEETCTL_ADMIN_API_KEY is required")?,
            bootstrap_token: env_config.bootstrap_token.or(file_config.bootstrap_token),
            agent_port_default: env_config
                .agent_port_default
                .or(file_config.agent_port_default)
                .unwrap_or(DEFAULT_AGENT_PORT),
            agent_scheme: env_config
                .agent_scheme
                .or(file_config.agent_scheme)
                .unwrap_or_else(default_agent_scheme),
            notification_webhook_url: env_config
                .notification_webhook_url
                .or(file_config.notification_webhook_url),
            health: file_config.health,
            balancer: file_config.balancer,
            failover: file_config.failover,
            sync: file_config.sync,
            auth: file_config.auth,
        };

        override_with(&mut config.health.interval_secs, env_config.health_interval_secs);
        override_with(&mut config.health.probe_timeout_secs, env_config.health_probe_timeout_secs);
        override_with(&mut config.health.failure_threshold, env_config.health_failure_threshold);
        override_with(&mut config.health.recovery_threshold, env_config.health_recovery_threshold);
        override_with(
            &mut config.health.max_concurrent_probes,
            env_config.health_max_concurrent_probes,
        );
        override_with(
            &mut config.health.heartbeat_timeout_secs,
            env_config.health_heartbeat_timeout_secs,
        );
        override_with(&mut config.balancer.default_strategy, env_config.balancer_default_strategy);
        override_with(&mut config.balancer.sticky, env_config.balancer_sticky);
        override_with(&mut config.failover.max_concurrent, env_config.failover_max_concurrent);
        override_with(
            &mut config.failover.recover_on_online,
            env_config.failover_recover_on_online,
        );
        override_with(&mut config.sync.max_attempts, env_config.sync_max_attempts);
        override_with(&mut config.sync.backoff_base_ms, env_config.sync_backoff_base_ms);
        override_with(&mut config.sync.timeout_secs, env_config.sync_timeout_secs);
        override_with(&mut config.sync.max_concurrent, env_config.sync_max_concurrent);
        override_with(&mut config.auth.max_failures, env_config.auth_max_failures);
        override_with(&mut config.auth.window_secs, env_config.auth_window_secs);
        override_with(&mut config.auth.block_secs, env_config.auth_block_secs);
        override_with(&mut config.auth.ip_allow_list, env_config.auth_ip_allow_list);

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.admin_api_key.trim().is_empty() {
            return Err("admin_api_key must not be empty".to_string());
        }
        if self.health.failure_threshold == 0 || self.health.recovery_threshold == 0 {
            return Err("health thresholds must be at least 1".to_string());
        }
        if self.failover.max_concurrent == 0 || self.sync.max_concurrent == 0 {
            return Err("concurrency limits must be at least 1".to_string());
        }
        if self.health.max_concurrent_probes == 0 {
            return Err("health.max_concurrent_probes must be at least 1".to_string());
        }
        if self.sync.max_attempts == 0 {
            return Err("sync.max_attempts must be at least 1".to_string());
        }
        for entry in &self.auth.ip_allow_list {
            crate::services::auth_guard::parse_allow_entry(entry)
                .map_err(|e| format!("Invalid auth.ip_allow_list entry: {e}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_sections_fill_missing_fields_from_defaults() {
        let parsed: FileServerConfig = toml::from_str(
            r#"
            admin_api_key = "secret"

            [health]
            failure_threshold = 4

            [balancer]
            default_strategy = "least-connections"

            [auth]
            ip_allow_list = ["10.0.0.0/8", "192.168.1.7"]
            "#,
        )
        .unwrap();
        assert_eq!(parsed.admin_api_key.as_deref(), Some("secret"));
        assert_eq!(parsed.health.failure_threshold, 4);
        assert_eq!(parsed.health.recovery_threshold, 2);
        assert_eq!(parsed.health.interval_secs, 30);
        assert_eq!(parsed.balancer.default_strategy, BalanceStrategy::LeastConnections);
        assert!(parsed.balancer.sticky);
        assert!(!parsed.failover.recover_on_online);
        assert_eq!(parsed.auth.ip_allow_list.len(), 2);
    }

    #[test]
    fn test_sync_backoff_doubles() {
        let sync = SyncSettings {
            backoff_base_ms: 100,
            ..Default::default()
        };
        assert_eq!(sync.backoff(1), Duration::from_millis(100));
        assert_eq!(sync.backoff(2), Duration::from_millis(200));
        assert_eq!(sync.backoff(3), Duration::from_millis(400));
    }
}
