//! Per-node credentials and agent authentication.
//!
//! Failed attempts are counted per source IP in a fixed window. Once
//! `max_failures` is reached inside the window the IP is blocked until
//! `blocked_until`, whatever token it presents. A successful authentication
//! never clears the counter; only window or block expiry does.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use ipnet::IpNet;
use rand::Rng;
use tracing::{info, warn};

use crate::db::entities::node;
use crate::db::models::AuthFailurePolicy;
use crate::db::{AuthFailureRepository, NodeRepository, Store, StoreError};
use crate::error::{ControlError, ControlResult};
use crate::server::config::AuthSettings;

const TOKEN_BYTES: usize = 32;
const MAX_TOKEN_ATTEMPTS: usize = 5;

/// Parses an allow-list entry: a CIDR block or a single address.
pub fn parse_allow_entry(entry: &str) -> Result<IpNet, String> {
    let entry = entry.trim();
    if let Ok(net) = entry.parse::<IpNet>() {
        return Ok(net.trunc());
    }
    let addr = entry
        .parse::<IpAddr>()
        .map_err(|_| format!("'{entry}' is neither an IP address nor a CIDR block"))?;
    let prefix = if addr.is_ipv4() { 32 } else { 128 };
    IpNet::new(addr, prefix).map_err(|e| e.to_string())
}

/// IPv4-mapped IPv6 sources are matched as their IPv4 form.
fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

/// Constant-time comparison for shared secrets.
pub fn tokens_match(presented: &str, expected: &str) -> bool {
    let (a, b) = (presented.as_bytes(), expected.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub struct AuthGuard {
    store: Arc<dyn Store>,
    policy: AuthFailurePolicy,
    allow_list: Vec<IpNet>,
}

impl AuthGuard {
    pub fn new(store: Arc<dyn Store>, settings: &AuthSettings) -> ControlResult<Self> {
        let allow_list = settings
            .ip_allow_list
            .iter()
            .map(|entry| parse_allow_entry(entry))
            .collect::<Result<Vec<_>, _>>()
            .map_err(ControlError::InvalidConfig)?;
        Ok(Self {
            store,
            policy: settings.policy(),
            allow_list,
        })
    }

    /// 32 random bytes, hex encoded (64 characters).
    pub fn generate_token() -> String {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::rng().fill(&mut bytes[..]);
        hex::encode(bytes)
    }

    /// A token not held by any node at the time of the check. The store's
    /// unique index remains the final arbiter at write time.
    pub async fn new_unique_token(&self) -> ControlResult<String> {
        for _ in 0..MAX_TOKEN_ATTEMPTS {
            let token = Self::generate_token();
            if !self.store.token_exists(&token).await? {
                return Ok(token);
            }
        }
        Err(ControlError::Conflict(
            "could not generate a unique node token".to_string(),
        ))
    }

    async fn install_token(&self, node_id: i32) -> ControlResult<String> {
        if self.store.get_node(node_id).await?.is_none() {
            return Err(ControlError::NotFound(format!("Node {node_id}")));
        }
        for _ in 0..MAX_TOKEN_ATTEMPTS {
            let token = self.new_unique_token().await?;
            match self.store.replace_node_token(node_id, token.clone()).await {
                Ok(()) => return Ok(token),
                // Lost a race for this value; draw again.
                Err(StoreError::Conflict(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(ControlError::Conflict(
            "could not generate a unique node token".to_string(),
        ))
    }

    /// Gives the node a fresh active token, e.g. after a revoke.
    pub async fn issue_token(&self, node_id: i32) -> ControlResult<String> {
        let token = self.install_token(node_id).await?;
        info!(node_id, "Issued node token.");
        Ok(token)
    }

    /// Replaces the node's token in one write: the old value stops
    /// authenticating at the same instant the new one starts.
    pub async fn rotate_token(&self, node_id: i32) -> ControlResult<String> {
        let token = self.install_token(node_id).await?;
        info!(node_id, "Rotated node token.");
        Ok(token)
    }

    pub async fn revoke_token(&self, node_id: i32) -> ControlResult<()> {
        self.store.revoke_node_token(node_id).await?;
        info!(node_id, "Revoked node token.");
        Ok(())
    }

    /// Rejects blocked and non-allow-listed sources before any token is looked at.
    pub async fn check_source(&self, source_ip: IpAddr) -> ControlResult<()> {
        let ip = canonical_ip(source_ip);
        let key = ip.to_string();
        if let Some(record) = self.store.get_auth_failure(&key).await? {
            if record.is_blocked_at(Utc::now()) {
                warn!(ip = %key, blocked_until = ?record.blocked_until, "Rejected authentication from blocked IP.");
                return Err(ControlError::IpBlocked(key));
            }
        }
        if !self.allow_list.is_empty() && !self.allow_list.iter().any(|net| net.contains(&ip)) {
            self.record_failure(ip).await?;
            return Err(ControlError::IpNotAllowed(key));
        }
        Ok(())
    }

    pub async fn record_failure(&self, source_ip: IpAddr) -> ControlResult<()> {
        let key = canonical_ip(source_ip).to_string();
        let record = self
            .store
            .record_auth_failure(&key, Utc::now(), &self.policy)
            .await?;
        if record.blocked_until.is_some() {
            warn!(ip = %key, attempts = record.attempts, blocked_until = ?record.blocked_until, "IP blocked after repeated authentication failures.");
        } else {
            warn!(ip = %key, attempts = record.attempts, "Agent authentication failed.");
        }
        Ok(())
    }

    pub async fn authenticate(&self, token: &str, source_ip: IpAddr) -> ControlResult<node::Model> {
        self.check_source(source_ip).await?;
        if token.is_empty() {
            self.record_failure(source_ip).await?;
            return Err(ControlError::InvalidToken);
        }
        match self.store.find_node_by_token(token).await? {
            None => {
                self.record_failure(source_ip).await?;
                Err(ControlError::InvalidToken)
            }
            Some(node) if node.token_revoked => {
                self.record_failure(source_ip).await?;
                Err(ControlError::TokenRevoked)
            }
            Some(node) => Ok(node),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::NewNode;
    use crate::db::MemoryStore;
    use std::collections::HashSet;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn new_node(name: &str) -> NewNode {
        NewNode {
            name: name.to_string(),
            address: "10.1.1.1".to_string(),
            agent_port: 8443,
            tags: vec![],
            region: None,
            latitude: None,
            longitude: None,
            weight: 1,
            max_users: 0,
        }
    }

    async fn setup(settings: AuthSettings) -> (Arc<MemoryStore>, AuthGuard, node::Model) {
        let store = Arc::new(MemoryStore::new());
        let guard = AuthGuard::new(store.clone(), &settings).unwrap();
        let token = guard.new_unique_token().await.unwrap();
        let node = store.create_node(new_node("n1"), token).await.unwrap();
        (store, guard, node)
    }

    #[tokio::test]
    async fn test_tokens_are_long_and_distinct() {
        let (_store, guard, _node) = setup(AuthSettings::default()).await;
        let mut seen = HashSet::new();
        for _ in 0..200 {
            let token = guard.new_unique_token().await.unwrap();
            assert!(token.len() >= 32);
            assert!(seen.insert(token));
        }
    }

    #[tokio::test]
    async fn test_rotate_invalidates_old_token_immediately() {
        let (_store, guard, node) = setup(AuthSettings::default()).await;
        let source = ip("203.0.113.5");
        let old = node.token.clone();
        assert_eq!(guard.authenticate(&old, source).await.unwrap().id, node.id);

        let new = guard.rotate_token(node.id).await.unwrap();
        assert_ne!(old, new);
        assert!(matches!(
            guard.authenticate(&old, source).await,
            Err(ControlError::InvalidToken)
        ));
        assert_eq!(guard.authenticate(&new, source).await.unwrap().id, node.id);
    }

    #[tokio::test]
    async fn test_revoked_token_is_rejected_until_reissued() {
        let (_store, guard, node) = setup(AuthSettings::default()).await;
        let source = ip("203.0.113.6");
        guard.revoke_token(node.id).await.unwrap();
        assert!(matches!(
            guard.authenticate(&node.token, source).await,
            Err(ControlError::TokenRevoked)
        ));
        let fresh = guard.issue_token(node.id).await.unwrap();
        assert!(guard.authenticate(&fresh, source).await.is_ok());
    }

    #[tokio::test]
    async fn test_ip_blocked_after_threshold_even_with_valid_token() {
        let settings = AuthSettings {
            max_failures: 3,
            ..Default::default()
        };
        let (_store, guard, node) = setup(settings).await;
        let attacker = ip("198.51.100.9");
        for _ in 0..3 {
            assert!(matches!(
                guard.authenticate("wrong", attacker).await,
                Err(ControlError::InvalidToken)
            ));
        }
        assert!(matches!(
            guard.authenticate(&node.token, attacker).await,
            Err(ControlError::IpBlocked(_))
        ));
        // Other sources are unaffected.
        assert!(guard.authenticate(&node.token, ip("198.51.100.10")).await.is_ok());
    }

    #[tokio::test]
    async fn test_success_does_not_reset_failure_history() {
        let settings = AuthSettings {
            max_failures: 3,
            ..Default::default()
        };
        let (store, guard, node) = setup(settings).await;
        let source = ip("198.51.100.20");
        guard.authenticate("bad", source).await.unwrap_err();
        guard.authenticate("bad", source).await.unwrap_err();
        guard.authenticate(&node.token, source).await.unwrap();
        let record = store.get_auth_failure("198.51.100.20").await.unwrap().unwrap();
        assert_eq!(record.attempts, 2);

        guard.authenticate("bad", source).await.unwrap_err();
        assert!(matches!(
            guard.authenticate(&node.token, source).await,
            Err(ControlError::IpBlocked(_))
        ));
    }

    #[tokio::test]
    async fn test_allow_list_accepts_cidr_and_single_addresses() {
        let settings = AuthSettings {
            ip_allow_list: vec!["10.0.0.0/8".to_string(), "2001:db8::1".to_string()],
            ..Default::default()
        };
        let (_store, guard, node) = setup(settings).await;
        assert!(guard.authenticate(&node.token, ip("10.20.30.40")).await.is_ok());
        assert!(guard.authenticate(&node.token, ip("2001:db8::1")).await.is_ok());
        assert!(guard.authenticate(&node.token, ip("::ffff:10.9.9.9")).await.is_ok());
        assert!(matches!(
            guard.authenticate(&node.token, ip("192.0.2.1")).await,
            Err(ControlError::IpNotAllowed(_))
        ));
    }

    #[test]
    fn test_parse_allow_entry_rejects_garbage() {
        assert!(parse_allow_entry("not-an-ip").is_err());
        assert_eq!(
            parse_allow_entry("192.168.1.77/24").unwrap().to_string(),
            "192.168.1.0/24"
        );
    }

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("abc", "abc"));
        assert!(!tokens_match("abc", "abd"));
        assert!(!tokens_match("abc", "abcd"));
    }
}
