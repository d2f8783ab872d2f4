pub mod auth_guard;
pub mod config_sync;
pub mod failover;
pub mod geo;
pub mod health_checker;
pub mod load_balancer;
pub mod node_registry;

#[cfg(test)]
pub(crate) mod test_support;
