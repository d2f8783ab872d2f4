//! Control plane for a fleet of proxy nodes: agent credentials, health
//! probing, user placement, failover and config distribution.

pub mod agent_service;
pub mod db;
pub mod error;
pub mod notifications;
pub mod server;
pub mod services;
pub mod version;
pub mod web;

pub use error::{ControlError, ControlResult};
