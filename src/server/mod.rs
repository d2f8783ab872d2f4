pub mod agent_handler;
pub mod command_dispatcher;
pub mod config;
pub mod control_plane;
