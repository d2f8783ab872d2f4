pub mod agent_routes;
pub mod group_routes;
pub mod node_routes;
pub mod sync_routes;
pub mod user_routes;
