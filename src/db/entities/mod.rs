//! SeaORM entities, one module per table.

pub mod health_check;
pub mod node;
pub mod node_auth_failure;
pub mod node_group;
pub mod node_group_member;
pub mod node_traffic;
pub mod proxy_config;
pub mod user_node_assignment;

pub mod prelude {
    pub use super::health_check::Entity as HealthCheck;
    pub use super::health_check::Model as HealthCheckModel;

    pub use super::node::Entity as Node;
    pub use super::node::Model as NodeModel;
    pub use super::node::ActiveModel as NodeActiveModel;
    pub use super::node::Column as NodeColumn;

    pub use super::node_auth_failure::Entity as NodeAuthFailure;
    pub use super::node_auth_failure::Model as NodeAuthFailureModel;

    pub use super::node_group::Entity as NodeGroup;
    pub use super::node_group::Model as NodeGroupModel;

    pub use super::node_group_member::Entity as NodeGroupMember;

    pub use super::node_traffic::Entity as NodeTraffic;
    pub use super::node_traffic::Model as NodeTrafficModel;

    pub use super::proxy_config::Entity as ProxyConfig;
    pub use super::proxy_config::Model as ProxyConfigModel;

    pub use super::user_node_assignment::Entity as UserNodeAssignment;
    pub use super::user_node_assignment::Model as UserNodeAssignmentModel;
}
