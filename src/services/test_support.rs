//! Fixtures shared by the service tests.

use std::sync::Arc;

use crate::db::entities::node;
use crate::db::enums::NodeStatus;
use crate::db::models::NewNode;
use crate::db::{MemoryStore, NodeRepository};

pub fn new_node(name: &str) -> NewNode {
    NewNode {
        name: name.to_string(),
        address: "10.0.0.1".to_string(),
        agent_port: 8443,
        tags: vec![],
        region: None,
        latitude: None,
        longitude: None,
        weight: 1,
        max_users: 0,
    }
}

pub async fn add_node(
    store: &Arc<MemoryStore>,
    name: &str,
    weight: i32,
    max_users: i32,
    status: NodeStatus,
) -> node::Model {
    let created = store
        .create_node(
            NewNode {
                weight,
                max_users,
                ..new_node(name)
            },
            format!("token-{name}-{}", uuid::Uuid::new_v4().simple()),
        )
        .await
        .unwrap();
    store.set_node_status(created.id, status).await.unwrap();
    store.get_node(created.id).await.unwrap().unwrap()
}

pub async fn online_node(
    store: &Arc<MemoryStore>,
    name: &str,
    weight: i32,
    max_users: i32,
) -> node::Model {
    add_node(store, name, weight, max_users, NodeStatus::Online).await
}
