use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::db::enums::{NodeStatus, SyncStatus};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "nodes")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub name: String,
    pub address: String,
    pub agent_port: i32,
    #[sea_orm(unique)]
    #[serde(skip_serializing, default)]
    pub token: String,
    pub token_revoked: bool,
    #[sea_orm(indexed)]
    pub status: NodeStatus,
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub tags: Option<Json>,
    #[sea_orm(indexed)]
    pub region: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub weight: i32,
    pub max_users: i32,
    pub current_users: i32,
    pub latency_ms: Option<i32>,
    pub last_seen_at: Option<ChronoDateTimeUtc>,
    pub sync_status: SyncStatus,
    pub synced_at: Option<ChronoDateTimeUtc>,
    pub last_sync_error: Option<String>,
    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::health_check::Entity")]
    HealthCheck,
    #[sea_orm(has_many = "super::user_node_assignment::Entity")]
    UserNodeAssignment,
    #[sea_orm(has_many = "super::node_traffic::Entity")]
    NodeTraffic,
}

impl Related<super::health_check::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::HealthCheck.def()
    }
}

impl Related<super::user_node_assignment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::UserNodeAssignment.def()
    }
}

impl Related<super::node_traffic::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::NodeTraffic.def()
    }
}

// Many-to-many through node_group_members
impl Related<super::node_group::Entity> for Entity {
    fn to() -> RelationDef {
        super::node_group_member::Relation::NodeGroup.def()
    }
    fn via() -> Option<RelationDef> {
        Some(super::node_group_member::Relation::Node.def().rev())
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn tag_list(&self) -> Vec<String> {
        match &self.tags {
            Some(Json::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == NodeStatus::Online
    }

    /// `max_users == 0` means unlimited.
    pub fn is_full(&self) -> bool {
        self.max_users > 0 && self.current_users >= self.max_users
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        self.latitude.zip(self.longitude)
    }
}
