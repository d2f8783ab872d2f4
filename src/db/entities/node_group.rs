use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::db::enums::BalanceStrategy;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "node_groups")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(unique)]
    pub name: String,
    pub region: Option<String>,
    pub strategy: BalanceStrategy,
    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl Related<super::node::Entity> for Entity {
    fn to() -> RelationDef {
        super::node_group_member::Relation::Node.def()
    }
    fn via() -> Option<RelationDef> {
        Some(super::node_group_member::Relation::NodeGroup.def().rev())
    }
}

impl ActiveModelBehavior for ActiveModel {}
