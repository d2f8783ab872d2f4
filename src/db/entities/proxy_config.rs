use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A stored config source: the fleet-wide row (`scope = "global"`) or one
/// node's override (`scope = "node:<id>"`).
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "proxy_configs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub scope: String,
    #[sea_orm(indexed)]
    pub node_id: Option<i32>,
    #[sea_orm(column_type = "JsonBinary")]
    pub config: Json,
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
