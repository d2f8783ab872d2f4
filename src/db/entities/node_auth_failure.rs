use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Failed agent authentication attempts, keyed by source IP.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "node_auth_failures")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub ip: String,
    pub attempts: i32,
    pub window_started_at: ChronoDateTimeUtc,
    pub last_attempt_at: ChronoDateTimeUtc,
    pub blocked_until: Option<ChronoDateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn is_blocked_at(&self, now: ChronoDateTimeUtc) -> bool {
        self.blocked_until.is_some_and(|until| until > now)
    }
}
