use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};

use crate::db::entities::health_check;
use crate::db::models::NewHealthCheck;

pub async fn insert_health_check<C: ConnectionTrait>(
    db: &C,
    check: NewHealthCheck,
) -> Result<health_check::Model, DbErr> {
    health_check::ActiveModel {
        node_id: Set(check.node_id),
        status: Set(check.status),
        latency_ms: Set(check.latency_ms),
        tcp_ok: Set(check.tcp_ok),
        api_ok: Set(check.api_ok),
        process_ok: Set(check.process_ok),
        message: Set(check.message),
        checked_at: Set(check.checked_at),
        ..Default::default()
    }
    .insert(db)
    .await
}

pub async fn get_recent_health_checks<C: ConnectionTrait>(
    db: &C,
    node_id: i32,
    limit: u64,
) -> Result<Vec<health_check::Model>, DbErr> {
    health_check::Entity::find()
        .filter(health_check::Column::NodeId.eq(node_id))
        .order_by_desc(health_check::Column::CheckedAt)
        .order_by_desc(health_check::Column::Id)
        .limit(limit)
        .all(db)
        .await
}
