use chrono::{DateTime, Utc};
use sea_orm::{
    ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};

use crate::db::entities::node_traffic;
use crate::db::models::TrafficSample;

/// Appends one row per sample; an empty batch is a no-op.
pub async fn insert_traffic_samples<C: ConnectionTrait>(
    db: &C,
    node_id: i32,
    samples: &[TrafficSample],
    recorded_at: DateTime<Utc>,
) -> Result<usize, DbErr> {
    if samples.is_empty() {
        return Ok(0);
    }
    let rows = samples.iter().map(|s| node_traffic::ActiveModel {
        node_id: Set(node_id),
        user_id: Set(s.user_id),
        upload_bytes: Set(s.upload_bytes),
        download_bytes: Set(s.download_bytes),
        recorded_at: Set(recorded_at),
        ..Default::default()
    });
    node_traffic::Entity::insert_many(rows).exec(db).await?;
    Ok(samples.len())
}

pub async fn get_node_traffic<C: ConnectionTrait>(
    db: &C,
    node_id: i32,
    user_id: Option<i32>,
    limit: u64,
) -> Result<Vec<node_traffic::Model>, DbErr> {
    let mut query = node_traffic::Entity::find().filter(node_traffic::Column::NodeId.eq(node_id));
    if let Some(user_id) = user_id {
        query = query.filter(node_traffic::Column::UserId.eq(user_id));
    }
    query
        .order_by_desc(node_traffic::Column::RecordedAt)
        .order_by_desc(node_traffic::Column::Id)
        .limit(limit)
        .all(db)
        .await
}
