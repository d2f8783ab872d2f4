use chrono::{DateTime, Utc};
use sea_orm::{
    prelude::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr,
    EntityTrait, IntoActiveModel, PaginatorTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use serde_json::json;

use crate::db::entities::{node, node_group_member, user_node_assignment};
use crate::db::enums::{NodeStatus, SyncStatus};
use crate::db::models::{NewNode, NodeFilter, NodeUpdate};
use crate::db::repository::StoreError;
use crate::db::services::{conflict_on_unique, flatten_txn, group_service, proxy_config_service};

/// Inserts a node in the `offline` state with a pending config sync.
pub async fn create_node<C: ConnectionTrait>(
    db: &C,
    new: NewNode,
    token: String,
) -> Result<node::Model, StoreError> {
    let now = Utc::now();
    node::ActiveModel {
        name: Set(new.name),
        address: Set(new.address),
        agent_port: Set(new.agent_port),
        token: Set(token),
        token_revoked: Set(false),
        status: Set(NodeStatus::Offline),
        tags: Set(Some(json!(new.tags))),
        region: Set(new.region),
        latitude: Set(new.latitude),
        longitude: Set(new.longitude),
        weight: Set(new.weight),
        max_users: Set(new.max_users),
        current_users: Set(0),
        latency_ms: Set(None),
        last_seen_at: Set(None),
        sync_status: Set(SyncStatus::Pending),
        synced_at: Set(None),
        last_sync_error: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await
    .map_err(|e| conflict_on_unique(e, "node token already in use"))
}

pub async fn get_node_by_id<C: ConnectionTrait>(
    db: &C,
    node_id: i32,
) -> Result<Option<node::Model>, DbErr> {
    node::Entity::find_by_id(node_id).one(db).await
}

pub async fn get_node_by_token<C: ConnectionTrait>(
    db: &C,
    token: &str,
) -> Result<Option<node::Model>, DbErr> {
    node::Entity::find()
        .filter(node::Column::Token.eq(token))
        .one(db)
        .await
}

pub async fn list_nodes<C: ConnectionTrait>(
    db: &C,
    filter: &NodeFilter,
) -> Result<Vec<node::Model>, DbErr> {
    let mut query = node::Entity::find();
    if let Some(status) = filter.status {
        query = query.filter(node::Column::Status.eq(status));
    }
    if let Some(region) = &filter.region {
        query = query.filter(node::Column::Region.eq(region.as_str()));
    }
    if let Some(group_id) = filter.group_id {
        let ids = group_service::list_group_node_ids(db, group_id).await?;
        query = query.filter(node::Column::Id.is_in(ids));
    }
    let mut nodes = query.order_by_asc(node::Column::Id).all(db).await?;
    // Tags are a JSON array; filter after load to stay backend-agnostic.
    if let Some(tag) = &filter.tag {
        nodes.retain(|n| n.tag_list().iter().any(|t| t == tag));
    }
    Ok(nodes)
}

/// Writes only the fields present in `update`. A new nonzero `max_users`
/// is applied by a guarded UPDATE so it can never drop below the node's
/// `current_users`, even against a concurrent slot claim.
pub async fn update_node(
    db: &DatabaseConnection,
    node_id: i32,
    update: NodeUpdate,
) -> Result<node::Model, StoreError> {
    db.transaction::<_, node::Model, StoreError>(|txn| {
        Box::pin(async move {
            if let Some(max_users) = update.max_users {
                set_max_users(txn, node_id, max_users).await?;
            }
            let model = node::Entity::find_by_id(node_id)
                .one(txn)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("Node {node_id}")))?;
            let mut active_model = model.into_active_model();
            if let Some(v) = update.name {
                active_model.name = Set(v);
            }
            if let Some(v) = update.address {
                active_model.address = Set(v);
            }
            if let Some(v) = update.agent_port {
                active_model.agent_port = Set(v);
            }
            if let Some(v) = update.tags {
                active_model.tags = Set(Some(json!(v)));
            }
            if let Some(v) = update.region {
                active_model.region = Set(v);
            }
            if let Some(v) = update.latitude {
                active_model.latitude = Set(v);
            }
            if let Some(v) = update.longitude {
                active_model.longitude = Set(v);
            }
            if let Some(v) = update.weight {
                active_model.weight = Set(v);
            }
            active_model.updated_at = Set(Utc::now());
            Ok(active_model.update(txn).await?)
        })
    })
    .await
    .map_err(flatten_txn)
}

async fn set_max_users<C: ConnectionTrait>(
    db: &C,
    node_id: i32,
    max_users: i32,
) -> Result<(), StoreError> {
    let mut query = node::Entity::update_many()
        .col_expr(node::Column::MaxUsers, Expr::value(max_users))
        .filter(node::Column::Id.eq(node_id));
    if max_users > 0 {
        query = query.filter(node::Column::CurrentUsers.lte(max_users));
    }
    let result = query.exec(db).await?;
    if result.rows_affected == 0 {
        let node = node::Entity::find_by_id(node_id)
            .one(db)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("Node {node_id}")))?;
        return Err(StoreError::Conflict(format!(
            "node {node_id} has {} users, more than max_users {max_users}",
            node.current_users
        )));
    }
    Ok(())
}

/// Deletes the node, its memberships and its config override, refusing while
/// users are assigned.
pub async fn delete_node(db: &DatabaseConnection, node_id: i32) -> Result<(), StoreError> {
    db.transaction::<_, (), StoreError>(|txn| {
        Box::pin(async move {
            let assigned = user_node_assignment::Entity::find()
                .filter(user_node_assignment::Column::NodeId.eq(node_id))
                .count(txn)
                .await?;
            if assigned > 0 {
                return Err(StoreError::Conflict(format!(
                    "node {node_id} still has {assigned} assigned users"
                )));
            }
            node_group_member::Entity::delete_many()
                .filter(node_group_member::Column::NodeId.eq(node_id))
                .exec(txn)
                .await?;
            proxy_config_service::delete_node_proxy_config(txn, node_id).await?;
            let result = node::Entity::delete_by_id(node_id).exec(txn).await?;
            if result.rows_affected == 0 {
                return Err(StoreError::NotFound(format!("Node {node_id}")));
            }
            Ok(())
        })
    })
    .await
    .map_err(flatten_txn)
}

/// Swaps the token in one UPDATE, so the old value stops matching the moment
/// the new one starts to.
pub async fn replace_node_token<C: ConnectionTrait>(
    db: &C,
    node_id: i32,
    token: String,
) -> Result<(), StoreError> {
    let result = node::Entity::update_many()
        .col_expr(node::Column::Token, Expr::value(token))
        .col_expr(node::Column::TokenRevoked, Expr::value(false))
        .col_expr(node::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(node::Column::Id.eq(node_id))
        .exec(db)
        .await
        .map_err(|e| conflict_on_unique(e, "node token already in use"))?;
    if result.rows_affected == 0 {
        return Err(StoreError::NotFound(format!("Node {node_id}")));
    }
    Ok(())
}

pub async fn revoke_node_token<C: ConnectionTrait>(
    db: &C,
    node_id: i32,
) -> Result<(), StoreError> {
    let result = node::Entity::update_many()
        .col_expr(node::Column::TokenRevoked, Expr::value(true))
        .col_expr(node::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(node::Column::Id.eq(node_id))
        .exec(db)
        .await?;
    if result.rows_affected == 0 {
        return Err(StoreError::NotFound(format!("Node {node_id}")));
    }
    Ok(())
}

pub async fn update_node_status<C: ConnectionTrait>(
    db: &C,
    node_id: i32,
    status: NodeStatus,
) -> Result<(), StoreError> {
    let result = node::Entity::update_many()
        .col_expr(node::Column::Status, Expr::value(status))
        .col_expr(node::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(node::Column::Id.eq(node_id))
        .exec(db)
        .await?;
    if result.rows_affected == 0 {
        return Err(StoreError::NotFound(format!("Node {node_id}")));
    }
    Ok(())
}

/// Touches only `latency_ms` (and `last_seen_at` when given) so a concurrent
/// `current_users` write from the balancer is never overwritten.
pub async fn record_node_probe<C: ConnectionTrait>(
    db: &C,
    node_id: i32,
    latency_ms: Option<i32>,
    seen_at: Option<DateTime<Utc>>,
) -> Result<(), StoreError> {
    let mut update = node::Entity::update_many()
        .col_expr(node::Column::LatencyMs, Expr::value(latency_ms));
    if let Some(seen_at) = seen_at {
        update = update.col_expr(node::Column::LastSeenAt, Expr::value(seen_at));
    }
    let result = update
        .filter(node::Column::Id.eq(node_id))
        .exec(db)
        .await?;
    if result.rows_affected == 0 {
        return Err(StoreError::NotFound(format!("Node {node_id}")));
    }
    Ok(())
}

pub async fn touch_node<C: ConnectionTrait>(
    db: &C,
    node_id: i32,
    seen_at: DateTime<Utc>,
) -> Result<(), StoreError> {
    let result = node::Entity::update_many()
        .col_expr(node::Column::LastSeenAt, Expr::value(seen_at))
        .filter(node::Column::Id.eq(node_id))
        .exec(db)
        .await?;
    if result.rows_affected == 0 {
        return Err(StoreError::NotFound(format!("Node {node_id}")));
    }
    Ok(())
}

pub async fn update_sync_status<C: ConnectionTrait>(
    db: &C,
    node_id: i32,
    status: SyncStatus,
    error: Option<String>,
    at: DateTime<Utc>,
) -> Result<(), StoreError> {
    let mut update = node::Entity::update_many()
        .col_expr(node::Column::SyncStatus, Expr::value(status))
        .col_expr(node::Column::LastSyncError, Expr::value(error));
    if status == SyncStatus::Synced {
        update = update.col_expr(node::Column::SyncedAt, Expr::value(at));
    }
    let result = update
        .filter(node::Column::Id.eq(node_id))
        .exec(db)
        .await?;
    if result.rows_affected == 0 {
        return Err(StoreError::NotFound(format!("Node {node_id}")));
    }
    Ok(())
}
