use chrono::{DateTime, Utc};
use sea_orm::{
    prelude::Expr, ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait,
    DatabaseConnection, DbErr, EntityTrait, IntoActiveModel, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};

use crate::db::entities::{node, user_node_assignment};
use crate::db::models::MigrationKind;
use crate::db::repository::StoreError;
use crate::db::services::flatten_txn;

pub async fn get_assignment<C: ConnectionTrait>(
    db: &C,
    user_id: i32,
) -> Result<Option<user_node_assignment::Model>, DbErr> {
    user_node_assignment::Entity::find()
        .filter(user_node_assignment::Column::UserId.eq(user_id))
        .one(db)
        .await
}

pub async fn get_assignments_for_node<C: ConnectionTrait>(
    db: &C,
    node_id: i32,
) -> Result<Vec<user_node_assignment::Model>, DbErr> {
    user_node_assignment::Entity::find()
        .filter(user_node_assignment::Column::NodeId.eq(node_id))
        .order_by_asc(user_node_assignment::Column::UserId)
        .all(db)
        .await
}

pub async fn get_displaced_assignments<C: ConnectionTrait>(
    db: &C,
    original_node_id: i32,
) -> Result<Vec<user_node_assignment::Model>, DbErr> {
    user_node_assignment::Entity::find()
        .filter(user_node_assignment::Column::OriginalNodeId.eq(original_node_id))
        .order_by_asc(user_node_assignment::Column::UserId)
        .all(db)
        .await
}

/// Claims one slot on `node_id`. The `current_users < max_users` predicate is
/// evaluated by the UPDATE itself, so two racing claims cannot both pass.
async fn claim_slot<C: ConnectionTrait>(
    db: &C,
    node_id: i32,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let result = node::Entity::update_many()
        .col_expr(
            node::Column::CurrentUsers,
            Expr::col(node::Column::CurrentUsers).add(1),
        )
        .col_expr(node::Column::UpdatedAt, Expr::value(now))
        .filter(node::Column::Id.eq(node_id))
        .filter(
            Condition::any()
                .add(node::Column::MaxUsers.eq(0))
                .add(Expr::col(node::Column::CurrentUsers).lt(Expr::col(node::Column::MaxUsers))),
        )
        .exec(db)
        .await?;
    if result.rows_affected == 0 {
        if node::Entity::find_by_id(node_id).one(db).await?.is_none() {
            return Err(StoreError::NotFound(format!("Node {node_id}")));
        }
        return Err(StoreError::AtCapacity(node_id));
    }
    Ok(())
}

async fn release_slot<C: ConnectionTrait>(
    db: &C,
    node_id: i32,
    now: DateTime<Utc>,
) -> Result<(), DbErr> {
    node::Entity::update_many()
        .col_expr(
            node::Column::CurrentUsers,
            Expr::col(node::Column::CurrentUsers).sub(1),
        )
        .col_expr(node::Column::UpdatedAt, Expr::value(now))
        .filter(node::Column::Id.eq(node_id))
        .filter(node::Column::CurrentUsers.gt(0))
        .exec(db)
        .await?;
    Ok(())
}

async fn move_user<C: ConnectionTrait>(
    db: &C,
    existing: Option<user_node_assignment::Model>,
    user_id: i32,
    to: i32,
    original_node_id: Option<i32>,
) -> Result<user_node_assignment::Model, StoreError> {
    let now = Utc::now();
    if let Some(row) = existing.as_ref().filter(|row| row.node_id == to) {
        let mut active_model = row.clone().into_active_model();
        active_model.original_node_id = Set(original_node_id);
        active_model.updated_at = Set(now);
        return Ok(active_model.update(db).await?);
    }

    claim_slot(db, to, now).await?;

    match existing {
        Some(row) => {
            release_slot(db, row.node_id, now).await?;
            let mut active_model = row.into_active_model();
            active_model.node_id = Set(to);
            active_model.original_node_id = Set(original_node_id);
            active_model.updated_at = Set(now);
            Ok(active_model.update(db).await?)
        }
        None => Ok(user_node_assignment::ActiveModel {
            user_id: Set(user_id),
            node_id: Set(to),
            original_node_id: Set(original_node_id),
            assigned_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(db)
        .await?),
    }
}

pub async fn assign_user(
    db: &DatabaseConnection,
    user_id: i32,
    node_id: i32,
) -> Result<user_node_assignment::Model, StoreError> {
    db.transaction::<_, user_node_assignment::Model, StoreError>(|txn| {
        Box::pin(async move {
            let existing = get_assignment(txn, user_id).await?;
            move_user(txn, existing, user_id, node_id, None).await
        })
    })
    .await
    .map_err(flatten_txn)
}

pub async fn migrate_user(
    db: &DatabaseConnection,
    user_id: i32,
    from: i32,
    to: i32,
    kind: MigrationKind,
) -> Result<user_node_assignment::Model, StoreError> {
    db.transaction::<_, user_node_assignment::Model, StoreError>(|txn| {
        Box::pin(async move {
            let current = get_assignment(txn, user_id)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("Assignment for user {user_id}")))?;
            if current.node_id != from {
                return Err(StoreError::Conflict(format!(
                    "user {user_id} is no longer assigned to node {from}"
                )));
            }
            let original = match kind {
                MigrationKind::Failover => current.original_node_id.or(Some(from)),
                MigrationKind::Recovery | MigrationKind::Administrative => None,
            };
            move_user(txn, Some(current), user_id, to, original).await
        })
    })
    .await
    .map_err(flatten_txn)
}

pub async fn unassign_user(
    db: &DatabaseConnection,
    user_id: i32,
) -> Result<Option<user_node_assignment::Model>, StoreError> {
    db.transaction::<_, Option<user_node_assignment::Model>, StoreError>(|txn| {
        Box::pin(async move {
            let Some(row) = get_assignment(txn, user_id).await? else {
                return Ok(None);
            };
            user_node_assignment::Entity::delete_by_id(row.id)
                .exec(txn)
                .await?;
            release_slot(txn, row.node_id, Utc::now()).await?;
            Ok(Some(row))
        })
    })
    .await
    .map_err(flatten_txn)
}
