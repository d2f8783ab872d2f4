use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    IntoActiveModel, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};

use crate::db::entities::{node, node_group, node_group_member};
use crate::db::models::{NewNodeGroup, NodeGroupUpdate};
use crate::db::repository::StoreError;
use crate::db::services::{conflict_on_unique, flatten_txn};

pub async fn create_node_group<C: ConnectionTrait>(
    db: &C,
    new: NewNodeGroup,
) -> Result<node_group::Model, StoreError> {
    let now = Utc::now();
    node_group::ActiveModel {
        name: Set(new.name.clone()),
        region: Set(new.region),
        strategy: Set(new.strategy),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await
    .map_err(|e| conflict_on_unique(e, &format!("group name '{}' already exists", new.name)))
}

pub async fn get_node_group_by_id<C: ConnectionTrait>(
    db: &C,
    group_id: i32,
) -> Result<Option<node_group::Model>, DbErr> {
    node_group::Entity::find_by_id(group_id).one(db).await
}

pub async fn get_all_node_groups<C: ConnectionTrait>(
    db: &C,
) -> Result<Vec<node_group::Model>, DbErr> {
    node_group::Entity::find()
        .order_by_asc(node_group::Column::Id)
        .all(db)
        .await
}

pub async fn update_node_group<C: ConnectionTrait>(
    db: &C,
    group_id: i32,
    update: NodeGroupUpdate,
) -> Result<node_group::Model, StoreError> {
    let model = node_group::Entity::find_by_id(group_id)
        .one(db)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("Group {group_id}")))?;
    let mut active_model = model.into_active_model();
    if let Some(name) = update.name {
        active_model.name = Set(name);
    }
    if let Some(region) = update.region {
        active_model.region = Set(Some(region));
    }
    if let Some(strategy) = update.strategy {
        active_model.strategy = Set(strategy);
    }
    active_model.updated_at = Set(Utc::now());
    active_model
        .update(db)
        .await
        .map_err(|e| conflict_on_unique(e, "group name already exists"))
}

pub async fn delete_node_group(db: &DatabaseConnection, group_id: i32) -> Result<(), StoreError> {
    db.transaction::<_, (), StoreError>(|txn| {
        Box::pin(async move {
            node_group_member::Entity::delete_many()
                .filter(node_group_member::Column::GroupId.eq(group_id))
                .exec(txn)
                .await?;
            let result = node_group::Entity::delete_by_id(group_id).exec(txn).await?;
            if result.rows_affected == 0 {
                return Err(StoreError::NotFound(format!("Group {group_id}")));
            }
            Ok(())
        })
    })
    .await
    .map_err(flatten_txn)
}

pub async fn add_member<C: ConnectionTrait>(
    db: &C,
    group_id: i32,
    node_id: i32,
) -> Result<(), StoreError> {
    if node_group::Entity::find_by_id(group_id).one(db).await?.is_none() {
        return Err(StoreError::NotFound(format!("Group {group_id}")));
    }
    if node::Entity::find_by_id(node_id).one(db).await?.is_none() {
        return Err(StoreError::NotFound(format!("Node {node_id}")));
    }
    let conflict = || StoreError::Conflict(format!("node {node_id} is already in group {group_id}"));
    if node_group_member::Entity::find_by_id((node_id, group_id))
        .one(db)
        .await?
        .is_some()
    {
        return Err(conflict());
    }
    node_group_member::ActiveModel {
        node_id: Set(node_id),
        group_id: Set(group_id),
    }
    .insert(db)
    .await
    .map_err(|e| match conflict_on_unique(e, "") {
        StoreError::Conflict(_) => conflict(),
        other => other,
    })?;
    Ok(())
}

pub async fn remove_member<C: ConnectionTrait>(
    db: &C,
    group_id: i32,
    node_id: i32,
) -> Result<(), StoreError> {
    let result = node_group_member::Entity::delete_many()
        .filter(node_group_member::Column::GroupId.eq(group_id))
        .filter(node_group_member::Column::NodeId.eq(node_id))
        .exec(db)
        .await?;
    if result.rows_affected == 0 {
        return Err(StoreError::NotFound(format!(
            "Membership of node {node_id} in group {group_id}"
        )));
    }
    Ok(())
}

pub async fn list_group_node_ids<C: ConnectionTrait>(
    db: &C,
    group_id: i32,
) -> Result<Vec<i32>, DbErr> {
    node_group_member::Entity::find()
        .select_only()
        .column(node_group_member::Column::NodeId)
        .filter(node_group_member::Column::GroupId.eq(group_id))
        .order_by_asc(node_group_member::Column::NodeId)
        .into_tuple::<i32>()
        .all(db)
        .await
}

pub async fn get_groups_for_node<C: ConnectionTrait>(
    db: &C,
    node_id: i32,
) -> Result<Vec<node_group::Model>, DbErr> {
    let group_ids: Vec<i32> = node_group_member::Entity::find()
        .select_only()
        .column(node_group_member::Column::GroupId)
        .filter(node_group_member::Column::NodeId.eq(node_id))
        .into_tuple::<i32>()
        .all(db)
        .await?;
    if group_ids.is_empty() {
        return Ok(Vec::new());
    }
    node_group::Entity::find()
        .filter(node_group::Column::Id.is_in(group_ids))
        .order_by_asc(node_group::Column::Id)
        .all(db)
        .await
}
