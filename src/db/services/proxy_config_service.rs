use chrono::Utc;
use sea_orm::{
    sea_query::OnConflict, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, Set, TransactionTrait,
};

use crate::db::entities::proxy_config;
use crate::db::models::ConfigScope;
use crate::db::repository::StoreError;
use crate::db::services::flatten_txn;

pub async fn get_proxy_config<C: ConnectionTrait>(
    db: &C,
    scope: ConfigScope,
) -> Result<Option<proxy_config::Model>, DbErr> {
    proxy_config::Entity::find_by_id(scope.key()).one(db).await
}

pub async fn upsert_proxy_config<C: ConnectionTrait>(
    db: &C,
    scope: ConfigScope,
    config: serde_json::Value,
) -> Result<(), DbErr> {
    proxy_config::Entity::insert(proxy_config::ActiveModel {
        scope: Set(scope.key()),
        node_id: Set(scope.node_id()),
        config: Set(config),
        updated_at: Set(Utc::now()),
    })
    .on_conflict(
        OnConflict::column(proxy_config::Column::Scope)
            .update_columns([proxy_config::Column::Config, proxy_config::Column::UpdatedAt])
            .to_owned(),
    )
    .exec_without_returning(db)
    .await?;
    Ok(())
}

pub async fn delete_node_proxy_config<C: ConnectionTrait>(
    db: &C,
    node_id: i32,
) -> Result<(), DbErr> {
    proxy_config::Entity::delete_many()
        .filter(proxy_config::Column::NodeId.eq(node_id))
        .exec(db)
        .await?;
    Ok(())
}

/// Overrides and the new fleet-wide row change in one transaction, so a
/// reader never sees the new global config shadowed by an old override.
pub async fn replace_global_proxy_config(
    db: &DatabaseConnection,
    config: serde_json::Value,
) -> Result<(), StoreError> {
    db.transaction::<_, (), StoreError>(|txn| {
        Box::pin(async move {
            proxy_config::Entity::delete_many()
                .filter(proxy_config::Column::NodeId.is_not_null())
                .exec(txn)
                .await?;
            upsert_proxy_config(txn, ConfigScope::Global, config).await?;
            Ok(())
        })
    })
    .await
    .map_err(flatten_txn)
}
