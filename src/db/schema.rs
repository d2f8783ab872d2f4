//! Creates the control-plane tables from the entity definitions.

use sea_orm::{
    sea_query::Index, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, Schema,
};
use tracing::info;

use crate::db::entities::{
    health_check, node, node_auth_failure, node_group, node_group_member, node_traffic,
    proxy_config, user_node_assignment,
};

async fn create_entity_table<E>(
    db: &DatabaseConnection,
    schema: &Schema,
    entity: E,
) -> Result<(), DbErr>
where
    E: EntityTrait,
{
    let backend = db.get_database_backend();
    let mut table = schema.create_table_from_entity(entity);
    table.if_not_exists();
    db.execute(backend.build(&table)).await?;
    for mut index in schema.create_index_from_entity(entity) {
        index.if_not_exists();
        db.execute(backend.build(&index)).await?;
    }
    Ok(())
}

/// Idempotent; safe to run on every start.
pub async fn create_tables(db: &DatabaseConnection) -> Result<(), DbErr> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);

    // Parents before children so foreign keys resolve.
    create_entity_table(db, &schema, node::Entity).await?;
    create_entity_table(db, &schema, node_group::Entity).await?;
    create_entity_table(db, &schema, node_group_member::Entity).await?;
    create_entity_table(db, &schema, health_check::Entity).await?;
    create_entity_table(db, &schema, user_node_assignment::Entity).await?;
    create_entity_table(db, &schema, node_traffic::Entity).await?;
    create_entity_table(db, &schema, node_auth_failure::Entity).await?;
    create_entity_table(db, &schema, proxy_config::Entity).await?;

    let history_index = Index::create()
        .name("idx-health_checks-node_id-checked_at")
        .table(health_check::Entity)
        .col(health_check::Column::NodeId)
        .col(health_check::Column::CheckedAt)
        .if_not_exists()
        .to_owned();
    db.execute(backend.build(&history_index)).await?;

    let traffic_index = Index::create()
        .name("idx-node_traffic-node_id-recorded_at")
        .table(node_traffic::Entity)
        .col(node_traffic::Column::NodeId)
        .col(node_traffic::Column::RecordedAt)
        .if_not_exists()
        .to_owned();
    db.execute(backend.build(&traffic_index)).await?;

    info!("Database schema is up to date.");
    Ok(())
}
