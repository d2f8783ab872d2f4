use chrono::{DateTime, Utc};
use sea_orm::{
    prelude::Expr, sea_query::OnConflict, ColumnTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QuerySelect, Set, TransactionTrait,
};

use crate::db::entities::node_auth_failure;
use crate::db::models::AuthFailurePolicy;
use crate::db::repository::{apply_auth_failure, new_auth_failure, StoreError};
use crate::db::services::flatten_txn;

pub async fn get_auth_failure<C: sea_orm::ConnectionTrait>(
    db: &C,
    ip: &str,
) -> Result<Option<node_auth_failure::Model>, DbErr> {
    node_auth_failure::Entity::find_by_id(ip.to_owned())
        .one(db)
        .await
}

/// Ensures the row exists, then locks it and applies one failed attempt.
pub async fn record_auth_failure(
    db: &DatabaseConnection,
    ip: &str,
    now: DateTime<Utc>,
    policy: AuthFailurePolicy,
) -> Result<node_auth_failure::Model, StoreError> {
    let ip = ip.to_owned();
    db.transaction::<_, node_auth_failure::Model, StoreError>(|txn| {
        Box::pin(async move {
            let seed = new_auth_failure(&ip, now);
            let insert = node_auth_failure::Entity::insert(node_auth_failure::ActiveModel {
                ip: Set(seed.ip.clone()),
                attempts: Set(seed.attempts),
                window_started_at: Set(seed.window_started_at),
                last_attempt_at: Set(seed.last_attempt_at),
                blocked_until: Set(None),
            })
            .on_conflict(
                OnConflict::column(node_auth_failure::Column::Ip)
                    .do_nothing()
                    .to_owned(),
            )
            .exec(txn)
            .await;
            match insert {
                Ok(_) | Err(DbErr::RecordNotInserted) => {}
                Err(e) => return Err(e.into()),
            }

            let mut record = node_auth_failure::Entity::find_by_id(ip.clone())
                .lock_exclusive()
                .one(txn)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("Auth failure record for {ip}")))?;
            apply_auth_failure(&mut record, now, &policy);

            node_auth_failure::Entity::update_many()
                .col_expr(node_auth_failure::Column::Attempts, Expr::value(record.attempts))
                .col_expr(
                    node_auth_failure::Column::WindowStartedAt,
                    Expr::value(record.window_started_at),
                )
                .col_expr(
                    node_auth_failure::Column::LastAttemptAt,
                    Expr::value(record.last_attempt_at),
                )
                .col_expr(
                    node_auth_failure::Column::BlockedUntil,
                    Expr::value(record.blocked_until),
                )
                .filter(node_auth_failure::Column::Ip.eq(ip.as_str()))
                .exec(txn)
                .await?;
            Ok(record)
        })
    })
    .await
    .map_err(flatten_txn)
}
