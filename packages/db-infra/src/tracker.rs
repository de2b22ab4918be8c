//! Applied-migration bookkeeping inside the target database.
//!
//! The tracker never serializes callers; apply/rollback hold the advisory
//! lock from [`crate::locking`] before reading or writing this table.

use std::collections::BTreeSet;

use sea_orm::{ConnectionTrait, DatabaseBackend, DbErr, Statement};

use crate::error::DbInfraError;

pub const TRACKING_TABLE: &str = "_pgprov_migrations";

pub async fn ensure_tracking_table<C: ConnectionTrait>(conn: &C) -> Result<(), DbInfraError> {
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {TRACKING_TABLE} (\
         migration_id text PRIMARY KEY, \
         applied_at timestamptz NOT NULL DEFAULT now())"
    );
    conn.execute(Statement::from_string(DatabaseBackend::Postgres, sql))
        .await?;
    Ok(())
}

/// Ids recorded as applied. Existence of a record means the forward
/// statement committed.
pub async fn applied_ids<C: ConnectionTrait>(conn: &C) -> Result<BTreeSet<String>, DbInfraError> {
    let stmt = Statement::from_string(
        DatabaseBackend::Postgres,
        format!("SELECT migration_id FROM {TRACKING_TABLE}"),
    );
    let rows = conn.query_all(stmt).await?;
    rows.iter()
        .map(|row| row.try_get("", "migration_id").map_err(DbInfraError::from))
        .collect()
}

/// Insert the record for `id`. Call inside the same transaction as the
/// forward statement it accounts for.
pub async fn record_applied<C: ConnectionTrait>(conn: &C, id: &str) -> Result<(), DbErr> {
    let stmt = Statement::from_sql_and_values(
        DatabaseBackend::Postgres,
        format!("INSERT INTO {TRACKING_TABLE} (migration_id) VALUES ($1)"),
        [id.into()],
    );
    conn.execute(stmt).await?;
    Ok(())
}

/// Delete the record for `id`. Call inside the same transaction as the
/// backward statement.
pub async fn record_rolled_back<C: ConnectionTrait>(conn: &C, id: &str) -> Result<(), DbErr> {
    let stmt = Statement::from_sql_and_values(
        DatabaseBackend::Postgres,
        format!("DELETE FROM {TRACKING_TABLE} WHERE migration_id = $1"),
        [id.into()],
    );
    conn.execute(stmt).await?;
    Ok(())
}
