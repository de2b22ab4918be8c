//! Top-level operations wired for the CLI layer: each takes a
//! [`ConnectionSpec`] plus whatever else it needs, opens its own
//! connections, and runs one provisioning or migration flow end to end.

use std::path::Path;

use migration_store::MigrationDefinition;
use tracing::info;

use crate::conn::{connect_catalog, connect_target, ConnectionSpec};
use crate::error::DbInfraError;
use crate::provision::{self, RolePasswords, RoleSet};
use crate::runner::{AppliedStep, MigrationRunner};

/// Create the target database if absent. Returns true when created.
pub async fn ensure_database(spec: &ConnectionSpec) -> Result<bool, DbInfraError> {
    let catalog = connect_catalog(spec).await?;
    provision::ensure_database(&catalog, &spec.dbname).await
}

/// Bootstrap the three access tiers on the target database.
pub async fn ensure_roles(
    spec: &ConnectionSpec,
    passwords: &RolePasswords,
) -> Result<RoleSet, DbInfraError> {
    let conn = connect_target(spec).await?;
    provision::ensure_roles(&conn, &spec.dbname, passwords).await
}

pub async fn list_pending(
    spec: &ConnectionSpec,
    migrations_dir: &Path,
) -> Result<Vec<MigrationDefinition>, DbInfraError> {
    let definitions = migration_store::discover(migrations_dir)?;
    let conn = connect_target(spec).await?;
    let runner = MigrationRunner::new(conn, spec.dbname.clone());
    runner.list_pending(&definitions).await
}

pub async fn list_rollback_candidates(
    spec: &ConnectionSpec,
    migrations_dir: &Path,
) -> Result<Vec<MigrationDefinition>, DbInfraError> {
    let definitions = migration_store::discover(migrations_dir)?;
    let conn = connect_target(spec).await?;
    let runner = MigrationRunner::new(conn, spec.dbname.clone());
    runner.list_rollback_candidates(&definitions).await
}

/// Apply every pending migration under the advisory lock.
pub async fn apply_all(
    spec: &ConnectionSpec,
    migrations_dir: &Path,
) -> Result<Vec<AppliedStep>, DbInfraError> {
    let definitions = migration_store::discover(migrations_dir)?;
    let conn = connect_target(spec).await?;
    let runner = MigrationRunner::new(conn, spec.dbname.clone());
    runner.apply(&definitions).await
}

/// Roll back the `n` most recent applied-and-discoverable migrations.
pub async fn rollback(
    spec: &ConnectionSpec,
    migrations_dir: &Path,
    n: usize,
) -> Result<Vec<AppliedStep>, DbInfraError> {
    let definitions = migration_store::discover(migrations_dir)?;
    let conn = connect_target(spec).await?;
    let runner = MigrationRunner::new(conn, spec.dbname.clone());
    runner.rollback(n, &definitions).await
}

/// One-shot environment bring-up: ensure the database exists, then apply
/// all pending migrations against it.
pub async fn prepare(
    spec: &ConnectionSpec,
    migrations_dir: &Path,
) -> Result<Vec<AppliedStep>, DbInfraError> {
    let created = ensure_database(spec).await?;
    info!(db = %spec.dbname, created, "database ensured");
    apply_all(spec, migrations_dir).await
}
