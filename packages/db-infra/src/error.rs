use migration_store::StoreError;
use sea_orm::DbErr;
use thiserror::Error;

use crate::runner::AppliedStep;

#[derive(Debug, Error)]
pub enum DbInfraError {
    /// Malformed definition or unusable migrations directory.
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("migration lock not acquired within {waited_ms}ms ({attempts} attempts)")]
    LockTimeout { waited_ms: u128, attempts: u32 },

    /// A forward or backward statement failed. The transaction holding the
    /// statement and its tracking write rolled back together; `applied`
    /// records the steps that committed before the halt.
    #[error("migration {id} failed at position {position} ({} step(s) committed before it): {source}", .applied.len())]
    Statement {
        id: String,
        position: usize,
        applied: Vec<AppliedStep>,
        #[source]
        source: DbErr,
    },

    #[error("cannot roll back {requested} migration(s): only {available} applied and discoverable")]
    InsufficientHistory { requested: usize, available: usize },

    #[error("provisioning failed while {what}: {source}")]
    Provisioning {
        what: String,
        #[source]
        source: DbErr,
    },

    #[error("invalid identifier {0:?}: must be lowercase letters, digits or underscores, not leading with a digit, at most 63 bytes")]
    InvalidIdentifier(String),

    #[error(transparent)]
    Db(#[from] DbErr),
}
