//! Apply/rollback orchestration.
//!
//! Every mutating run holds the advisory lock, executes strictly in id
//! order, and wraps each migration's statement together with its tracking
//! write in one transaction. Failure halts the run at the offending
//! migration; the committed prefix stays committed.

use std::collections::BTreeSet;
use std::time::Duration;

use migration_store::MigrationDefinition;
use sea_orm::{ConnectionTrait, DatabaseConnection, DbErr, TransactionTrait};
use tracing::{info, warn};

use crate::error::DbInfraError;
use crate::locking::{LockGuard, MigrationLock};
use crate::tracker;

/// One executed transition, in the order it ran. `sequence` is 1-based
/// within the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedStep {
    pub sequence: usize,
    pub id: String,
}

/// Definitions present in the store but not yet applied, ascending by id.
/// `definitions` is assumed sorted, as the store returns it.
pub fn pending<'a>(
    definitions: &'a [MigrationDefinition],
    applied: &BTreeSet<String>,
) -> Vec<&'a MigrationDefinition> {
    definitions
        .iter()
        .filter(|d| !applied.contains(&d.id))
        .collect()
}

/// Applied definitions still present in the store, most recent first.
pub fn rollback_candidates<'a>(
    definitions: &'a [MigrationDefinition],
    applied: &BTreeSet<String>,
) -> Vec<&'a MigrationDefinition> {
    definitions
        .iter()
        .rev()
        .filter(|d| applied.contains(&d.id))
        .collect()
}

/// Applied ids whose definition has disappeared from the store. These can
/// no longer be targeted by rollback; callers surface them instead of
/// resolving them silently.
pub fn orphaned_ids(
    definitions: &[MigrationDefinition],
    applied: &BTreeSet<String>,
) -> Vec<String> {
    let known: BTreeSet<&str> = definitions.iter().map(|d| d.id.as_str()).collect();
    applied
        .iter()
        .filter(|id| !known.contains(id.as_str()))
        .cloned()
        .collect()
}

enum Direction {
    Forward,
    Backward,
}

pub struct MigrationRunner {
    conn: DatabaseConnection,
    dbname: String,
    lock_wait: Option<Duration>,
}

impl MigrationRunner {
    /// Runner with the default unbounded lock wait.
    pub fn new(conn: DatabaseConnection, dbname: impl Into<String>) -> Self {
        Self {
            conn,
            dbname: dbname.into(),
            lock_wait: None,
        }
    }

    /// Bound the lock wait; expiry fails the run with `LockTimeout` before
    /// any state changes.
    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = Some(wait);
        self
    }

    async fn acquire_lock(&self) -> Result<LockGuard, DbInfraError> {
        let lock = MigrationLock::new(self.conn.clone(), &self.dbname);
        match self.lock_wait {
            Some(wait) => lock.acquire_timeout(wait).await,
            None => lock.acquire().await,
        }
    }

    fn warn_orphans(&self, definitions: &[MigrationDefinition], applied: &BTreeSet<String>) {
        for id in orphaned_ids(definitions, applied) {
            warn!(
                migration = %id,
                "recorded as applied but missing from the store; rollback cannot target it"
            );
        }
    }

    /// Read-only; no lock taken.
    pub async fn list_pending(
        &self,
        definitions: &[MigrationDefinition],
    ) -> Result<Vec<MigrationDefinition>, DbInfraError> {
        tracker::ensure_tracking_table(&self.conn).await?;
        let applied = tracker::applied_ids(&self.conn).await?;
        Ok(pending(definitions, &applied).into_iter().cloned().collect())
    }

    /// Read-only; no lock taken. Orphaned applied ids are logged.
    pub async fn list_rollback_candidates(
        &self,
        definitions: &[MigrationDefinition],
    ) -> Result<Vec<MigrationDefinition>, DbInfraError> {
        tracker::ensure_tracking_table(&self.conn).await?;
        let applied = tracker::applied_ids(&self.conn).await?;
        self.warn_orphans(definitions, &applied);
        Ok(rollback_candidates(definitions, &applied)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Apply the pending subset of `definitions` in ascending id order.
    /// Returns the executed steps; an empty pending set returns without
    /// touching the lock.
    pub async fn apply(
        &self,
        definitions: &[MigrationDefinition],
    ) -> Result<Vec<AppliedStep>, DbInfraError> {
        tracker::ensure_tracking_table(&self.conn).await?;
        let applied = tracker::applied_ids(&self.conn).await?;
        self.warn_orphans(definitions, &applied);
        if pending(definitions, &applied).is_empty() {
            info!(db = %self.dbname, "no pending migrations");
            return Ok(Vec::new());
        }

        let guard = self.acquire_lock().await?;
        let outcome = self.apply_locked(definitions).await;
        if let Err(e) = guard.release().await {
            warn!(error = %e, "failed to release migration lock");
        }
        outcome
    }

    async fn apply_locked(
        &self,
        definitions: &[MigrationDefinition],
    ) -> Result<Vec<AppliedStep>, DbInfraError> {
        // Recompute under the lock: a concurrent writer may have advanced
        // the tracking table while we waited.
        let applied = tracker::applied_ids(&self.conn).await?;
        let todo = pending(definitions, &applied);

        let mut steps = Vec::new();
        for def in todo {
            self.run_step(def, Direction::Forward, &mut steps).await?;
        }
        Ok(steps)
    }

    /// Roll back the `n` most recently applied, still-discoverable
    /// migrations. `n = 0` verifies history depth without mutating
    /// anything; `n` beyond the candidate count fails before any
    /// statement runs.
    pub async fn rollback(
        &self,
        n: usize,
        definitions: &[MigrationDefinition],
    ) -> Result<Vec<AppliedStep>, DbInfraError> {
        tracker::ensure_tracking_table(&self.conn).await?;
        let applied = tracker::applied_ids(&self.conn).await?;
        self.warn_orphans(definitions, &applied);

        let available = rollback_candidates(definitions, &applied).len();
        if n > available {
            return Err(DbInfraError::InsufficientHistory {
                requested: n,
                available,
            });
        }
        if n == 0 {
            return Ok(Vec::new());
        }

        let guard = self.acquire_lock().await?;
        let outcome = self.rollback_locked(n, definitions).await;
        if let Err(e) = guard.release().await {
            warn!(error = %e, "failed to release migration lock");
        }
        outcome
    }

    async fn rollback_locked(
        &self,
        n: usize,
        definitions: &[MigrationDefinition],
    ) -> Result<Vec<AppliedStep>, DbInfraError> {
        let applied = tracker::applied_ids(&self.conn).await?;
        let candidates = rollback_candidates(definitions, &applied);
        if n > candidates.len() {
            // History shrank while we waited for the lock.
            return Err(DbInfraError::InsufficientHistory {
                requested: n,
                available: candidates.len(),
            });
        }

        let mut steps = Vec::new();
        for def in candidates.into_iter().take(n) {
            self.run_step(def, Direction::Backward, &mut steps).await?;
        }
        Ok(steps)
    }

    /// Execute one transition in its own transaction: the SQL and its
    /// tracking write commit or roll back together.
    async fn run_step(
        &self,
        def: &MigrationDefinition,
        direction: Direction,
        steps: &mut Vec<AppliedStep>,
    ) -> Result<(), DbInfraError> {
        let sequence = steps.len() + 1;
        let txn = self.conn.begin().await?;

        let executed: Result<(), DbErr> = match direction {
            Direction::Forward => match txn.execute_unprepared(&def.forward_statement).await {
                Ok(_) => tracker::record_applied(&txn, &def.id).await,
                Err(e) => Err(e),
            },
            Direction::Backward => match txn.execute_unprepared(&def.backward_statement).await {
                Ok(_) => tracker::record_rolled_back(&txn, &def.id).await,
                Err(e) => Err(e),
            },
        };

        let committed = match executed {
            Ok(()) => txn.commit().await,
            Err(e) => {
                if let Err(rb) = txn.rollback().await {
                    warn!(error = %rb, migration = %def.id, "transaction rollback failed");
                }
                Err(e)
            }
        };

        match committed {
            Ok(()) => {
                match direction {
                    Direction::Forward => info!(migration = %def.id, sequence, "applied"),
                    Direction::Backward => info!(migration = %def.id, sequence, "rolled back"),
                }
                steps.push(AppliedStep {
                    sequence,
                    id: def.id.clone(),
                });
                Ok(())
            }
            Err(source) => Err(DbInfraError::Statement {
                id: def.id.clone(),
                position: sequence,
                applied: std::mem::take(steps),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(id: &str) -> MigrationDefinition {
        MigrationDefinition {
            id: id.to_string(),
            forward_statement: format!("create table {} ()", id.replace('-', "_")),
            backward_statement: "drop table x".to_string(),
        }
    }

    fn store() -> Vec<MigrationDefinition> {
        vec![
            def("2024-01-01-00-00-00-init"),
            def("2024-01-02-00-00-00-add-col"),
            def("2024-01-03-00-00-00-add-index"),
        ]
    }

    fn applied(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn pending_is_ascending_and_excludes_applied() {
        let defs = store();
        let p = pending(&defs, &applied(&["2024-01-02-00-00-00-add-col"]));
        let ids: Vec<_> = p.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["2024-01-01-00-00-00-init", "2024-01-03-00-00-00-add-index"]
        );
    }

    #[test]
    fn pending_of_fresh_database_is_everything() {
        let defs = store();
        assert_eq!(pending(&defs, &BTreeSet::new()).len(), 3);
    }

    #[test]
    fn rollback_candidates_are_descending_applied_intersection() {
        let defs = store();
        let c = rollback_candidates(
            &defs,
            &applied(&["2024-01-01-00-00-00-init", "2024-01-03-00-00-00-add-index"]),
        );
        let ids: Vec<_> = c.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["2024-01-03-00-00-00-add-index", "2024-01-01-00-00-00-init"]
        );
    }

    #[test]
    fn orphaned_ids_are_applied_but_undiscoverable() {
        let defs = store();
        let orphans = orphaned_ids(
            &defs,
            &applied(&["2024-01-01-00-00-00-init", "1999-01-01-00-00-00-removed"]),
        );
        assert_eq!(orphans, vec!["1999-01-01-00-00-00-removed"]);
    }

    #[test]
    fn orphans_are_excluded_from_rollback_candidates() {
        let defs = store();
        let c = rollback_candidates(&defs, &applied(&["1999-01-01-00-00-00-removed"]));
        assert!(c.is_empty());
    }
}
