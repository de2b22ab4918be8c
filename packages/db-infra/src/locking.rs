//! Cross-process serialization of migration runs via Postgres advisory
//! locks.
//!
//! All tooling targeting the same database derives the same lock key, so
//! two concurrent apply/rollback invocations never interleave regardless
//! of which migrations each intends to run.

use std::time::{Duration, Instant};

use rand::Rng;
use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseConnection, Statement};
use tracing::{trace, warn};

use crate::error::DbInfraError;

/// Well-known advisory lock key for a target database.
pub fn lock_key(dbname: &str) -> i64 {
    xxhash_rust::xxh3::xxh3_64(format!("pgprov:migrate:{dbname}").as_bytes()) as i64
}

/// Session-scoped advisory lock.
///
/// INVARIANT: the connection must be a min=max=1 pool (see
/// [`crate::conn`]) so acquire, the guarded statements and release all run
/// on the session that owns the lock.
pub struct MigrationLock {
    conn: DatabaseConnection,
    key: i64,
}

/// A held lock. Released explicitly via [`LockGuard::release`]; the server
/// also releases it implicitly when the owning session ends.
pub struct LockGuard {
    conn: DatabaseConnection,
    key: i64,
    released: bool,
}

impl MigrationLock {
    pub fn new(conn: DatabaseConnection, dbname: &str) -> Self {
        Self {
            conn,
            key: lock_key(dbname),
        }
    }

    /// Block (server-side) until the lock is granted. This is the default
    /// for migration runs: single-writer correctness over promptness.
    pub async fn acquire(&self) -> Result<LockGuard, DbInfraError> {
        let stmt = Statement::from_sql_and_values(
            DatabaseBackend::Postgres,
            "SELECT pg_advisory_lock($1)",
            [self.key.into()],
        );
        self.conn.execute(stmt).await?;
        trace!(lock_key = self.key, "advisory lock acquired");
        Ok(LockGuard {
            conn: self.conn.clone(),
            key: self.key,
            released: false,
        })
    }

    /// Single non-blocking attempt. `None` means another session holds the
    /// lock.
    pub async fn try_acquire(&self) -> Result<Option<LockGuard>, DbInfraError> {
        let stmt = Statement::from_sql_and_values(
            DatabaseBackend::Postgres,
            "SELECT pg_try_advisory_lock($1) AS locked",
            [self.key.into()],
        );
        let row = self.conn.query_one(stmt).await?.ok_or_else(|| {
            DbInfraError::Db(sea_orm::DbErr::Custom(
                "pg_try_advisory_lock returned no row".to_string(),
            ))
        })?;
        let locked: bool = row.try_get("", "locked")?;

        if !locked {
            return Ok(None);
        }
        trace!(lock_key = self.key, "advisory lock acquired (try)");
        Ok(Some(LockGuard {
            conn: self.conn.clone(),
            key: self.key,
            released: false,
        }))
    }

    /// Bounded wait: retry `try_acquire` with exponential backoff and
    /// jitter until `wait` elapses, then fail with `LockTimeout` having
    /// changed no state.
    pub async fn acquire_timeout(&self, wait: Duration) -> Result<LockGuard, DbInfraError> {
        let start = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            if let Some(guard) = self.try_acquire().await? {
                trace!(
                    lock_key = self.key,
                    attempts,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "advisory lock won after backoff"
                );
                return Ok(guard);
            }

            if start.elapsed() >= wait {
                return Err(DbInfraError::LockTimeout {
                    waited_ms: start.elapsed().as_millis(),
                    attempts,
                });
            }

            let base_delay_ms = (5u64 << attempts.saturating_sub(1)).min(80);
            let jitter_ms = rand::rng().random::<u64>() % 4;
            trace!(
                lock_key = self.key,
                attempts,
                delay_ms = base_delay_ms + jitter_ms,
                "advisory lock contended, backing off"
            );
            tokio::time::sleep(Duration::from_millis(base_delay_ms + jitter_ms)).await;
        }
    }
}

impl LockGuard {
    /// Explicit release. Unlock failures are logged, not raised: the lock
    /// dies with the session anyway, and the migration outcome must not be
    /// masked by a release hiccup.
    pub async fn release(mut self) -> Result<(), DbInfraError> {
        if self.released {
            return Ok(());
        }

        let stmt = Statement::from_sql_and_values(
            DatabaseBackend::Postgres,
            "SELECT pg_advisory_unlock($1) AS unlocked",
            [self.key.into()],
        );

        match self.conn.query_one(stmt).await {
            Ok(Some(row)) => {
                let unlocked: bool = row.try_get("", "unlocked")?;
                if !unlocked {
                    warn!(lock_key = self.key, "advisory unlock returned false");
                }
            }
            Ok(None) => {
                warn!(lock_key = self.key, "no result from advisory unlock query");
            }
            Err(e) => {
                warn!(error = %e, lock_key = self.key, "failed to release advisory lock");
            }
        }

        self.released = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_key_is_stable_per_database() {
        assert_eq!(lock_key("appdb"), lock_key("appdb"));
    }

    #[test]
    fn lock_key_differs_across_databases() {
        assert_ne!(lock_key("appdb"), lock_key("otherdb"));
    }
}
