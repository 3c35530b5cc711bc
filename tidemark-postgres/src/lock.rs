//! Lock table on PostgreSQL.
//!
//! Exclusion rests on the partial unique index over ACTIVE rows: two
//! concurrent inserts cannot both succeed.

use chrono::{DateTime, Utc};
use tidemark_migrate::lock::{InsertOutcome, POSTGRES_INIT_SQL};
use tidemark_migrate::{LockRecord, LockRepository, LockStatus, MigrateResult, MigrationError};
use tokio_postgres::Row;
use tracing::debug;

use crate::error::PgResult;
use crate::pool::PgPool;
use crate::row::PgRow;

const COLUMNS: &str = "lock_id, migration_id, acquired_by, acquired_at, expires_at, \
     released_at, released_by, status, machine_name, process_id";

/// Attempts before giving up when the active row vanishes between insert and read.
const INSERT_ATTEMPTS: usize = 3;

/// [`LockRepository`] backed by the `_tidemark_locks` table.
#[derive(Clone)]
pub struct PgLockStore {
    pool: PgPool,
}

impl PgLockStore {
    /// Create a lock store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn lock_record(row: &Row) -> PgResult<LockRecord> {
    let status: String = row.get_value("status")?;
    let process_id: i64 = row.get_value("process_id")?;
    Ok(LockRecord {
        lock_id: row.get_value("lock_id")?,
        migration_id: row.get_value("migration_id")?,
        acquired_by: row.get_value("acquired_by")?,
        acquired_at: row.get_value("acquired_at")?,
        expires_at: row.get_value("expires_at")?,
        released_at: row.get_opt("released_at")?,
        released_by: row.get_opt("released_by")?,
        status: LockStatus::parse(&status).ok_or_else(|| {
            crate::error::PgError::deserialization(format!("unknown lock status '{}'", status))
        })?,
        machine_name: row.get_value("machine_name")?,
        process_id: u32::try_from(process_id).unwrap_or_default(),
    })
}

#[async_trait::async_trait]
impl LockRepository for PgLockStore {
    async fn initialize(&self) -> MigrateResult<()> {
        let conn = self.pool.get().await?;
        conn.batch(POSTGRES_INIT_SQL).await?;
        Ok(())
    }

    async fn expire_stale(&self, now: DateTime<Utc>) -> MigrateResult<u64> {
        let conn = self.pool.get().await?;
        let count = conn
            .execute_params(
                "UPDATE _tidemark_locks \
                 SET status = 'EXPIRED', released_at = $1, released_by = 'sweeper' \
                 WHERE status = 'ACTIVE' AND expires_at <= $1",
                &[&now],
            )
            .await?;
        Ok(count)
    }

    async fn active(&self) -> MigrateResult<Option<LockRecord>> {
        let conn = self.pool.get().await?;
        let sql = format!("SELECT {} FROM _tidemark_locks WHERE status = 'ACTIVE'", COLUMNS);
        match conn.query_opt(&sql, &[]).await? {
            Some(row) => Ok(Some(lock_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn insert_active(&self, record: LockRecord) -> MigrateResult<InsertOutcome> {
        let conn = self.pool.get().await?;
        let process_id = i64::from(record.process_id);

        for attempt in 1..=INSERT_ATTEMPTS {
            let inserted = conn
                .execute_params(
                    "INSERT INTO _tidemark_locks \
                     (lock_id, migration_id, acquired_by, acquired_at, expires_at, status, machine_name, process_id) \
                     VALUES ($1, $2, $3, $4, $5, 'ACTIVE', $6, $7) \
                     ON CONFLICT (status) WHERE status = 'ACTIVE' DO NOTHING",
                    &[
                        &record.lock_id,
                        &record.migration_id,
                        &record.acquired_by,
                        &record.acquired_at,
                        &record.expires_at,
                        &record.machine_name,
                        &process_id,
                    ],
                )
                .await?;
            if inserted == 1 {
                return Ok(InsertOutcome::Inserted);
            }
            if let Some(holder) = self.active().await? {
                return Ok(InsertOutcome::Conflict(holder));
            }
            debug!(attempt, "Active lock vanished after a conflicting insert; retrying");
        }

        Err(MigrationError::lock_failed(
            "lock table changed concurrently on every insert attempt",
        ))
    }

    async fn force_release(
        &self,
        lock_id: &str,
        by: &str,
        at: DateTime<Utc>,
    ) -> MigrateResult<bool> {
        let conn = self.pool.get().await?;
        let updated = conn
            .execute_params(
                "UPDATE _tidemark_locks \
                 SET status = 'FORCE_RELEASED', released_by = $2, released_at = $3 \
                 WHERE lock_id = $1 AND status = 'ACTIVE'",
                &[&lock_id, &by, &at],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn release(&self, lock_id: &str, by: &str, at: DateTime<Utc>) -> MigrateResult<bool> {
        let conn = self.pool.get().await?;
        let updated = conn
            .execute_params(
                "UPDATE _tidemark_locks \
                 SET status = 'RELEASED', released_by = $2, released_at = $3 \
                 WHERE lock_id = $1 AND status = 'ACTIVE'",
                &[&lock_id, &by, &at],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn force_release_all(&self, by: &str, at: DateTime<Utc>) -> MigrateResult<u64> {
        let conn = self.pool.get().await?;
        let count = conn
            .execute_params(
                "UPDATE _tidemark_locks \
                 SET status = 'FORCE_RELEASED', released_by = $1, released_at = $2 \
                 WHERE status = 'ACTIVE'",
                &[&by, &at],
            )
            .await?;
        Ok(count)
    }

    async fn get(&self, lock_id: &str) -> MigrateResult<Option<LockRecord>> {
        let conn = self.pool.get().await?;
        let sql = format!("SELECT {} FROM _tidemark_locks WHERE lock_id = $1", COLUMNS);
        match conn.query_opt(&sql, &[&lock_id]).await? {
            Some(row) => Ok(Some(lock_record(&row)?)),
            None => Ok(None),
        }
    }
}
