//! Recovery log table on PostgreSQL.
//!
//! Every call takes its own pooled connection, so records survive the
//! rollback of the migration transaction they describe.

use tidemark_migrate::transaction::POSTGRES_INIT_SQL;
use tidemark_migrate::{MigrateResult, MigrationError, RecoveryLog, RecoveryRecord};
use tokio_postgres::Row;

use crate::error::PgResult;
use crate::pool::PgPool;
use crate::row::PgRow;

/// [`RecoveryLog`] backed by `_tidemark_recovery`.
#[derive(Clone)]
pub struct PgRecoveryLog {
    pool: PgPool,
}

impl PgRecoveryLog {
    /// Create a recovery log.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn recovery_record(row: &Row) -> PgResult<RecoveryRecord> {
    Ok(RecoveryRecord {
        id: Some(row.get_value("id")?),
        migration_id: row.get_value("migration_id")?,
        created_at: row.get_value("created_at")?,
        recovery_data: row.get_value("recovery_data")?,
        resolved: row.get_value("resolved")?,
    })
}

#[async_trait::async_trait]
impl RecoveryLog for PgRecoveryLog {
    async fn initialize(&self) -> MigrateResult<()> {
        let conn = self.pool.get().await?;
        conn.batch(POSTGRES_INIT_SQL).await?;
        Ok(())
    }

    async fn record(&self, record: RecoveryRecord) -> MigrateResult<i64> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                "INSERT INTO _tidemark_recovery (migration_id, created_at, recovery_data, resolved) \
                 VALUES ($1, $2, $3, $4) RETURNING id",
                &[
                    &record.migration_id,
                    &record.created_at,
                    &record.recovery_data,
                    &record.resolved,
                ],
            )
            .await?
            .ok_or_else(|| MigrationError::database("recovery insert returned no id"))?;
        Ok(row.get_value("id")?)
    }

    async fn unresolved(&self) -> MigrateResult<Vec<RecoveryRecord>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT id, migration_id, created_at, recovery_data, resolved \
                 FROM _tidemark_recovery WHERE NOT resolved ORDER BY id",
                &[],
            )
            .await?;
        Ok(rows.iter().map(recovery_record).collect::<PgResult<Vec<_>>>()?)
    }

    async fn resolve(&self, id: i64) -> MigrateResult<bool> {
        let conn = self.pool.get().await?;
        let updated = conn
            .execute_params(
                "UPDATE _tidemark_recovery SET resolved = TRUE WHERE id = $1",
                &[&id],
            )
            .await?;
        Ok(updated > 0)
    }
}
