//! Migration history table on PostgreSQL.

use chrono::Utc;
use tidemark_migrate::history::POSTGRES_INIT_SQL;
use tidemark_migrate::{
    MigrateResult, MigrationError, MigrationHistoryRepository, MigrationRecord, MigrationState,
};
use tokio_postgres::Row;

use crate::error::{PgError, PgResult};
use crate::pool::PgPool;
use crate::row::PgRow;

/// [`MigrationHistoryRepository`] backed by `_tidemark_migrations`.
#[derive(Clone)]
pub struct PgHistory {
    pool: PgPool,
}

impl PgHistory {
    /// Create a history store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn migration_record(row: &Row) -> PgResult<MigrationRecord> {
    let state: String = row.get_value("state")?;
    Ok(MigrationRecord {
        id: row.get_value("id")?,
        checksum: row.get_value("checksum")?,
        state: MigrationState::parse(&state).ok_or_else(|| {
            PgError::deserialization(format!("unknown migration state '{}'", state))
        })?,
        applied_at: row.get_value("applied_at")?,
        duration_ms: row.get_value("duration_ms")?,
        rolled_back: row.get_value("rolled_back")?,
        error: row.get_opt("error")?,
    })
}

#[async_trait::async_trait]
impl MigrationHistoryRepository for PgHistory {
    async fn initialize(&self) -> MigrateResult<()> {
        let conn = self.pool.get().await?;
        conn.batch(POSTGRES_INIT_SQL).await?;
        Ok(())
    }

    async fn get_all(&self) -> MigrateResult<Vec<MigrationRecord>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT id, checksum, state, applied_at, duration_ms, rolled_back, error \
                 FROM _tidemark_migrations ORDER BY id",
                &[],
            )
            .await?;
        Ok(rows.iter().map(migration_record).collect::<PgResult<Vec<_>>>()?)
    }

    async fn record_state(
        &self,
        id: &str,
        checksum: &str,
        state: MigrationState,
        duration_ms: i64,
        error: Option<&str>,
    ) -> MigrateResult<()> {
        let conn = self.pool.get().await?;
        conn.execute_params(
            "INSERT INTO _tidemark_migrations (id, checksum, state, applied_at, duration_ms, rolled_back, error) \
             VALUES ($1, $2, $3, $4, $5, FALSE, $6) \
             ON CONFLICT (id) DO UPDATE \
             SET checksum = EXCLUDED.checksum, state = EXCLUDED.state, applied_at = EXCLUDED.applied_at, \
                 duration_ms = EXCLUDED.duration_ms, rolled_back = FALSE, error = EXCLUDED.error",
            &[&id, &checksum, &state.as_str(), &Utc::now(), &duration_ms, &error],
        )
        .await?;
        Ok(())
    }

    async fn record_rollback(&self, id: &str) -> MigrateResult<()> {
        let conn = self.pool.get().await?;
        let updated = conn
            .execute_params(
                "UPDATE _tidemark_migrations SET rolled_back = TRUE WHERE id = $1",
                &[&id],
            )
            .await?;
        if updated == 0 {
            return Err(MigrationError::NotFound(id.to_string()));
        }
        Ok(())
    }
}
