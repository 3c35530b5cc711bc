//! Checksum and repair tables on PostgreSQL.

use tidemark_migrate::checksum::POSTGRES_INIT_SQL;
use tidemark_migrate::{ChecksumRecord, ChecksumRepository, MigrateResult, RepairRecord};
use tokio_postgres::Row;

use crate::error::PgResult;
use crate::pool::PgPool;
use crate::row::PgRow;

/// [`ChecksumRepository`] backed by `_tidemark_checksums` and
/// `_tidemark_checksum_repairs`.
#[derive(Clone)]
pub struct PgChecksumStore {
    pool: PgPool,
}

impl PgChecksumStore {
    /// Create a checksum store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn checksum_record(row: &Row) -> PgResult<ChecksumRecord> {
    Ok(ChecksumRecord {
        migration_id: row.get_value("migration_id")?,
        checksum: row.get_value("checksum")?,
        file_path: row.get_value("file_path")?,
        created_at: row.get_value("created_at")?,
        updated_at: row.get_value("updated_at")?,
    })
}

fn repair_record(row: &Row) -> PgResult<RepairRecord> {
    Ok(RepairRecord {
        migration_id: row.get_value("migration_id")?,
        old_checksum: row.get_opt("old_checksum")?,
        new_checksum: row.get_value("new_checksum")?,
        repaired_at: row.get_value("repaired_at")?,
        repaired_by: row.get_value("repaired_by")?,
        forced: row.get_value("forced")?,
        reason: row.get_opt("reason")?,
    })
}

#[async_trait::async_trait]
impl ChecksumRepository for PgChecksumStore {
    async fn initialize(&self) -> MigrateResult<()> {
        let conn = self.pool.get().await?;
        conn.batch(POSTGRES_INIT_SQL).await?;
        Ok(())
    }

    async fn get(&self, migration_id: &str) -> MigrateResult<Option<ChecksumRecord>> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                "SELECT migration_id, checksum, file_path, created_at, updated_at \
                 FROM _tidemark_checksums WHERE migration_id = $1",
                &[&migration_id],
            )
            .await?;
        Ok(row.as_ref().map(checksum_record).transpose()?)
    }

    async fn upsert(&self, record: ChecksumRecord) -> MigrateResult<()> {
        let conn = self.pool.get().await?;
        conn.execute_params(
            "INSERT INTO _tidemark_checksums (migration_id, checksum, file_path, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (migration_id) DO UPDATE \
             SET checksum = EXCLUDED.checksum, file_path = EXCLUDED.file_path, updated_at = EXCLUDED.updated_at",
            &[
                &record.migration_id,
                &record.checksum,
                &record.file_path,
                &record.created_at,
                &record.updated_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn append_repair(&self, record: RepairRecord) -> MigrateResult<()> {
        let conn = self.pool.get().await?;
        conn.execute_params(
            "INSERT INTO _tidemark_checksum_repairs \
             (migration_id, old_checksum, new_checksum, repaired_at, repaired_by, forced, reason) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            &[
                &record.migration_id,
                &record.old_checksum,
                &record.new_checksum,
                &record.repaired_at,
                &record.repaired_by,
                &record.forced,
                &record.reason,
            ],
        )
        .await?;
        Ok(())
    }

    async fn repairs(&self, migration_id: &str) -> MigrateResult<Vec<RepairRecord>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT migration_id, old_checksum, new_checksum, repaired_at, repaired_by, forced, reason \
                 FROM _tidemark_checksum_repairs WHERE migration_id = $1 \
                 ORDER BY repaired_at, id",
                &[&migration_id],
            )
            .await?;
        Ok(rows.iter().map(repair_record).collect::<PgResult<Vec<_>>>()?)
    }

    async fn all(&self) -> MigrateResult<Vec<ChecksumRecord>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT migration_id, checksum, file_path, created_at, updated_at \
                 FROM _tidemark_checksums ORDER BY migration_id",
                &[],
            )
            .await?;
        Ok(rows.iter().map(checksum_record).collect::<PgResult<Vec<_>>>()?)
    }
}
