//! Migration history tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MigrateResult;
use crate::file::MigrationState;

/// A record of a migration execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Migration ID.
    pub id: String,
    /// Checksum of the migration content when it ran.
    pub checksum: String,
    /// Lifecycle state.
    pub state: MigrationState,
    /// When the state was last recorded.
    pub applied_at: DateTime<Utc>,
    /// Duration of the migration in milliseconds.
    pub duration_ms: i64,
    /// Whether this migration was rolled back.
    pub rolled_back: bool,
    /// Failure message for FAILED records.
    pub error: Option<String>,
}

impl MigrationRecord {
    /// Whether the migration currently counts as applied.
    pub fn is_applied(&self) -> bool {
        self.state == MigrationState::Completed && !self.rolled_back
    }

    /// Version prefix of the identifier.
    pub fn version(&self) -> &str {
        self.id.split_once('_').map_or(self.id.as_str(), |(v, _)| v)
    }
}

/// Migration history repository.
#[async_trait::async_trait]
pub trait MigrationHistoryRepository: Send + Sync {
    /// Initialize the migrations table.
    async fn initialize(&self) -> MigrateResult<()>;

    /// Get every record, applied or not, ordered by ID.
    async fn get_all(&self) -> MigrateResult<Vec<MigrationRecord>>;

    /// Insert or update the record for a migration.
    async fn record_state(
        &self,
        id: &str,
        checksum: &str,
        state: MigrationState,
        duration_ms: i64,
        error: Option<&str>,
    ) -> MigrateResult<()>;

    /// Mark a migration as rolled back.
    async fn record_rollback(&self, id: &str) -> MigrateResult<()>;

    /// Get all applied migrations, ordered by ID.
    async fn get_applied(&self) -> MigrateResult<Vec<MigrationRecord>> {
        Ok(self
            .get_all()
            .await?
            .into_iter()
            .filter(MigrationRecord::is_applied)
            .collect())
    }

    /// Check if a migration has been applied.
    async fn is_applied(&self, id: &str) -> MigrateResult<bool> {
        Ok(self.get_applied().await?.iter().any(|r| r.id == id))
    }

    /// Record a migration as applied.
    async fn record_applied(
        &self,
        id: &str,
        checksum: &str,
        duration_ms: i64,
    ) -> MigrateResult<()> {
        self.record_state(id, checksum, MigrationState::Completed, duration_ms, None)
            .await
    }

    /// Get the last applied migration.
    async fn get_last_applied(&self) -> MigrateResult<Option<MigrationRecord>> {
        Ok(self.get_applied().await?.into_iter().last())
    }
}

/// SQL for initializing the migrations table (PostgreSQL).
pub const POSTGRES_INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS "_tidemark_migrations" (
    id VARCHAR(255) PRIMARY KEY,
    checksum VARCHAR(64) NOT NULL,
    state VARCHAR(16) NOT NULL DEFAULT 'PENDING',
    applied_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
    duration_ms BIGINT NOT NULL DEFAULT 0,
    rolled_back BOOLEAN NOT NULL DEFAULT FALSE,
    error TEXT
);

CREATE INDEX IF NOT EXISTS "_tidemark_migrations_applied_at_idx"
    ON "_tidemark_migrations" (applied_at DESC);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryHistory;

    #[test]
    fn test_migration_record() {
        let record = MigrationRecord {
            id: "20231215120000_create_users".to_string(),
            checksum: "abc123".to_string(),
            state: MigrationState::Completed,
            applied_at: Utc::now(),
            duration_ms: 150,
            rolled_back: false,
            error: None,
        };

        assert!(record.is_applied());
        assert_eq!(record.version(), "20231215120000");
    }

    #[test]
    fn test_init_sql_has_table() {
        assert!(POSTGRES_INIT_SQL.contains("_tidemark_migrations"));
        assert!(POSTGRES_INIT_SQL.contains("checksum"));
        assert!(POSTGRES_INIT_SQL.contains("state"));
    }

    #[tokio::test]
    async fn test_default_methods_follow_state() {
        let history = InMemoryHistory::new();
        history
            .record_state("20240101000000_a", "c1", MigrationState::InProgress, 0, None)
            .await
            .unwrap();
        assert!(!history.is_applied("20240101000000_a").await.unwrap());

        history.record_applied("20240101000000_a", "c1", 12).await.unwrap();
        history
            .record_state("20240102000000_b", "c2", MigrationState::Failed, 3, Some("boom"))
            .await
            .unwrap();
        history.record_applied("20240103000000_c", "c3", 7).await.unwrap();

        let applied = history.get_applied().await.unwrap();
        assert_eq!(applied.len(), 2);
        assert_eq!(
            history.get_last_applied().await.unwrap().unwrap().id,
            "20240103000000_c"
        );

        history.record_rollback("20240103000000_c").await.unwrap();
        assert_eq!(
            history.get_last_applied().await.unwrap().unwrap().id,
            "20240101000000_a"
        );
        assert_eq!(history.get_all().await.unwrap().len(), 3);
    }
}
