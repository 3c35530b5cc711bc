//! Checksum tracking for tamper detection.
//!
//! A checksum is the standard-base64 SHA-256 of the script with line endings
//! normalised to `\n` and trailing whitespace removed, so a checkout with
//! different line endings does not look like an edit.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{MigrateResult, MigrationError};
use crate::file::{MigrationFileManager, MigrationScript};
use crate::history::MigrationHistoryRepository;

/// Compute the checksum of script content.
pub fn compute_checksum(content: &str) -> String {
    let normalized = content.replace("\r\n", "\n").replace('\r', "\n");
    let mut hasher = Sha256::new();
    hasher.update(normalized.trim_end().as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Stored checksum of one migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumRecord {
    /// Migration identifier.
    pub migration_id: String,
    /// Stored checksum.
    pub checksum: String,
    /// Script path at the time it was stored.
    pub file_path: String,
    /// First time a checksum was stored. Upserts keep the original value.
    pub created_at: DateTime<Utc>,
    /// Last time the record was written.
    pub updated_at: DateTime<Utc>,
}

/// Immutable audit entry for a checksum repair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairRecord {
    /// Migration identifier.
    pub migration_id: String,
    /// Checksum before the repair, if one was stored.
    pub old_checksum: Option<String>,
    /// Checksum after the repair.
    pub new_checksum: String,
    /// When the repair happened.
    pub repaired_at: DateTime<Utc>,
    /// Who performed it.
    pub repaired_by: String,
    /// Whether the applied-history check was bypassed.
    pub forced: bool,
    /// Operator-supplied reason.
    pub reason: Option<String>,
}

/// Result of comparing a checksum against the stored one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecksumStatus {
    /// Matches the stored checksum.
    Valid,
    /// Differs from the stored checksum.
    Mismatch { stored: String, current: String },
    /// Nothing stored for this migration.
    NotFound,
}

impl ChecksumStatus {
    /// Whether the status is a mismatch.
    pub fn is_mismatch(&self) -> bool {
        matches!(self, Self::Mismatch { .. })
    }
}

/// A repair request.
#[derive(Debug, Clone)]
pub struct RepairRequest {
    /// Migration to repair.
    pub migration_id: String,
    /// Repair even if the migration is not in the applied history.
    pub force: bool,
    /// Who is repairing.
    pub actor: String,
    /// Why.
    pub reason: Option<String>,
}

impl RepairRequest {
    /// Create a non-forced request.
    pub fn new(migration_id: impl Into<String>, actor: impl Into<String>) -> Self {
        Self {
            migration_id: migration_id.into(),
            force: false,
            actor: actor.into(),
            reason: None,
        }
    }

    /// Bypass the applied-history check.
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Record a reason.
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Checksum storage.
#[async_trait::async_trait]
pub trait ChecksumRepository: Send + Sync {
    /// Create backing storage if needed.
    async fn initialize(&self) -> MigrateResult<()>;

    /// Stored checksum for a migration.
    async fn get(&self, migration_id: &str) -> MigrateResult<Option<ChecksumRecord>>;

    /// Insert or overwrite a checksum.
    async fn upsert(&self, record: ChecksumRecord) -> MigrateResult<()>;

    /// Append a repair audit entry. Entries are never modified.
    async fn append_repair(&self, record: RepairRecord) -> MigrateResult<()>;

    /// Repair entries for a migration, oldest first.
    async fn repairs(&self, migration_id: &str) -> MigrateResult<Vec<RepairRecord>>;

    /// All stored checksums.
    async fn all(&self) -> MigrateResult<Vec<ChecksumRecord>>;
}

/// Verifies, stores and repairs checksums.
pub struct ChecksumManager<C: ChecksumRepository> {
    repo: C,
}

impl<C: ChecksumRepository> ChecksumManager<C> {
    /// Create a manager over a repository.
    pub fn new(repo: C) -> Self {
        Self { repo }
    }

    /// Access the repository.
    pub fn repository(&self) -> &C {
        &self.repo
    }

    /// Compare `current` against the stored checksum.
    pub async fn verify(&self, migration_id: &str, current: &str) -> MigrateResult<ChecksumStatus> {
        Ok(match self.repo.get(migration_id).await? {
            None => ChecksumStatus::NotFound,
            Some(record) if record.checksum == current => ChecksumStatus::Valid,
            Some(record) => ChecksumStatus::Mismatch {
                stored: record.checksum,
                current: current.to_string(),
            },
        })
    }

    /// Verify a script's checksum.
    pub async fn verify_file(&self, script: &MigrationScript) -> MigrateResult<ChecksumStatus> {
        self.verify(&script.id, &script.checksum).await
    }

    /// Store a checksum, overwriting any previous value.
    pub async fn store(
        &self,
        migration_id: &str,
        checksum: &str,
        file_path: &str,
    ) -> MigrateResult<()> {
        self.repo
            .upsert(ChecksumRecord {
                migration_id: migration_id.to_string(),
                checksum: checksum.to_string(),
                file_path: file_path.to_string(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await?;
        info!(migration_id = %migration_id, checksum = %checksum, "Checksum stored");
        Ok(())
    }

    /// Recompute a checksum from the script file and overwrite the stored one.
    ///
    /// Refuses with [`MigrationError::NotApplied`] when the migration is not in
    /// the applied history, unless the request is forced.
    pub async fn repair<H>(
        &self,
        history: &H,
        files: &MigrationFileManager,
        request: RepairRequest,
    ) -> MigrateResult<RepairRecord>
    where
        H: MigrationHistoryRepository + ?Sized,
    {
        let id = &request.migration_id;
        if !request.force && !history.is_applied(id).await? {
            return Err(MigrationError::NotApplied(id.clone()));
        }

        let script = files
            .find_script(id)
            .await?
            .ok_or_else(|| MigrationError::NotFound(id.clone()))?;

        let old_checksum = self.repo.get(&script.id).await?.map(|r| r.checksum);
        let new_checksum = compute_checksum(&script.up_sql);

        self.repo
            .upsert(ChecksumRecord {
                migration_id: script.id.clone(),
                checksum: new_checksum.clone(),
                file_path: script.path.display().to_string(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await?;

        let record = RepairRecord {
            migration_id: script.id.clone(),
            old_checksum,
            new_checksum,
            repaired_at: Utc::now(),
            repaired_by: request.actor.clone(),
            forced: request.force,
            reason: request.reason.clone(),
        };
        self.repo.append_repair(record.clone()).await?;

        warn!(
            migration_id = %record.migration_id,
            old = record.old_checksum.as_deref().unwrap_or("-"),
            new = %record.new_checksum,
            actor = %record.repaired_by,
            forced = record.forced,
            "Checksum repaired"
        );
        Ok(record)
    }
}

/// SQL for the checksum and repair tables (PostgreSQL).
pub const POSTGRES_INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS "_tidemark_checksums" (
    migration_id VARCHAR(255) PRIMARY KEY,
    checksum VARCHAR(64) NOT NULL,
    file_path TEXT NOT NULL,
    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS "_tidemark_checksum_repairs" (
    id BIGSERIAL PRIMARY KEY,
    migration_id VARCHAR(255) NOT NULL,
    old_checksum VARCHAR(64),
    new_checksum VARCHAR(64) NOT NULL,
    repaired_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
    repaired_by VARCHAR(255) NOT NULL,
    forced BOOLEAN NOT NULL DEFAULT FALSE,
    reason TEXT
);

CREATE INDEX IF NOT EXISTS "_tidemark_checksum_repairs_migration_idx"
    ON "_tidemark_checksum_repairs" (migration_id, repaired_at);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::MigrationState;
    use crate::memory::{InMemoryChecksums, InMemoryHistory};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_checksum_is_base64_sha256() {
        let checksum = compute_checksum("CREATE TABLE users();");
        assert_eq!(checksum.len(), 44);
        assert!(checksum.ends_with('='));
    }

    #[test]
    fn test_checksum_normalizes_line_endings_and_trailing_space() {
        let unix = compute_checksum("SELECT 1;\nSELECT 2;\n");
        assert_eq!(unix, compute_checksum("SELECT 1;\r\nSELECT 2;\r\n"));
        assert_eq!(unix, compute_checksum("SELECT 1;\rSELECT 2;   \n\n"));
        assert_ne!(unix, compute_checksum("SELECT 1;\nSELECT 3;\n"));
    }

    #[tokio::test]
    async fn test_verify_states() {
        let manager = ChecksumManager::new(InMemoryChecksums::new());
        assert_eq!(manager.verify("m1", "abc").await.unwrap(), ChecksumStatus::NotFound);

        manager.store("m1", "abc", "m1.sql").await.unwrap();
        assert_eq!(manager.verify("m1", "abc").await.unwrap(), ChecksumStatus::Valid);
        assert_eq!(
            manager.verify("m1", "xyz").await.unwrap(),
            ChecksumStatus::Mismatch {
                stored: "abc".to_string(),
                current: "xyz".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_repair_requires_applied_history() {
        let dir = tempfile::tempdir().unwrap();
        let files = MigrationFileManager::new(dir.path());
        let script = files.write_sql("add users", "SELECT 1;", None).await.unwrap();

        let history = InMemoryHistory::new();
        let manager = ChecksumManager::new(InMemoryChecksums::new());
        manager.store(&script.id, "stale", "x").await.unwrap();

        let err = manager
            .repair(&history, &files, RepairRequest::new(&script.id, "ops"))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::NotApplied(_)));
        assert!(manager.repository().repairs(&script.id).await.unwrap().is_empty());

        history
            .record_state(&script.id, "stale", MigrationState::Completed, 5, None)
            .await
            .unwrap();
        let record = manager
            .repair(
                &history,
                &files,
                RepairRequest::new(&script.id, "ops").reason("whitespace edit"),
            )
            .await
            .unwrap();

        assert_eq!(record.old_checksum.as_deref(), Some("stale"));
        assert_eq!(record.new_checksum, script.checksum);
        assert_eq!(
            manager.verify_file(&script).await.unwrap(),
            ChecksumStatus::Valid
        );
        assert_eq!(manager.repository().repairs(&script.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_forced_repair_of_unapplied_migration() {
        let dir = tempfile::tempdir().unwrap();
        let files = MigrationFileManager::new(dir.path());
        let script = files.write_sql("seed", "SELECT 2;", None).await.unwrap();

        let manager = ChecksumManager::new(InMemoryChecksums::new());
        let record = manager
            .repair(
                &InMemoryHistory::new(),
                &files,
                RepairRequest::new(&script.id, "ops").force(true),
            )
            .await
            .unwrap();
        assert!(record.forced);
        assert_eq!(record.old_checksum, None);
    }
}
