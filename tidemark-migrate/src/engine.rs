//! Migration engine: ties files, history, locks, checksums and execution together.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::checksum::{ChecksumManager, ChecksumRepository, RepairRecord, RepairRequest};
use crate::config::EngineConfig;
use crate::conflict::{ConflictDetector, ConflictReport};
use crate::diff::ChangeDetector;
use crate::error::{MigrateResult, MigrationError};
use crate::file::{MigrationFileManager, MigrationScript, MigrationState};
use crate::history::{MigrationHistoryRepository, MigrationRecord};
use crate::introspect::{CatalogReader, IntrospectionResult, SchemaIntrospector};
use crate::lock::{Identity, LockHandle, LockManager, LockRepository, LockSweeper};
use crate::model::SchemaSnapshot;
use crate::sql::MigrationGenerator;
use crate::transaction::{
    RecoveryLog, RecoveryRecord, SavepointStrategy, SqlConnection, TransactionExecutor,
};
use crate::validate::{IssueSeverity, SnapshotChecker, split_statements, validate_sql};

/// A migration that failed to apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedMigration {
    /// Migration ID.
    pub id: String,
    /// SQLSTATE code, when the failure came from the database.
    pub code: Option<String>,
    /// Error message.
    pub error: String,
}

/// Result of a migration run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationResult {
    /// IDs of applied migrations, in order.
    pub applied: Vec<String>,
    /// Migrations that failed. Application stops at the first failure.
    pub failed: Vec<FailedMigration>,
    /// Migrations listed but not executed (dry run).
    pub skipped: Vec<String>,
    /// Warnings from the conflict scan and statement validation.
    pub warnings: Vec<String>,
    /// Total duration in milliseconds.
    pub duration_ms: i64,
}

impl MigrationResult {
    /// Whether nothing failed.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Get a summary of the result.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();

        if !self.applied.is_empty() {
            parts.push(format!("{} applied", self.applied.len()));
        }
        if !self.failed.is_empty() {
            parts.push(format!("{} failed", self.failed.len()));
        }
        if !self.skipped.is_empty() {
            parts.push(format!("{} skipped", self.skipped.len()));
        }

        if parts.is_empty() {
            "No migrations applied".to_string()
        } else {
            format!("{} in {}ms", parts.join(", "), self.duration_ms)
        }
    }
}

/// What `migrate` would do.
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    /// Pending scripts in application order.
    pub pending: Vec<MigrationScript>,
    /// Conflict scan of the migration set.
    pub conflicts: ConflictReport,
    /// Validation findings for pending scripts.
    pub warnings: Vec<String>,
}

impl MigrationPlan {
    /// Check if there's anything to migrate.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Check if there are blocking issues.
    pub fn has_blocking_issues(&self) -> bool {
        self.conflicts.blocks_apply()
    }

    /// Get a summary of the plan.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();

        if !self.pending.is_empty() {
            parts.push(format!("{} pending migrations", self.pending.len()));
        }
        if !self.conflicts.is_empty() {
            parts.push(format!("conflicts: {}", self.conflicts.summary()));
        }
        if !self.warnings.is_empty() {
            parts.push(format!("{} warnings", self.warnings.len()));
        }

        if parts.is_empty() {
            "No changes to apply".to_string()
        } else {
            parts.join("; ")
        }
    }
}

/// Migration status information.
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    /// Applied migrations.
    pub applied: Vec<MigrationRecord>,
    /// Pending migration IDs.
    pub pending: Vec<String>,
    /// Migrations whose last attempt failed or never finished.
    pub failed: Vec<MigrationRecord>,
    /// Total number of applied migrations.
    pub total_applied: usize,
    /// Total number of pending migrations.
    pub total_pending: usize,
}

/// The main migration engine.
pub struct MigrationEngine<H, L, C, R>
where
    H: MigrationHistoryRepository,
    L: LockRepository + 'static,
    C: ChecksumRepository,
    R: RecoveryLog,
{
    config: EngineConfig,
    history: H,
    locks: LockManager<L>,
    checksums: ChecksumManager<C>,
    executor: TransactionExecutor<R>,
    files: MigrationFileManager,
    generator: MigrationGenerator,
}

impl<H, L, C, R> MigrationEngine<H, L, C, R>
where
    H: MigrationHistoryRepository,
    L: LockRepository + 'static,
    C: ChecksumRepository,
    R: RecoveryLog,
{
    /// Create a new migration engine.
    pub fn new(config: EngineConfig, history: H, locks: L, checksums: C, recovery: R) -> Self {
        let files = MigrationFileManager::new(&config.migrations_dir);
        Self {
            config,
            history,
            locks: LockManager::new(locks),
            checksums: ChecksumManager::new(checksums),
            executor: TransactionExecutor::new(Arc::new(recovery)),
            files,
            generator: MigrationGenerator,
        }
    }

    /// Act as a specific identity when taking locks.
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.locks = self.locks.with_identity(identity);
        self
    }

    /// Get the configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Get the history repository.
    pub fn history(&self) -> &H {
        &self.history
    }

    /// Get the lock manager.
    pub fn locks(&self) -> &LockManager<L> {
        &self.locks
    }

    /// Get the checksum manager.
    pub fn checksums(&self) -> &ChecksumManager<C> {
        &self.checksums
    }

    /// Get the file manager.
    pub fn files(&self) -> &MigrationFileManager {
        &self.files
    }

    /// Initialize the migration system.
    pub async fn initialize(&self) -> MigrateResult<()> {
        self.files.ensure_dir().await?;
        self.history.initialize().await?;
        self.locks.repository().initialize().await?;
        self.checksums.repository().initialize().await?;
        self.executor.recovery_log().initialize().await?;
        info!(dir = %self.files.migrations_dir().display(), "Migration system initialized");
        Ok(())
    }

    /// Capture the live schema.
    pub async fn capture<Cat>(&self, catalog: &Cat) -> MigrateResult<IntrospectionResult>
    where
        Cat: CatalogReader + ?Sized,
    {
        SchemaIntrospector::new(self.config.introspection())
            .capture(catalog)
            .await
    }

    /// Load the recorded baseline; an empty snapshot when none was recorded.
    pub async fn load_baseline(&self) -> MigrateResult<SchemaSnapshot> {
        if tokio::fs::try_exists(&self.config.baseline_path).await? {
            SchemaSnapshot::load(&self.config.baseline_path).await
        } else {
            Ok(SchemaSnapshot::new(self.config.database_schema.clone()))
        }
    }

    /// Plan migrations: conflict scan, pending list and validation findings.
    pub async fn plan(&self) -> MigrateResult<MigrationPlan> {
        let conflicts =
            ConflictDetector::scan(&self.files, &self.history, self.checksums.repository()).await?;

        let applied: HashSet<String> = self
            .history
            .get_applied()
            .await?
            .into_iter()
            .map(|r| r.id)
            .collect();

        let pending: Vec<MigrationScript> = self
            .files
            .list_scripts()
            .await?
            .into_iter()
            .filter(|s| !applied.contains(&s.id))
            .collect();

        let mut warnings = Vec::new();
        for script in &pending {
            for issue in validate_sql(&script.up_sql) {
                if issue.severity >= IssueSeverity::Warning {
                    warnings.push(format!("{}:{}: {}", script.id, issue.line, issue.message));
                }
            }
        }

        Ok(MigrationPlan {
            pending,
            conflicts,
            warnings,
        })
    }

    /// Apply pending migrations.
    ///
    /// Refuses when the conflict scan finds blocking problems, or warnings
    /// that the configuration does not acknowledge. When `live` is
    /// given, each script is checked against it (and the tables created by
    /// earlier scripts) before it runs.
    pub async fn migrate<Conn>(
        &self,
        conn: &mut Conn,
        live: Option<&SchemaSnapshot>,
    ) -> MigrateResult<MigrationResult>
    where
        Conn: SqlConnection + ?Sized,
    {
        let start = Instant::now();
        let plan = self.plan().await?;

        if plan.has_blocking_issues() {
            for conflict in plan.conflicts.conflicts.iter().filter(|c| c.is_blocking()) {
                warn!(kind = ?conflict.conflict_type, "{}", conflict.description);
            }
            return Err(MigrationError::BlockingConflicts(
                plan.conflicts.blocking_count(),
            ));
        }

        if plan.conflicts.requires_acknowledgement()
            && !self.config.acknowledge_warnings
            && !self.config.dry_run
        {
            for conflict in &plan.conflicts.conflicts {
                warn!(kind = ?conflict.conflict_type, "{}", conflict.description);
            }
            return Err(MigrationError::UnacknowledgedWarnings(
                plan.conflicts.conflicts.len(),
            ));
        }

        let mut result = MigrationResult {
            warnings: plan.warnings.clone(),
            ..MigrationResult::default()
        };
        for conflict in &plan.conflicts.conflicts {
            result.warnings.push(conflict.description.clone());
        }

        if self.config.dry_run {
            for script in &plan.pending {
                result.skipped.push(script.id.clone());
                result
                    .warnings
                    .push(format!("[DRY RUN] Would apply: {}", script.id));
            }
            result.duration_ms = start.elapsed().as_millis() as i64;
            return Ok(result);
        }

        if plan.pending.is_empty() {
            debug!("No pending migrations");
            result.duration_ms = start.elapsed().as_millis() as i64;
            return Ok(result);
        }

        let handle = self.locks.acquire(&self.config.lock_request("migrate")).await?;
        let outcome = self
            .apply_pending(conn, &plan.pending, live, &handle, &mut result)
            .await;
        let released = self.locks.release(&handle).await;
        outcome?;
        released?;

        result.duration_ms = start.elapsed().as_millis() as i64;
        info!(summary = %result.summary(), "Migration run finished");
        Ok(result)
    }

    async fn apply_pending<Conn>(
        &self,
        conn: &mut Conn,
        pending: &[MigrationScript],
        live: Option<&SchemaSnapshot>,
        handle: &LockHandle,
        result: &mut MigrationResult,
    ) -> MigrateResult<()>
    where
        Conn: SqlConnection + ?Sized,
    {
        let mut checker = live.map(SnapshotChecker::new);

        for script in pending {
            if handle.is_expired() {
                warn!(lock_id = %handle.lock_id, "Migration lock TTL passed while applying");
            }

            let applied = match checker.as_mut() {
                Some(checker) => match checker.check(&script.up_sql) {
                    Ok(()) => self.apply_script(conn, script).await,
                    Err(e) => Err(e),
                },
                None => self.apply_script(conn, script).await,
            };

            match applied {
                Ok(()) => result.applied.push(script.id.clone()),
                Err(e) => {
                    warn!(migration_id = %script.id, error = %e, "Migration failed");
                    self.history
                        .record_state(
                            &script.id,
                            &script.checksum,
                            MigrationState::Failed,
                            0,
                            Some(&e.to_string()),
                        )
                        .await?;
                    result.failed.push(FailedMigration {
                        id: script.id.clone(),
                        code: e.sql_state().map(str::to_string),
                        error: e.to_string(),
                    });
                    break;
                }
            }
        }
        Ok(())
    }

    /// Apply a single script inside a transaction.
    async fn apply_script<Conn>(&self, conn: &mut Conn, script: &MigrationScript) -> MigrateResult<()>
    where
        Conn: SqlConnection + ?Sized,
    {
        info!(migration_id = %script.id, "Applying migration");
        let started = Instant::now();

        self.history
            .record_state(&script.id, &script.checksum, MigrationState::InProgress, 0, None)
            .await?;

        let statements = split_statements(&script.up_sql)
            .into_iter()
            .map(|s| s.sql)
            .collect();
        let report = self
            .executor
            .apply_statements(conn, &script.id, statements, self.config.savepoint_strategy)
            .await?;

        if let Some(first) = report.failures.first() {
            return Err(MigrationError::execution(
                &script.id,
                first.code.clone(),
                format!(
                    "{} statement(s) failed; first at #{}: {}",
                    report.failures.len(),
                    first.index + 1,
                    first.message
                ),
            ));
        }

        let duration_ms = started.elapsed().as_millis() as i64;
        self.history
            .record_applied(&script.id, &script.checksum, duration_ms)
            .await?;
        self.checksums
            .store(&script.id, &script.checksum, &script.path.display().to_string())
            .await?;

        info!(migration_id = %script.id, duration_ms, statements = report.executed, "Migration applied");
        Ok(())
    }

    /// Roll back the last applied migration using its DOWN script.
    pub async fn rollback<Conn>(&self, conn: &mut Conn) -> MigrateResult<Option<String>>
    where
        Conn: SqlConnection + ?Sized,
    {
        let Some(last) = self.history.get_last_applied().await? else {
            return Ok(None);
        };

        if self.config.dry_run {
            return Ok(Some(format!("[DRY RUN] Would rollback: {}", last.id)));
        }

        let script = self
            .files
            .find_script(&last.id)
            .await?
            .ok_or_else(|| MigrationError::NotFound(last.id.clone()))?;
        let Some(down_sql) = script.down_sql.clone() else {
            return Err(MigrationError::RollbackFailed(format!(
                "Migration '{}' has no down migration",
                script.id
            )));
        };

        let handle = self.locks.acquire(&self.config.lock_request(&script.id)).await?;
        let outcome = async {
            let statements = split_statements(&down_sql)
                .into_iter()
                .map(|s| s.sql)
                .collect();
            self.executor
                .apply_statements(conn, &script.id, statements, SavepointStrategy::None)
                .await?;
            self.history.record_rollback(&script.id).await
        }
        .await;
        let released = self.locks.release(&handle).await;
        outcome?;
        released?;

        info!(migration_id = %script.id, "Migration rolled back");
        Ok(Some(script.id))
    }

    /// Create a migration from the difference between two snapshots.
    ///
    /// Writes the UP and DOWN files and records `current` as the new baseline.
    pub async fn create_migration(
        &self,
        name: &str,
        baseline: &SchemaSnapshot,
        current: &SchemaSnapshot,
    ) -> MigrateResult<MigrationScript> {
        let changes = ChangeDetector::detect(baseline, current);
        if changes.is_empty() {
            return Err(MigrationError::NoChanges);
        }
        if changes.has_destructive_changes() && !self.config.allow_destructive {
            return Err(MigrationError::data_loss(format!(
                "{}. Set allow_destructive to generate it anyway",
                changes.summary()
            )));
        }

        let generated = self.generator.generate(&changes);
        let script = self.files.write_script(name, &generated).await?;
        current.save(&self.config.baseline_path).await?;

        info!(id = %script.id, changes = %changes.summary(), "Migration created");
        Ok(script)
    }

    /// Capture the live schema and create a migration against the baseline.
    pub async fn create_from_database<Cat>(
        &self,
        name: &str,
        catalog: &Cat,
    ) -> MigrateResult<MigrationScript>
    where
        Cat: CatalogReader + ?Sized,
    {
        let baseline = self.load_baseline().await?;
        let captured = self.capture(catalog).await?;
        for warning in &captured.warnings {
            warn!(warning = %warning, "Introspection warning");
        }
        self.create_migration(name, &baseline, &captured.snapshot).await
    }

    /// Get migration status.
    pub async fn status(&self) -> MigrateResult<MigrationStatus> {
        let records = self.history.get_all().await?;
        let scripts = self.files.list_scripts().await?;

        let applied: Vec<MigrationRecord> =
            records.iter().filter(|r| r.is_applied()).cloned().collect();
        let failed: Vec<MigrationRecord> = records
            .iter()
            .filter(|r| matches!(r.state, MigrationState::Failed | MigrationState::InProgress))
            .cloned()
            .collect();

        let applied_ids: HashSet<&str> = applied.iter().map(|r| r.id.as_str()).collect();
        let pending: Vec<String> = scripts
            .iter()
            .filter(|s| !applied_ids.contains(s.id.as_str()))
            .map(|s| s.id.clone())
            .collect();

        Ok(MigrationStatus {
            total_applied: applied.len(),
            total_pending: pending.len(),
            applied,
            pending,
            failed,
        })
    }

    /// Repair a stored checksum.
    pub async fn repair_checksum(&self, request: RepairRequest) -> MigrateResult<RepairRecord> {
        self.checksums
            .repair(&self.history, &self.files, request)
            .await
    }

    /// Release every active lock.
    pub async fn force_release_locks(&self, actor: &str) -> MigrateResult<u64> {
        self.locks.force_release_all(actor).await
    }

    /// Start the background stale-lock sweeper.
    pub fn spawn_lock_sweeper(&self) -> LockSweeper {
        self.locks.spawn_sweeper(self.config.lock_sweep_interval())
    }

    /// Recovery records awaiting attention.
    pub async fn unresolved_recoveries(&self) -> MigrateResult<Vec<RecoveryRecord>> {
        self.executor.recovery_log().unresolved().await
    }

    /// Mark a recovery record handled.
    pub async fn resolve_recovery(&self, id: i64) -> MigrateResult<bool> {
        self.executor.recovery_log().resolve(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{
        InMemoryChecksums, InMemoryHistory, InMemoryLocks, InMemoryRecoveryLog,
        RecordingConnection,
    };
    use crate::model::{Column, Table};
    use pretty_assertions::assert_eq;

    type TestEngine =
        MigrationEngine<InMemoryHistory, InMemoryLocks, InMemoryChecksums, InMemoryRecoveryLog>;

    fn engine(dir: &std::path::Path, config: EngineConfig) -> TestEngine {
        MigrationEngine::new(
            config
                .migrations_dir(dir.join("migrations"))
                .baseline_path(dir.join("baseline.json")),
            InMemoryHistory::new(),
            InMemoryLocks::new(),
            InMemoryChecksums::new(),
            InMemoryRecoveryLog::new(),
        )
        .with_identity(Identity::new("tester", "localhost", 1))
    }

    #[test]
    fn test_result_summary() {
        let mut result = MigrationResult::default();
        assert_eq!(result.summary(), "No migrations applied");

        result.applied.push("a".into());
        result.failed.push(FailedMigration {
            id: "b".into(),
            code: None,
            error: "boom".into(),
        });
        result.duration_ms = 12;
        assert_eq!(result.summary(), "1 applied, 1 failed in 12ms");
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn test_migrate_applies_pending_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), EngineConfig::new());
        engine.initialize().await.unwrap();

        let first = engine
            .files()
            .write_sql("create users", "CREATE TABLE users (id int);", Some("DROP TABLE users;"))
            .await
            .unwrap();
        let second = engine
            .files()
            .write_sql("add email", "ALTER TABLE users ADD COLUMN email text;", Some("ALTER TABLE users DROP COLUMN email;"))
            .await
            .unwrap();

        let mut conn = RecordingConnection::new();
        let result = engine.migrate(&mut conn, None).await.unwrap();

        assert_eq!(result.applied, vec![first.id.clone(), second.id.clone()]);
        assert!(result.is_success());
        assert_eq!(
            conn.committed(),
            vec![
                "CREATE TABLE users (id int)",
                "ALTER TABLE users ADD COLUMN email text"
            ]
        );
        assert!(engine.history().is_applied(&second.id).await.unwrap());
        assert_eq!(
            engine.checksums().verify_file(&second).await.unwrap(),
            crate::checksum::ChecksumStatus::Valid
        );
        assert!(engine.locks().repository().active().await.unwrap().is_none());

        let again = engine.migrate(&mut conn, None).await.unwrap();
        assert!(again.applied.is_empty());
    }

    #[tokio::test]
    async fn test_failed_migration_stops_run_and_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), EngineConfig::new());
        engine.initialize().await.unwrap();

        let bad = engine
            .files()
            .write_sql("bad", "SELECT broken;", Some("SELECT 1;"))
            .await
            .unwrap();
        engine
            .files()
            .write_sql("after", "SELECT 2;", Some("SELECT 1;"))
            .await
            .unwrap();

        let mut conn = RecordingConnection::new().fail_on("broken", "42703");
        let result = engine.migrate(&mut conn, None).await.unwrap();

        assert!(result.applied.is_empty());
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].code.as_deref(), Some("42703"));

        let status = engine.status().await.unwrap();
        assert_eq!(status.failed.len(), 1);
        assert_eq!(status.failed[0].id, bad.id);
        assert_eq!(status.total_pending, 2);
        assert_eq!(engine.unresolved_recoveries().await.unwrap().len(), 1);
        assert!(engine.locks().repository().active().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blocking_conflicts_refuse_to_migrate() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), EngineConfig::new());
        engine.initialize().await.unwrap();

        let migrations = dir.path().join("migrations");
        tokio::fs::write(migrations.join("20240101000000_a.sql"), "SELECT 1;")
            .await
            .unwrap();
        tokio::fs::write(migrations.join("20240101000000_b.sql"), "SELECT 2;")
            .await
            .unwrap();

        let mut conn = RecordingConnection::new();
        let err = engine.migrate(&mut conn, None).await.unwrap_err();
        assert!(matches!(err, MigrationError::BlockingConflicts(1)));
        assert!(conn.log().is_empty());
    }

    #[tokio::test]
    async fn test_schema_conflict_fails_the_script() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), EngineConfig::new());
        engine.initialize().await.unwrap();
        engine
            .files()
            .write_sql("alter ghost", "ALTER TABLE ghosts ADD COLUMN x int;", Some("SELECT 1;"))
            .await
            .unwrap();

        let live = SchemaSnapshot::new("public");
        let mut conn = RecordingConnection::new();
        let result = engine.migrate(&mut conn, Some(&live)).await.unwrap();

        assert_eq!(result.failed.len(), 1);
        assert!(result.failed[0].error.contains("ghosts"));
        assert!(conn.log().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_executes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), EngineConfig::new().dry_run(true));
        engine.initialize().await.unwrap();
        let script = engine
            .files()
            .write_sql("noop", "SELECT 1;", None)
            .await
            .unwrap();

        let mut conn = RecordingConnection::new();
        let result = engine.migrate(&mut conn, None).await.unwrap();

        assert_eq!(result.skipped, vec![script.id]);
        assert!(conn.log().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_runs_down_script() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), EngineConfig::new());
        engine.initialize().await.unwrap();
        let script = engine
            .files()
            .write_sql("create t", "CREATE TABLE t (id int);", Some("DROP TABLE t;"))
            .await
            .unwrap();

        let mut conn = RecordingConnection::new();
        engine.migrate(&mut conn, None).await.unwrap();
        let rolled_back = engine.rollback(&mut conn).await.unwrap();

        assert_eq!(rolled_back, Some(script.id.clone()));
        let committed = conn.committed();
        assert_eq!(committed.last().map(String::as_str), Some("DROP TABLE t"));
        assert!(!engine.history().is_applied(&script.id).await.unwrap());
        assert_eq!(engine.rollback(&mut conn).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_create_migration_writes_files_and_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), EngineConfig::new());
        engine.initialize().await.unwrap();

        let baseline = engine.load_baseline().await.unwrap();
        assert!(baseline.tables.is_empty());

        let current = SchemaSnapshot::new("public").with_table(
            Table::new("public", "users").with_column(Column::new("id", "integer").primary_key()),
        );
        let script = engine
            .create_migration("create users", &baseline, &current)
            .await
            .unwrap();

        assert!(script.up_sql.contains("CREATE TABLE \"public\".\"users\""));
        assert!(script.is_reversible());
        assert!(engine.load_baseline().await.unwrap().structurally_eq(&current));

        let err = engine
            .create_migration("again", &current, &current)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::NoChanges));
    }

    #[tokio::test]
    async fn test_destructive_changes_need_opt_in() {
        let dir = tempfile::tempdir().unwrap();
        let strict = engine(dir.path(), EngineConfig::new());
        let baseline = SchemaSnapshot::new("public").with_table(Table::new("public", "old"));
        let current = SchemaSnapshot::new("public");

        let err = strict
            .create_migration("drop old", &baseline, &current)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::DataLoss(_)));

        let permissive = engine(dir.path(), EngineConfig::new().allow_destructive(true));
        let script = permissive
            .create_migration("drop old", &baseline, &current)
            .await
            .unwrap();
        assert!(script.up_sql.contains("-- WARNING:"));
    }
}
