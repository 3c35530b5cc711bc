//! Transactional execution with savepoints and a recovery log.
//!
//! [`TransactionExecutor::run`] wraps a unit of work in BEGIN/COMMIT. If the
//! work fails, the transaction is rolled back and a [`RecoveryRecord`]
//! describing the failure (error, savepoint stack, last statement) is written
//! to the [`RecoveryLog`]. Backends write that log through a connection of its
//! own, so the record survives the rollback.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{MigrateResult, MigrationError};

/// Minimal SQL connection used to apply migrations.
#[async_trait::async_trait]
pub trait SqlConnection: Send {
    /// Execute one statement, returning the affected row count.
    async fn execute(&mut self, sql: &str) -> MigrateResult<u64>;

    /// Execute a multi-statement script.
    async fn batch_execute(&mut self, sql: &str) -> MigrateResult<()>;

    /// Run a query and return the first column of the first row as text.
    async fn query_scalar(&mut self, sql: &str) -> MigrateResult<Option<String>>;

    /// Start a transaction.
    async fn begin(&mut self) -> MigrateResult<()> {
        self.batch_execute("BEGIN").await
    }

    /// Commit the open transaction.
    async fn commit(&mut self) -> MigrateResult<()> {
        self.batch_execute("COMMIT").await
    }

    /// Roll back the open transaction.
    async fn rollback(&mut self) -> MigrateResult<()> {
        self.batch_execute("ROLLBACK").await
    }
}

/// A persisted description of a failed migration transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryRecord {
    /// Assigned by the log on insert.
    pub id: Option<i64>,
    /// Migration whose transaction failed.
    pub migration_id: String,
    /// When the failure was recorded.
    pub created_at: DateTime<Utc>,
    /// `{ "error", "code", "savepoints", "statement" }`.
    pub recovery_data: serde_json::Value,
    /// Whether an operator has dealt with it.
    pub resolved: bool,
}

/// Append-only log of failed transactions.
#[async_trait::async_trait]
pub trait RecoveryLog: Send + Sync {
    /// Create the recovery table.
    async fn initialize(&self) -> MigrateResult<()>;

    /// Store a record, returning its id.
    async fn record(&self, record: RecoveryRecord) -> MigrateResult<i64>;

    /// Records not yet marked resolved, oldest first.
    async fn unresolved(&self) -> MigrateResult<Vec<RecoveryRecord>>;

    /// Mark a record resolved. Returns whether it existed.
    async fn resolve(&self, id: i64) -> MigrateResult<bool>;
}

/// How statements of a script are isolated from each other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SavepointStrategy {
    /// The first failure aborts the whole transaction.
    #[default]
    None,
    /// Each statement runs under its own savepoint; failures are rolled back
    /// to it and collected while the rest continue.
    PerStatement,
}

/// Validate a savepoint name against `^[A-Za-z_][A-Za-z0-9_]{0,62}$`.
pub fn validate_savepoint_name(name: &str) -> MigrateResult<()> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.len() <= 63;
    if valid {
        Ok(())
    } else {
        Err(MigrationError::InvalidSavepoint(name.to_string()))
    }
}

/// An open transaction handed to a unit of work.
pub struct Transaction<'c, C: SqlConnection + ?Sized> {
    conn: &'c mut C,
    migration_id: String,
    savepoints: Vec<String>,
    last_statement: Option<String>,
}

impl<'c, C: SqlConnection + ?Sized> Transaction<'c, C> {
    fn new(conn: &'c mut C, migration_id: &str) -> Self {
        Self {
            conn,
            migration_id: migration_id.to_string(),
            savepoints: Vec::new(),
            last_statement: None,
        }
    }

    /// Migration this transaction belongs to.
    pub fn migration_id(&self) -> &str {
        &self.migration_id
    }

    /// Open savepoints, outermost first.
    pub fn savepoints(&self) -> &[String] {
        &self.savepoints
    }

    /// The most recently attempted statement.
    pub fn last_statement(&self) -> Option<&str> {
        self.last_statement.as_deref()
    }

    /// Execute one statement.
    pub async fn execute(&mut self, sql: &str) -> MigrateResult<u64> {
        self.last_statement = Some(sql.to_string());
        debug!(migration_id = %self.migration_id, sql = %sql, "Executing statement");
        self.conn
            .execute(sql)
            .await
            .map_err(|e| e.in_migration(&self.migration_id))
    }

    /// Execute a multi-statement script.
    pub async fn batch_execute(&mut self, sql: &str) -> MigrateResult<()> {
        self.last_statement = Some(sql.to_string());
        debug!(migration_id = %self.migration_id, "Executing script");
        self.conn
            .batch_execute(sql)
            .await
            .map_err(|e| e.in_migration(&self.migration_id))
    }

    /// Query a single value.
    pub async fn query_scalar(&mut self, sql: &str) -> MigrateResult<Option<String>> {
        self.conn
            .query_scalar(sql)
            .await
            .map_err(|e| e.in_migration(&self.migration_id))
    }

    /// Push a savepoint.
    pub async fn savepoint(&mut self, name: &str) -> MigrateResult<()> {
        validate_savepoint_name(name)?;
        self.conn
            .batch_execute(&format!("SAVEPOINT {}", name))
            .await
            .map_err(|e| e.in_migration(&self.migration_id))?;
        self.savepoints.push(name.to_string());
        Ok(())
    }

    /// Roll back to a savepoint. It stays open; newer ones are discarded.
    pub async fn rollback_to(&mut self, name: &str) -> MigrateResult<()> {
        let position = self.position(name)?;
        self.conn
            .batch_execute(&format!("ROLLBACK TO SAVEPOINT {}", name))
            .await
            .map_err(|e| e.in_migration(&self.migration_id))?;
        self.savepoints.truncate(position + 1);
        Ok(())
    }

    /// Release a savepoint and every newer one.
    pub async fn release(&mut self, name: &str) -> MigrateResult<()> {
        let position = self.position(name)?;
        self.conn
            .batch_execute(&format!("RELEASE SAVEPOINT {}", name))
            .await
            .map_err(|e| e.in_migration(&self.migration_id))?;
        self.savepoints.truncate(position);
        Ok(())
    }

    fn position(&self, name: &str) -> MigrateResult<usize> {
        validate_savepoint_name(name)?;
        self.savepoints
            .iter()
            .rposition(|s| s == name)
            .ok_or_else(|| MigrationError::InvalidSavepoint(format!("{} is not open", name)))
    }
}

/// One failed statement under [`SavepointStrategy::PerStatement`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementFailure {
    /// Zero-based position in the script.
    pub index: usize,
    /// Statement text.
    pub statement: String,
    /// SQLSTATE, when the driver reported one.
    pub code: Option<String>,
    /// Error message.
    pub message: String,
}

/// Outcome of [`TransactionExecutor::apply_statements`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementReport {
    /// Statements that succeeded.
    pub executed: usize,
    /// Statements that failed and were rolled back to their savepoint.
    pub failures: Vec<StatementFailure>,
}

impl StatementReport {
    /// Whether every statement succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Runs units of work inside transactions.
pub struct TransactionExecutor<R: RecoveryLog> {
    recovery: Arc<R>,
}

impl<R: RecoveryLog> TransactionExecutor<R> {
    /// Create an executor writing failures to `recovery`.
    pub fn new(recovery: Arc<R>) -> Self {
        Self { recovery }
    }

    /// The recovery log.
    pub fn recovery_log(&self) -> &Arc<R> {
        &self.recovery
    }

    /// Run `work` between BEGIN and COMMIT.
    ///
    /// On failure the transaction is rolled back, a recovery record is written
    /// on a best-effort basis, and the work's error is returned.
    pub async fn run<'c, C, T, F>(
        &self,
        conn: &'c mut C,
        migration_id: &str,
        work: F,
    ) -> MigrateResult<T>
    where
        C: SqlConnection + ?Sized,
        F: for<'t> FnOnce(&'t mut Transaction<'c, C>) -> BoxFuture<'t, MigrateResult<T>>,
    {
        conn.begin()
            .await
            .map_err(|e| e.in_migration(migration_id))?;

        let mut tx = Transaction::new(conn, migration_id);
        let outcome = work(&mut tx).await;

        let err = match outcome {
            Ok(value) => match tx.conn.commit().await {
                Ok(()) => {
                    debug!(migration_id = %migration_id, "Transaction committed");
                    return Ok(value);
                }
                Err(e) => e.in_migration(migration_id),
            },
            Err(e) => e,
        };

        if let Err(rollback_err) = tx.conn.rollback().await {
            error!(
                migration_id = %migration_id,
                error = %rollback_err,
                "Rollback after failure also failed"
            );
        } else {
            info!(migration_id = %migration_id, "Transaction rolled back");
        }

        self.record_failure(&tx, &err).await;
        Err(err)
    }

    /// Apply statements in one transaction according to `strategy`.
    pub async fn apply_statements<C>(
        &self,
        conn: &mut C,
        migration_id: &str,
        statements: Vec<String>,
        strategy: SavepointStrategy,
    ) -> MigrateResult<StatementReport>
    where
        C: SqlConnection + ?Sized,
    {
        self.run(conn, migration_id, move |tx| {
            Box::pin(async move {
                let mut report = StatementReport::default();
                for (index, statement) in statements.iter().enumerate() {
                    match strategy {
                        SavepointStrategy::None => {
                            tx.execute(statement).await?;
                            report.executed += 1;
                        }
                        SavepointStrategy::PerStatement => {
                            let name = format!("tidemark_stmt_{}", index);
                            tx.savepoint(&name).await?;
                            match tx.execute(statement).await {
                                Ok(_) => report.executed += 1,
                                Err(e) => {
                                    warn!(
                                        migration_id = %tx.migration_id(),
                                        index,
                                        error = %e,
                                        "Statement failed; rolled back to its savepoint"
                                    );
                                    tx.rollback_to(&name).await?;
                                    report.failures.push(StatementFailure {
                                        index,
                                        statement: statement.clone(),
                                        code: e.sql_state().map(str::to_string),
                                        message: e.to_string(),
                                    });
                                }
                            }
                            tx.release(&name).await?;
                        }
                    }
                }
                Ok(report)
            })
        })
        .await
    }

    async fn record_failure<C: SqlConnection + ?Sized>(
        &self,
        tx: &Transaction<'_, C>,
        err: &MigrationError,
    ) {
        let record = RecoveryRecord {
            id: None,
            migration_id: tx.migration_id.clone(),
            created_at: Utc::now(),
            recovery_data: serde_json::json!({
                "error": err.to_string(),
                "code": err.sql_state(),
                "savepoints": tx.savepoints,
                "statement": tx.last_statement,
            }),
            resolved: false,
        };

        match self.recovery.record(record).await {
            Ok(id) => info!(migration_id = %tx.migration_id, recovery_id = id, "Recovery record written"),
            Err(e) => error!(
                migration_id = %tx.migration_id,
                error = %e,
                "Failed to write recovery record"
            ),
        }
    }
}

/// SQL for the recovery table (PostgreSQL).
pub const POSTGRES_INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS "_tidemark_recovery" (
    id BIGSERIAL PRIMARY KEY,
    migration_id VARCHAR(255) NOT NULL,
    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
    recovery_data JSONB NOT NULL,
    resolved BOOLEAN NOT NULL DEFAULT FALSE
);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryRecoveryLog, RecordingConnection};
    use pretty_assertions::assert_eq;

    fn executor() -> TransactionExecutor<InMemoryRecoveryLog> {
        TransactionExecutor::new(Arc::new(InMemoryRecoveryLog::new()))
    }

    #[test]
    fn test_savepoint_names() {
        assert!(validate_savepoint_name("sp_1").is_ok());
        assert!(validate_savepoint_name("_x").is_ok());
        assert!(validate_savepoint_name(&"a".repeat(63)).is_ok());
        assert!(validate_savepoint_name(&"a".repeat(64)).is_err());
        assert!(validate_savepoint_name("1sp").is_err());
        assert!(validate_savepoint_name("sp; DROP TABLE x").is_err());
        assert!(validate_savepoint_name("").is_err());
    }

    #[tokio::test]
    async fn test_commit_on_success() {
        let executor = executor();
        let mut conn = RecordingConnection::new();

        let rows = executor
            .run(&mut conn, "m1", |tx| {
                Box::pin(async move { tx.execute("UPDATE t SET a = 1 WHERE id = 1").await })
            })
            .await
            .unwrap();

        assert_eq!(rows, 1);
        assert_eq!(
            conn.log(),
            vec!["BEGIN", "UPDATE t SET a = 1 WHERE id = 1", "COMMIT"]
        );
        assert!(executor.recovery_log().unresolved().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_and_recovery_on_failure() {
        let executor = executor();
        let mut conn = RecordingConnection::new().fail_on("boom", "42P01");

        let err = executor
            .run(&mut conn, "m1", |tx| {
                Box::pin(async move {
                    tx.savepoint("before_boom").await?;
                    tx.execute("SELECT boom").await
                })
            })
            .await
            .unwrap_err();

        assert_eq!(err.sql_state(), Some("42P01"));
        assert!(matches!(err, MigrationError::Execution { ref migration_id, .. } if migration_id == "m1"));
        assert_eq!(conn.log().last().map(String::as_str), Some("ROLLBACK"));

        let records = executor.recovery_log().unresolved().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].migration_id, "m1");
        assert_eq!(records[0].recovery_data["statement"], "SELECT boom");
        assert_eq!(records[0].recovery_data["savepoints"][0], "before_boom");
        assert_eq!(records[0].recovery_data["code"], "42P01");
    }

    #[tokio::test]
    async fn test_recovery_failure_is_swallowed() {
        let executor = TransactionExecutor::new(Arc::new(InMemoryRecoveryLog::failing()));
        let mut conn = RecordingConnection::new().fail_on("boom", "XX000");

        let err = executor
            .run(&mut conn, "m1", |tx| {
                Box::pin(async move { tx.execute("SELECT boom").await })
            })
            .await
            .unwrap_err();

        assert_eq!(err.sql_state(), Some("XX000"));
    }

    #[tokio::test]
    async fn test_savepoint_stack() {
        let executor = executor();
        let mut conn = RecordingConnection::new();

        let stacks = executor
            .run(&mut conn, "m1", |tx| {
                Box::pin(async move {
                    tx.savepoint("a").await?;
                    tx.savepoint("b").await?;
                    tx.savepoint("c").await?;
                    tx.rollback_to("b").await?;
                    let after_rollback = tx.savepoints().to_vec();
                    tx.release("a").await?;
                    let unknown = tx.release("zzz").await.is_err();
                    Ok((after_rollback, tx.savepoints().to_vec(), unknown))
                })
            })
            .await
            .unwrap();

        assert_eq!(stacks.0, vec!["a", "b"]);
        assert!(stacks.1.is_empty());
        assert!(stacks.2);
        assert!(conn.log().contains(&"ROLLBACK TO SAVEPOINT b".to_string()));
    }

    #[tokio::test]
    async fn test_apply_statements_none_aborts() {
        let executor = executor();
        let mut conn = RecordingConnection::new().fail_on("bad", "42601");
        let statements = vec!["SELECT 1".to_string(), "SELECT bad".to_string(), "SELECT 3".to_string()];

        let result = executor
            .apply_statements(&mut conn, "m1", statements, SavepointStrategy::None)
            .await;

        assert!(result.is_err());
        assert!(!conn.log().contains(&"SELECT 3".to_string()));
        assert_eq!(conn.log().last().map(String::as_str), Some("ROLLBACK"));
    }

    #[tokio::test]
    async fn test_apply_statements_per_statement_continues() {
        let executor = executor();
        let mut conn = RecordingConnection::new().fail_on("bad", "42601");
        let statements = vec!["SELECT 1".to_string(), "SELECT bad".to_string(), "SELECT 3".to_string()];

        let report = executor
            .apply_statements(&mut conn, "m1", statements, SavepointStrategy::PerStatement)
            .await
            .unwrap();

        assert_eq!(report.executed, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].index, 1);
        assert_eq!(report.failures[0].code.as_deref(), Some("42601"));
        assert!(conn.log().contains(&"ROLLBACK TO SAVEPOINT tidemark_stmt_1".to_string()));
        assert_eq!(conn.log().last().map(String::as_str), Some("COMMIT"));
    }
}
