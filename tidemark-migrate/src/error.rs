//! Error types for the migration engine.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type alias for migration operations.
pub type MigrateResult<T> = Result<T, MigrationError>;

/// Errors that can occur during migration operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// File system error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database operation error outside of script execution.
    #[error("Database error: {0}")]
    Database(String),

    /// SQL failed while applying a migration.
    #[error("Execution of '{migration_id}' failed{}: {message}", .code.as_ref().map(|c| format!(" [{c}]")).unwrap_or_default())]
    Execution {
        /// Migration being applied.
        migration_id: String,
        /// Machine-readable error code reported by the driver (SQLSTATE).
        code: Option<String>,
        /// Driver message.
        message: String,
    },

    /// Driver-level SQL failure, not yet attributed to a migration.
    #[error("SQL error{}: {message}", .code.as_ref().map(|c| format!(" [{c}]")).unwrap_or_default())]
    Sql {
        /// SQLSTATE code, when the driver reported one.
        code: Option<String>,
        /// Driver message.
        message: String,
    },

    /// The script references schema objects that do not exist.
    #[error("Schema conflict: {0}")]
    SchemaConflict(String),

    /// Invalid migration file or format.
    #[error("Invalid migration: {0}")]
    InvalidMigration(String),

    /// Migration checksum mismatch.
    #[error("Checksum mismatch for migration '{id}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Migration ID.
        id: String,
        /// Expected (stored) checksum.
        expected: String,
        /// Actual checksum of the file on disk.
        actual: String,
    },

    /// A repair was requested for a migration that was never applied.
    #[error("Migration '{0}' has not been applied; use force to repair anyway")]
    NotApplied(String),

    /// Migration not found.
    #[error("Migration '{0}' not found")]
    NotFound(String),

    /// Another actor holds the migration lock.
    #[error("Migration lock {lock_id} is held by {holder} on {machine} since {acquired_at}")]
    LockHeld {
        /// Lock identifier of the holder.
        lock_id: String,
        /// Actor holding the lock.
        holder: String,
        /// Machine of the holder.
        machine: String,
        /// When the holder acquired it.
        acquired_at: DateTime<Utc>,
    },

    /// Lock acquisition failed for a reason other than contention.
    #[error("Failed to acquire migration lock: {0}")]
    LockFailed(String),

    /// The conflict scan found blocking problems.
    #[error("Migration set has {0} blocking conflict(s)")]
    BlockingConflicts(usize),

    /// The conflict scan found warnings nobody acknowledged.
    #[error("Migration set has {0} warning(s); acknowledge them to proceed")]
    UnacknowledgedWarnings(usize),

    /// Data loss would occur.
    #[error("Data loss would occur: {0}")]
    DataLoss(String),

    /// No changes to migrate.
    #[error("No schema changes detected")]
    NoChanges,

    /// Rollback not possible.
    #[error("Cannot rollback: {0}")]
    RollbackFailed(String),

    /// Invalid savepoint identifier.
    #[error("Invalid savepoint name '{0}'")]
    InvalidSavepoint(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error for snapshots and recovery data.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General migration error.
    #[error("Migration error: {0}")]
    Other(String),
}

impl MigrationError {
    /// Create a database error.
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create an execution error.
    pub fn execution(
        migration_id: impl Into<String>,
        code: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Execution {
            migration_id: migration_id.into(),
            code,
            message: message.into(),
        }
    }

    /// Create a driver-level SQL error.
    pub fn sql(code: Option<String>, message: impl Into<String>) -> Self {
        Self::Sql {
            code,
            message: message.into(),
        }
    }

    /// Attribute a driver-level SQL error to a migration.
    pub fn in_migration(self, migration_id: &str) -> Self {
        match self {
            Self::Sql { code, message } => Self::Execution {
                migration_id: migration_id.to_string(),
                code,
                message,
            },
            other => other,
        }
    }

    /// Create a schema conflict error.
    pub fn schema_conflict(msg: impl Into<String>) -> Self {
        Self::SchemaConflict(msg.into())
    }

    /// Create a data loss error.
    pub fn data_loss(msg: impl Into<String>) -> Self {
        Self::DataLoss(msg.into())
    }

    /// Create a lock failed error.
    pub fn lock_failed(msg: impl Into<String>) -> Self {
        Self::LockFailed(msg.into())
    }

    /// Create a migration file error.
    pub fn migration_file(msg: impl Into<String>) -> Self {
        Self::InvalidMigration(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Check if this is a recoverable error.
    ///
    /// Recoverable errors may be retried by the caller (lock contention,
    /// transient connection failures) or are informational.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::LockHeld { .. } | Self::LockFailed(_) | Self::NoChanges | Self::Database(_)
        )
    }

    /// The SQLSTATE code attached to an execution failure.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Execution { code, .. } | Self::Sql { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}
