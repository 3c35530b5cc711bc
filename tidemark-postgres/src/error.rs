//! Error types for PostgreSQL operations.

use thiserror::Error;
use tidemark_migrate::MigrationError;

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;

/// SQLSTATE for unique violations.
pub const UNIQUE_VIOLATION: &str = "23505";

/// Errors that can occur during PostgreSQL operations.
#[derive(Error, Debug)]
pub enum PgError {
    /// Connection pool error.
    #[error("pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// PostgreSQL error.
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Row deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl PgError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a deserialization error.
    pub fn deserialization(message: impl Into<String>) -> Self {
        Self::Deserialization(message.into())
    }

    /// Check if this is a connection error.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Pool(_) => true,
            Self::Postgres(e) => e.is_closed(),
            _ => false,
        }
    }

    /// The SQLSTATE code reported by the server.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Postgres(e) => e.code().map(|c| c.code()),
            _ => None,
        }
    }

    /// Whether the server rejected a duplicate key.
    pub fn is_unique_violation(&self) -> bool {
        self.sql_state() == Some(UNIQUE_VIOLATION)
    }

    fn server_message(&self) -> String {
        match self {
            Self::Postgres(e) => match e.as_db_error() {
                Some(db) => match db.detail() {
                    Some(detail) => format!("{} ({})", db.message(), detail),
                    None => db.message().to_string(),
                },
                None => e.to_string(),
            },
            other => other.to_string(),
        }
    }
}

impl From<PgError> for MigrationError {
    fn from(err: PgError) -> Self {
        match &err {
            PgError::Postgres(e) if e.as_db_error().is_some() => {
                MigrationError::sql(err.sql_state().map(str::to_string), err.server_message())
            }
            PgError::Config(msg) => MigrationError::config(msg.clone()),
            _ => MigrationError::database(err.to_string()),
        }
    }
}
