//! Engine configuration, loadable from `tidemark.toml`.
//!
//! ```toml
//! migrations_dir = "./migrations"
//! baseline_path = "./migrations/.baseline.json"
//! environment = "production"
//! lock_ttl_secs = 900
//! lock_wait_secs = 60
//! savepoint_strategy = "per_statement"
//! ```
//!
//! `${VAR}` references are expanded from the environment before parsing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MigrateResult, MigrationError};
use crate::introspect::IntrospectionConfig;
use crate::lock::LockRequest;
use crate::transaction::SavepointStrategy;

/// Applied-migration history.
pub const MIGRATIONS_TABLE: &str = "_tidemark_migrations";
/// Lock rows.
pub const LOCKS_TABLE: &str = "_tidemark_locks";
/// Stored checksums.
pub const CHECKSUMS_TABLE: &str = "_tidemark_checksums";
/// Checksum repair history.
pub const CHECKSUM_REPAIRS_TABLE: &str = "_tidemark_checksum_repairs";
/// Failed-transaction recovery log.
pub const RECOVERY_TABLE: &str = "_tidemark_recovery";

/// Tables owned by the engine, never part of a captured snapshot.
pub const BOOKKEEPING_TABLES: &[&str] = &[
    MIGRATIONS_TABLE,
    LOCKS_TABLE,
    CHECKSUMS_TABLE,
    CHECKSUM_REPAIRS_TABLE,
    RECOVERY_TABLE,
];

/// Configuration for the migration engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Path to the migrations directory.
    pub migrations_dir: PathBuf,
    /// Where the recorded baseline snapshot lives.
    pub baseline_path: PathBuf,
    /// Schema to introspect and migrate.
    pub database_schema: String,
    /// Environment label recorded on executed scripts.
    pub environment: Option<String>,
    /// Lock time-to-live in seconds.
    pub lock_ttl_secs: u64,
    /// Seconds to wait for a held lock; 0 fails fast.
    pub lock_wait_secs: u64,
    /// First lock poll delay in milliseconds.
    pub lock_poll_ms: u64,
    /// Seconds between background stale-lock sweeps.
    pub lock_sweep_secs: u64,
    /// Take over an active lock.
    pub force_lock: bool,
    /// Allow generating destructive changes.
    pub allow_destructive: bool,
    /// Apply even when the conflict scan reports warnings.
    pub acknowledge_warnings: bool,
    /// Statement isolation inside a migration transaction.
    pub savepoint_strategy: SavepointStrategy,
    /// Plan and validate without executing.
    pub dry_run: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            migrations_dir: PathBuf::from("./migrations"),
            baseline_path: PathBuf::from("./migrations/.baseline.json"),
            database_schema: "public".to_string(),
            environment: None,
            lock_ttl_secs: 15 * 60,
            lock_wait_secs: 0,
            lock_poll_ms: 250,
            lock_sweep_secs: 60,
            force_lock: false,
            allow_destructive: false,
            acknowledge_warnings: false,
            savepoint_strategy: SavepointStrategy::None,
            dry_run: false,
        }
    }
}

impl EngineConfig {
    /// Create a new configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> MigrateResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MigrationError::config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> MigrateResult<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| MigrationError::config(e.to_string()))
    }

    /// Set the migrations directory.
    pub fn migrations_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.migrations_dir = dir.into();
        self
    }

    /// Set the baseline snapshot path.
    pub fn baseline_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.baseline_path = path.into();
        self
    }

    /// Set the database schema.
    pub fn database_schema(mut self, schema: impl Into<String>) -> Self {
        self.database_schema = schema.into();
        self
    }

    /// Set the environment label.
    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    /// Set the lock TTL.
    pub fn lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl_secs = ttl.as_secs();
        self
    }

    /// Wait up to `timeout` for a held lock.
    pub fn lock_wait(mut self, timeout: Duration) -> Self {
        self.lock_wait_secs = timeout.as_secs();
        self
    }

    /// Set the first lock poll delay.
    pub fn lock_poll(mut self, interval: Duration) -> Self {
        self.lock_poll_ms = interval.as_millis() as u64;
        self
    }

    /// Take over an active lock.
    pub fn force_lock(mut self, force: bool) -> Self {
        self.force_lock = force;
        self
    }

    /// Allow destructive changes.
    pub fn allow_destructive(mut self, allow: bool) -> Self {
        self.allow_destructive = allow;
        self
    }

    /// Proceed past warning-level conflicts.
    pub fn acknowledge_warnings(mut self, acknowledge: bool) -> Self {
        self.acknowledge_warnings = acknowledge;
        self
    }

    /// Set the savepoint strategy.
    pub fn savepoint_strategy(mut self, strategy: SavepointStrategy) -> Self {
        self.savepoint_strategy = strategy;
        self
    }

    /// Enable dry-run mode.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Interval of the background lock sweeper.
    pub fn lock_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.lock_sweep_secs.max(1))
    }

    /// Lock request derived from the lock settings.
    pub fn lock_request(&self, migration_id: impl Into<String>) -> LockRequest {
        let request = LockRequest::new(migration_id)
            .ttl(Duration::from_secs(self.lock_ttl_secs))
            .poll_interval(Duration::from_millis(self.lock_poll_ms))
            .force(self.force_lock);
        if self.lock_wait_secs > 0 {
            request.wait(Duration::from_secs(self.lock_wait_secs))
        } else {
            request
        }
    }

    /// Introspection settings for the configured schema.
    pub fn introspection(&self) -> IntrospectionConfig {
        IntrospectionConfig::new().database_schema(&self.database_schema)
    }
}

/// Expand environment variables in the format `${VAR_NAME}`.
fn expand_env_vars(content: &str) -> String {
    let Ok(re) = regex_lite::Regex::new(r"\$\{([^}]+)\}") else {
        return content.to_string();
    };
    re.replace_all(content, |caps: &regex_lite::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.migrations_dir, PathBuf::from("./migrations"));
        assert_eq!(config.lock_ttl_secs, 900);
        assert!(!config.allow_destructive);
        assert!(!config.acknowledge_warnings);
        assert!(config.lock_request("migrate").wait.is_none());
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new()
            .migrations_dir("./db/migrations")
            .environment("staging")
            .lock_wait(Duration::from_secs(30))
            .savepoint_strategy(SavepointStrategy::PerStatement)
            .dry_run(true);

        assert_eq!(config.migrations_dir, PathBuf::from("./db/migrations"));
        assert_eq!(config.environment.as_deref(), Some("staging"));
        assert_eq!(config.lock_request("m").wait, Some(Duration::from_secs(30)));
        assert_eq!(config.savepoint_strategy, SavepointStrategy::PerStatement);
        assert!(config.dry_run);
    }

    #[test]
    fn test_from_toml() {
        let config = EngineConfig::from_toml(
            r#"
            migrations_dir = "./sql"
            lock_ttl_secs = 120
            savepoint_strategy = "per_statement"
            allow_destructive = true
            acknowledge_warnings = true
            "#,
        )
        .unwrap();

        assert_eq!(config.migrations_dir, PathBuf::from("./sql"));
        assert_eq!(config.lock_request("m").ttl, Duration::from_secs(120));
        assert_eq!(config.savepoint_strategy, SavepointStrategy::PerStatement);
        assert!(config.allow_destructive);
        assert!(config.acknowledge_warnings);
        assert_eq!(config.database_schema, "public");
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let err = EngineConfig::from_toml("lock_ttl = 5").unwrap_err();
        assert!(matches!(err, MigrationError::Config(_)));
    }

    #[test]
    fn test_env_expansion_leaves_unknown_vars() {
        let expanded = expand_env_vars("dir = \"${TIDEMARK_SURELY_UNSET_VAR}\"");
        assert_eq!(expanded, "dir = \"${TIDEMARK_SURELY_UNSET_VAR}\"");
    }

    #[test]
    fn test_bookkeeping_tables() {
        assert_eq!(BOOKKEEPING_TABLES.len(), 5);
        assert!(BOOKKEEPING_TABLES.iter().all(|t| t.starts_with("_tidemark_")));
    }
}
