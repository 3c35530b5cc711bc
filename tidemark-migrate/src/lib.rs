//! # tidemark-migrate
//!
//! Schema migration engine for PostgreSQL.
//!
//! This crate provides functionality for:
//! - Capturing schema snapshots through a backend [`CatalogReader`]
//! - Structured change detection between a recorded baseline and the live schema
//! - Forward and rollback SQL generation, including `ALTER TABLE` rebuilds
//! - Conflict scans over the migration directory (duplicates, cycles, tampering)
//! - SHA-256 checksums with audited repairs
//! - A TTL lock with force takeover and a background stale-lock sweeper
//! - Transactional execution with savepoints and a failure recovery log
//!
//! ## Architecture
//!
//! Persistence is behind async repository traits. The `tidemark-postgres`
//! crate implements them on PostgreSQL tables; [`memory`] implements them in
//! process.
//!
//! ```text
//! ┌──────────────┐     ┌────────────────┐     ┌─────────────┐
//! │ Baseline     │────▶│ ChangeDetector │────▶│ Generator   │
//! └──────────────┘     └────────────────┘     └─────────────┘
//!        ▲                     ▲                     │
//!        │             ┌────────────────┐            ▼
//!        │             │ Introspector   │     ┌─────────────┐
//!        │             └────────────────┘     │ UP / DOWN   │
//!        │                                    └─────────────┘
//!        │                                           │
//!        │  ┌────────────┐  ┌──────────┐             ▼
//!        └──│ Engine     │──│ Conflict │──▶ Lock ──▶ Transaction ──▶ History
//!           └────────────┘  └──────────┘                      └──▶ Checksums
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use tidemark_migrate::{EngineConfig, MigrationEngine};
//!
//! async fn run(conn: &mut impl tidemark_migrate::SqlConnection) -> tidemark_migrate::MigrateResult<()> {
//!     let config = EngineConfig::from_file("tidemark.toml")?;
//!     let engine = MigrationEngine::new(config, history, locks, checksums, recovery);
//!     engine.initialize().await?;
//!
//!     let plan = engine.plan().await?;
//!     println!("Plan: {}", plan.summary());
//!
//!     let result = engine.migrate(conn, None).await?;
//!     println!("{}", result.summary());
//!     Ok(())
//! }
//! ```
//!
//! ## Migration Files
//!
//! ```text
//! migrations/
//! ├── .baseline.json
//! ├── 20240101120000_create_users.sql
//! ├── 20240101120000_create_users.down.sql
//! └── 20240102090000_add_posts.sql
//! ```

pub mod alter;
pub mod args;
pub mod checksum;
pub mod config;
pub mod conflict;
pub mod diff;
pub mod engine;
pub mod error;
pub mod file;
pub mod history;
pub mod introspect;
pub mod lock;
pub mod memory;
pub mod model;
pub mod sql;
pub mod transaction;
pub mod validate;

// Re-exports
pub use alter::AlterTableGenerator;
pub use checksum::{
    ChecksumManager, ChecksumRecord, ChecksumRepository, ChecksumStatus, RepairRecord,
    RepairRequest, compute_checksum,
};
pub use config::EngineConfig;
pub use conflict::{
    Conflict, ConflictDetector, ConflictReport, ConflictType, Resolution, ResolutionStrategy,
    Severity,
};
pub use diff::{ChangeDetector, ChangeSet, ColumnChange, TableChanges};
pub use engine::{
    FailedMigration, MigrationEngine, MigrationPlan, MigrationResult, MigrationStatus,
};
pub use error::{MigrateResult, MigrationError};
pub use file::{MigrationEntry, MigrationFileManager, MigrationScript, MigrationState};
pub use history::{MigrationHistoryRepository, MigrationRecord};
pub use introspect::{
    CatalogReader, ColumnInfo, FunctionInfo, IndexInfo, IntrospectionConfig, IntrospectionResult,
    SchemaBuilder, SchemaIntrospector, SkippedTable, TableInfo,
};
pub use lock::{
    Identity, LockHandle, LockManager, LockOutcome, LockRecord, LockRepository, LockRequest,
    LockStatus, LockSweeper,
};
pub use model::{Column, Function, FunctionParameter, Index, SchemaSnapshot, Table};
pub use sql::{GeneratedMigration, MigrationGenerator, SchemaOp};
pub use transaction::{
    RecoveryLog, RecoveryRecord, SavepointStrategy, SqlConnection, StatementReport, Transaction,
    TransactionExecutor,
};
pub use validate::{IssueSeverity, SnapshotChecker, ValidationIssue, split_statements, validate_sql};
