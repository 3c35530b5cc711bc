//! Integration tests for the migration workflow.
//!
//! These tests drive the engine end to end with the in-memory repositories:
//! capture, generate, apply, tamper, repair and roll back.

use std::path::Path;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use tidemark::migrate::memory::{
    InMemoryCatalog, InMemoryChecksums, InMemoryHistory, InMemoryLocks, InMemoryRecoveryLog,
    RecordingConnection,
};
use tidemark::migrate::{
    ChangeDetector, ChecksumRepository, ColumnInfo, ConflictType, EngineConfig, Identity,
    IndexInfo, LockManager, LockOutcome, LockRequest, MigrationEngine, MigrationError,
    MigrationGenerator, RepairRequest, SchemaIntrospector, SchemaSnapshot, TableInfo,
    compute_checksum,
};

type Engine = MigrationEngine<InMemoryHistory, InMemoryLocks, InMemoryChecksums, InMemoryRecoveryLog>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn engine(dir: &Path, config: EngineConfig) -> Engine {
    MigrationEngine::new(
        config
            .migrations_dir(dir.join("migrations"))
            .baseline_path(dir.join("migrations/.baseline.json")),
        InMemoryHistory::new(),
        InMemoryLocks::new(),
        InMemoryChecksums::new(),
        InMemoryRecoveryLog::new(),
    )
    .with_identity(Identity::new("ci", "runner", 7))
}

fn table(name: &str) -> TableInfo {
    TableInfo {
        name: name.to_string(),
        schema: "public".to_string(),
        table_type: "BASE TABLE".to_string(),
    }
}

fn column(name: &str, data_type: &str, udt: &str, position: i32) -> ColumnInfo {
    ColumnInfo {
        name: name.to_string(),
        data_type: data_type.to_string(),
        udt_name: udt.to_string(),
        character_maximum_length: None,
        numeric_precision: None,
        numeric_scale: None,
        is_nullable: true,
        column_default: None,
        ordinal_position: position,
    }
}

fn primary_key(table: &str, column: &str) -> IndexInfo {
    IndexInfo {
        name: format!("{}_pkey", table),
        table_name: table.to_string(),
        columns: vec![column.to_string()],
        is_unique: true,
        is_primary: true,
        predicate: None,
    }
}

fn users_columns(with_nickname: bool) -> Vec<ColumnInfo> {
    let mut id = column("id", "integer", "int4", 1);
    id.is_nullable = false;
    let mut email = column("email", "character varying", "varchar", 2);
    email.character_maximum_length = Some(255);

    let mut columns = vec![id, email];
    if with_nickname {
        columns.push(column("nickname", "text", "text", 3));
    }
    columns
}

fn catalog(with_nickname: bool) -> InMemoryCatalog {
    InMemoryCatalog::new().with_table(
        table("users"),
        users_columns(with_nickname),
        vec![primary_key("users", "id")],
    )
}

/// Generate, apply, tamper, repair and roll back
#[tokio::test]
async fn test_full_migration_lifecycle() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path(), EngineConfig::new());
    engine.initialize().await.unwrap();
    let mut conn = RecordingConnection::new();

    let create = engine
        .create_from_database("create users", &catalog(false))
        .await
        .unwrap();
    assert!(create.up_sql.contains("CREATE TABLE \"public\".\"users\""));

    let first = engine.migrate(&mut conn, None).await.unwrap();
    assert_eq!(first.applied, vec![create.id.clone()]);

    let add = engine
        .create_from_database("add nickname", &catalog(true))
        .await
        .unwrap();
    assert!(add.up_sql.contains("ADD COLUMN \"nickname\" text"));
    let down = add.down_sql.clone().unwrap_or_default();
    assert!(down.contains("DROP COLUMN IF EXISTS \"nickname\""));

    let second = engine.migrate(&mut conn, None).await.unwrap();
    assert_eq!(second.applied, vec![add.id.clone()]);

    let status = engine.status().await.unwrap();
    assert_eq!(status.total_applied, 2);
    assert_eq!(status.total_pending, 0);

    // Editing an applied script blocks further runs until the checksum is repaired
    tokio::fs::write(&add.path, format!("{}\n-- reviewed\n", add.up_sql))
        .await
        .unwrap();
    let plan = engine.plan().await.unwrap();
    assert_eq!(plan.conflicts.of_type(ConflictType::ChecksumMismatch).count(), 1);
    let err = engine.migrate(&mut conn, None).await.unwrap_err();
    assert!(matches!(err, MigrationError::BlockingConflicts(1)));

    let repair = engine
        .repair_checksum(RepairRequest::new(&add.id, "ops").reason("comment added"))
        .await
        .unwrap();
    assert_eq!(repair.old_checksum.as_deref(), Some(add.checksum.as_str()));
    assert!(!engine.plan().await.unwrap().has_blocking_issues());

    let rolled_back = engine.rollback(&mut conn).await.unwrap();
    assert_eq!(rolled_back, Some(add.id.clone()));
    assert!(
        conn.committed()
            .iter()
            .any(|s| s.contains("DROP COLUMN IF EXISTS \"nickname\""))
    );
    assert_eq!(engine.status().await.unwrap().total_pending, 1);
}

/// Capturing the same catalog in different orders generates identical SQL
#[tokio::test]
async fn test_generation_is_deterministic() {
    let ordered = catalog(true)
        .with_table(table("posts"), vec![column("id", "bigint", "int8", 1)], vec![]);
    let shuffled = InMemoryCatalog::new()
        .with_table(table("posts"), vec![column("id", "bigint", "int8", 1)], vec![])
        .with_table(table("users"), users_columns(true), vec![primary_key("users", "id")]);

    let introspector = SchemaIntrospector::default();
    let a = introspector.capture(&ordered).await.unwrap().snapshot;
    let b = introspector.capture(&shuffled).await.unwrap().snapshot;
    assert!(a.structurally_eq(&b));

    let empty = SchemaSnapshot::new("public");
    let sql_a = MigrationGenerator.generate(&ChangeDetector::detect(&empty, &a));
    let sql_b = MigrationGenerator.generate(&ChangeDetector::detect(&empty, &b));
    assert_eq!(sql_a.up_sql(), sql_b.up_sql());
    assert_eq!(sql_a.down_sql(), sql_b.down_sql());
}

/// Line endings and trailing whitespace do not change a checksum
#[test]
fn test_checksum_normalization() {
    let unix = compute_checksum("CREATE TABLE t (id int);\nSELECT 1;\n");
    let windows = compute_checksum("CREATE TABLE t (id int);\r\nSELECT 1;\r\n\r\n");
    let edited = compute_checksum("CREATE TABLE t (id bigint);\nSELECT 1;\n");

    assert_eq!(unix, windows);
    assert_ne!(unix, edited);
    assert_eq!(unix.len(), 44);
}

/// Only one of many concurrent contenders gets the lock
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lock_mutual_exclusion() {
    let store = Arc::new(InMemoryLocks::new());

    let mut tasks = Vec::new();
    for n in 0..8u32 {
        let manager = LockManager::from_arc(Arc::clone(&store))
            .with_identity(Identity::new(format!("worker-{}", n), "host", n));
        tasks.push(tokio::spawn(async move {
            manager.try_acquire(&LockRequest::new("migrate")).await
        }));
    }

    let mut acquired = 0;
    let mut held = 0;
    for task in tasks {
        match task.await.unwrap().unwrap() {
            LockOutcome::Acquired(_) => acquired += 1,
            LockOutcome::Held(_) => held += 1,
        }
    }
    assert_eq!(acquired, 1);
    assert_eq!(held, 7);
}

/// Dropping a column needs an explicit opt-in and is annotated in the script
#[tokio::test]
async fn test_destructive_changes_are_flagged() {
    let dir = tempfile::tempdir().unwrap();
    let strict = engine(dir.path(), EngineConfig::new());
    strict
        .create_from_database("create users", &catalog(true))
        .await
        .unwrap();

    let err = strict
        .create_from_database("drop nickname", &catalog(false))
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::DataLoss(_)));

    let permissive = engine(dir.path(), EngineConfig::new().allow_destructive(true));
    let script = permissive
        .create_from_database("drop nickname", &catalog(false))
        .await
        .unwrap();
    assert!(script.up_sql.contains("-- WARNING: Dropping column public.users.nickname"));
    assert!(script.up_sql.contains("DROP COLUMN IF EXISTS \"nickname\""));
}

/// Warning-level conflicts stop a run until the configuration acknowledges them
#[tokio::test]
async fn test_warnings_need_acknowledgement() {
    let dir = tempfile::tempdir().unwrap();
    let strict = engine(dir.path(), EngineConfig::new());
    strict.initialize().await.unwrap();
    let script = strict
        .files()
        .write_sql("backfill", "UPDATE accounts SET active = true;", None)
        .await
        .unwrap();

    let plan = strict.plan().await.unwrap();
    assert!(plan.conflicts.requires_acknowledgement());

    let mut conn = RecordingConnection::new();
    let err = strict.migrate(&mut conn, None).await.unwrap_err();
    assert!(matches!(err, MigrationError::UnacknowledgedWarnings(1)));
    assert!(conn.log().is_empty());

    let acknowledged = engine(dir.path(), EngineConfig::new().acknowledge_warnings(true));
    acknowledged.initialize().await.unwrap();
    let result = acknowledged.migrate(&mut conn, None).await.unwrap();
    assert_eq!(result.applied, vec![script.id.clone()]);
    assert!(result.warnings.iter().any(|w| w.contains("no rollback script")));
}

/// Repairs require the migration to be applied unless forced
#[tokio::test]
async fn test_repair_gating() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path(), EngineConfig::new());
    let script = engine
        .files()
        .write_sql("seed", "INSERT INTO t VALUES (1);", None)
        .await
        .unwrap();

    let err = engine
        .repair_checksum(RepairRequest::new(&script.id, "ops"))
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::NotApplied(_)));

    let record = engine
        .repair_checksum(RepairRequest::new(&script.id, "ops").force(true))
        .await
        .unwrap();
    assert!(record.forced);
    assert_eq!(record.old_checksum, None);
    assert_eq!(record.new_checksum, script.checksum);

    let repairs = engine
        .checksums()
        .repository()
        .repairs(&script.id)
        .await
        .unwrap();
    assert_eq!(repairs, vec![record]);
}

/// Configuration files round-trip into the engine
#[test]
fn test_engine_config_from_toml() {
    let config = EngineConfig::from_toml(
        r#"
        migrations_dir = "./db/migrations"
        environment = "staging"
        lock_ttl_secs = 300
        savepoint_strategy = "per_statement"
        acknowledge_warnings = true
        "#,
    )
    .expect("Failed to parse config");

    assert_eq!(config.environment.as_deref(), Some("staging"));
    assert!(config.acknowledge_warnings);
    assert_eq!(config.lock_request("migrate").ttl.as_secs(), 300);
}
