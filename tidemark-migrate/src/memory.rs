//! In-memory repositories and a recording connection.
//!
//! Useful for tests and for dry runs against a captured snapshot. Every store
//! keeps its state behind a `parking_lot` lock, so the check-and-insert in
//! [`InMemoryLocks::insert_active`] is atomic across tasks.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::checksum::{ChecksumRecord, ChecksumRepository, RepairRecord};
use crate::error::{MigrateResult, MigrationError};
use crate::file::MigrationState;
use crate::history::{MigrationHistoryRepository, MigrationRecord};
use crate::introspect::{CatalogReader, ColumnInfo, FunctionInfo, IndexInfo, TableInfo};
use crate::lock::{InsertOutcome, LockRecord, LockRepository, LockStatus};
use crate::transaction::{RecoveryLog, RecoveryRecord, SqlConnection};

/// Migration history kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryHistory {
    records: Mutex<BTreeMap<String, MigrationRecord>>,
}

impl InMemoryHistory {
    /// Create an empty history.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl MigrationHistoryRepository for InMemoryHistory {
    async fn initialize(&self) -> MigrateResult<()> {
        Ok(())
    }

    async fn get_all(&self) -> MigrateResult<Vec<MigrationRecord>> {
        Ok(self.records.lock().values().cloned().collect())
    }

    async fn record_state(
        &self,
        id: &str,
        checksum: &str,
        state: MigrationState,
        duration_ms: i64,
        error: Option<&str>,
    ) -> MigrateResult<()> {
        self.records.lock().insert(
            id.to_string(),
            MigrationRecord {
                id: id.to_string(),
                checksum: checksum.to_string(),
                state,
                applied_at: Utc::now(),
                duration_ms,
                rolled_back: false,
                error: error.map(str::to_string),
            },
        );
        Ok(())
    }

    async fn record_rollback(&self, id: &str) -> MigrateResult<()> {
        match self.records.lock().get_mut(id) {
            Some(record) => {
                record.rolled_back = true;
                Ok(())
            }
            None => Err(MigrationError::NotFound(id.to_string())),
        }
    }
}

/// Checksums and repair history kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryChecksums {
    checksums: Mutex<BTreeMap<String, ChecksumRecord>>,
    repairs: Mutex<Vec<RepairRecord>>,
}

impl InMemoryChecksums {
    /// Create an empty checksum store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ChecksumRepository for InMemoryChecksums {
    async fn initialize(&self) -> MigrateResult<()> {
        Ok(())
    }

    async fn get(&self, migration_id: &str) -> MigrateResult<Option<ChecksumRecord>> {
        Ok(self.checksums.lock().get(migration_id).cloned())
    }

    async fn upsert(&self, mut record: ChecksumRecord) -> MigrateResult<()> {
        let mut checksums = self.checksums.lock();
        if let Some(existing) = checksums.get(&record.migration_id) {
            record.created_at = existing.created_at;
        }
        checksums.insert(record.migration_id.clone(), record);
        Ok(())
    }

    async fn append_repair(&self, record: RepairRecord) -> MigrateResult<()> {
        self.repairs.lock().push(record);
        Ok(())
    }

    async fn repairs(&self, migration_id: &str) -> MigrateResult<Vec<RepairRecord>> {
        Ok(self
            .repairs
            .lock()
            .iter()
            .filter(|r| r.migration_id == migration_id)
            .cloned()
            .collect())
    }

    async fn all(&self) -> MigrateResult<Vec<ChecksumRecord>> {
        Ok(self.checksums.lock().values().cloned().collect())
    }
}

/// Lock table kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryLocks {
    rows: Mutex<Vec<LockRecord>>,
}

impl InMemoryLocks {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every row ever written, in insertion order.
    pub fn rows(&self) -> Vec<LockRecord> {
        self.rows.lock().clone()
    }
}

fn close(row: &mut LockRecord, status: LockStatus, by: &str, at: DateTime<Utc>) {
    row.status = status;
    row.released_by = Some(by.to_string());
    row.released_at = Some(at);
}

#[async_trait::async_trait]
impl LockRepository for InMemoryLocks {
    async fn initialize(&self) -> MigrateResult<()> {
        Ok(())
    }

    async fn expire_stale(&self, now: DateTime<Utc>) -> MigrateResult<u64> {
        let mut count = 0;
        for row in self.rows.lock().iter_mut() {
            if row.status == LockStatus::Active && row.is_stale_at(now) {
                close(row, LockStatus::Expired, "sweeper", now);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn active(&self) -> MigrateResult<Option<LockRecord>> {
        Ok(self
            .rows
            .lock()
            .iter()
            .find(|r| r.status == LockStatus::Active)
            .cloned())
    }

    async fn insert_active(&self, record: LockRecord) -> MigrateResult<InsertOutcome> {
        let mut rows = self.rows.lock();
        if let Some(existing) = rows.iter().find(|r| r.status == LockStatus::Active) {
            return Ok(InsertOutcome::Conflict(existing.clone()));
        }
        rows.push(record);
        Ok(InsertOutcome::Inserted)
    }

    async fn force_release(
        &self,
        lock_id: &str,
        by: &str,
        at: DateTime<Utc>,
    ) -> MigrateResult<bool> {
        let mut rows = self.rows.lock();
        match rows
            .iter_mut()
            .find(|r| r.lock_id == lock_id && r.status == LockStatus::Active)
        {
            Some(row) => {
                close(row, LockStatus::ForceReleased, by, at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn release(&self, lock_id: &str, by: &str, at: DateTime<Utc>) -> MigrateResult<bool> {
        let mut rows = self.rows.lock();
        match rows
            .iter_mut()
            .find(|r| r.lock_id == lock_id && r.status == LockStatus::Active)
        {
            Some(row) => {
                close(row, LockStatus::Released, by, at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn force_release_all(&self, by: &str, at: DateTime<Utc>) -> MigrateResult<u64> {
        let mut count = 0;
        for row in self.rows.lock().iter_mut() {
            if row.status == LockStatus::Active {
                close(row, LockStatus::ForceReleased, by, at);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn get(&self, lock_id: &str) -> MigrateResult<Option<LockRecord>> {
        Ok(self.rows.lock().iter().find(|r| r.lock_id == lock_id).cloned())
    }
}

/// Recovery log kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryRecoveryLog {
    records: Mutex<Vec<RecoveryRecord>>,
    failing: bool,
}

impl InMemoryRecoveryLog {
    /// Create an empty recovery log.
    pub fn new() -> Self {
        Self::default()
    }

    /// A log whose writes always fail.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }
}

#[async_trait::async_trait]
impl RecoveryLog for InMemoryRecoveryLog {
    async fn initialize(&self) -> MigrateResult<()> {
        Ok(())
    }

    async fn record(&self, mut record: RecoveryRecord) -> MigrateResult<i64> {
        if self.failing {
            return Err(MigrationError::database("recovery log unavailable"));
        }
        let mut records = self.records.lock();
        let id = records.len() as i64 + 1;
        record.id = Some(id);
        records.push(record);
        Ok(id)
    }

    async fn unresolved(&self) -> MigrateResult<Vec<RecoveryRecord>> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|r| !r.resolved)
            .cloned()
            .collect())
    }

    async fn resolve(&self, id: i64) -> MigrateResult<bool> {
        Ok(match self.records.lock().iter_mut().find(|r| r.id == Some(id)) {
            Some(record) => {
                record.resolved = true;
                true
            }
            None => false,
        })
    }
}

/// A connection that records statements and simulates transactions.
///
/// Statements run inside BEGIN/COMMIT only reach [`committed`](Self::committed)
/// when the transaction commits; savepoints truncate the pending list on
/// rollback.
#[derive(Debug, Default)]
pub struct RecordingConnection {
    log: Vec<String>,
    committed: Vec<String>,
    pending: Option<Vec<String>>,
    savepoints: Vec<(String, usize)>,
    failures: Vec<(String, String)>,
    scalars: HashMap<String, String>,
}

impl RecordingConnection {
    /// Create a connection with no recorded statements.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail any statement containing `pattern` with SQLSTATE `code`.
    pub fn fail_on(mut self, pattern: impl Into<String>, code: impl Into<String>) -> Self {
        self.failures.push((pattern.into(), code.into()));
        self
    }

    /// Answer `query_scalar` calls containing `pattern` with `value`.
    pub fn with_scalar(mut self, pattern: impl Into<String>, value: impl Into<String>) -> Self {
        self.scalars.insert(pattern.into(), value.into());
        self
    }

    /// Every statement received, including transaction control.
    pub fn log(&self) -> Vec<String> {
        self.log.clone()
    }

    /// Statements that are durably applied.
    pub fn committed(&self) -> Vec<String> {
        self.committed.clone()
    }

    fn control(&mut self, sql: &str) -> bool {
        let upper = sql.trim().to_uppercase();
        if upper == "BEGIN" {
            self.pending = Some(Vec::new());
            self.savepoints.clear();
        } else if upper == "COMMIT" {
            if let Some(pending) = self.pending.take() {
                self.committed.extend(pending);
            }
        } else if upper == "ROLLBACK" {
            self.pending = None;
            self.savepoints.clear();
        } else if let Some(name) = upper.strip_prefix("SAVEPOINT ") {
            let mark = self.pending.as_ref().map_or(0, Vec::len);
            self.savepoints.push((name.to_string(), mark));
        } else if let Some(name) = upper.strip_prefix("ROLLBACK TO SAVEPOINT ") {
            if let Some(&(_, mark)) = self.savepoints.iter().rev().find(|(n, _)| n == name)
                && let Some(pending) = self.pending.as_mut()
            {
                pending.truncate(mark);
            }
        } else if let Some(name) = upper.strip_prefix("RELEASE SAVEPOINT ") {
            if let Some(position) = self.savepoints.iter().rposition(|(n, _)| n == name) {
                self.savepoints.truncate(position);
            }
        } else {
            return false;
        }
        true
    }

    fn run(&mut self, sql: &str) -> MigrateResult<()> {
        self.log.push(sql.to_string());
        if let Some((_, code)) = self.failures.iter().find(|(p, _)| sql.contains(p.as_str())) {
            return Err(MigrationError::sql(
                Some(code.clone()),
                format!("simulated failure in: {}", sql),
            ));
        }
        if self.control(sql) {
            return Ok(());
        }
        match self.pending.as_mut() {
            Some(pending) => pending.push(sql.to_string()),
            None => self.committed.push(sql.to_string()),
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl SqlConnection for RecordingConnection {
    async fn execute(&mut self, sql: &str) -> MigrateResult<u64> {
        self.run(sql).map(|_| 1)
    }

    async fn batch_execute(&mut self, sql: &str) -> MigrateResult<()> {
        self.run(sql)
    }

    async fn query_scalar(&mut self, sql: &str) -> MigrateResult<Option<String>> {
        self.log.push(sql.to_string());
        Ok(self
            .scalars
            .iter()
            .find(|(p, _)| sql.contains(p.as_str()))
            .map(|(_, v)| v.clone()))
    }
}

/// Catalog rows served from memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    tables: Vec<(TableInfo, Vec<ColumnInfo>, Vec<IndexInfo>)>,
    functions: Vec<FunctionInfo>,
}

impl InMemoryCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a relation with its columns and indexes.
    pub fn with_table(
        mut self,
        table: TableInfo,
        columns: Vec<ColumnInfo>,
        indexes: Vec<IndexInfo>,
    ) -> Self {
        self.tables.push((table, columns, indexes));
        self
    }

    /// Add a function.
    pub fn with_function(mut self, function: FunctionInfo) -> Self {
        self.functions.push(function);
        self
    }

    fn find(&self, schema: &str, table: &str) -> Option<&(TableInfo, Vec<ColumnInfo>, Vec<IndexInfo>)> {
        self.tables
            .iter()
            .find(|(t, _, _)| t.schema == schema && t.name == table)
    }
}

#[async_trait::async_trait]
impl CatalogReader for InMemoryCatalog {
    async fn tables(&self, schema: &str) -> MigrateResult<Vec<TableInfo>> {
        Ok(self
            .tables
            .iter()
            .filter(|(t, _, _)| t.schema == schema)
            .map(|(t, _, _)| t.clone())
            .collect())
    }

    async fn columns(&self, schema: &str, table: &str) -> MigrateResult<Vec<ColumnInfo>> {
        Ok(self.find(schema, table).map(|(_, c, _)| c.clone()).unwrap_or_default())
    }

    async fn indexes(&self, schema: &str, table: &str) -> MigrateResult<Vec<IndexInfo>> {
        Ok(self.find(schema, table).map(|(_, _, i)| i.clone()).unwrap_or_default())
    }

    async fn functions(&self, schema: &str) -> MigrateResult<Vec<FunctionInfo>> {
        Ok(self
            .functions
            .iter()
            .filter(|f| f.schema == schema)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_connection_discards_rolled_back_work() {
        let mut conn = RecordingConnection::new();
        conn.execute("CREATE TABLE a ()").await.unwrap();

        conn.begin().await.unwrap();
        conn.execute("INSERT 1").await.unwrap();
        conn.batch_execute("SAVEPOINT sp").await.unwrap();
        conn.execute("INSERT 2").await.unwrap();
        conn.batch_execute("ROLLBACK TO SAVEPOINT sp").await.unwrap();
        conn.commit().await.unwrap();

        conn.begin().await.unwrap();
        conn.execute("INSERT 3").await.unwrap();
        conn.rollback().await.unwrap();

        assert_eq!(conn.committed(), vec!["CREATE TABLE a ()", "INSERT 1"]);
    }

    #[tokio::test]
    async fn test_insert_active_is_exclusive() {
        let locks = InMemoryLocks::new();
        let row = |id: &str| LockRecord {
            lock_id: id.to_string(),
            migration_id: "m".to_string(),
            acquired_by: "u".to_string(),
            acquired_at: Utc::now(),
            expires_at: Utc::now(),
            released_at: None,
            released_by: None,
            status: LockStatus::Active,
            machine_name: "h".to_string(),
            process_id: 1,
        };

        assert_eq!(locks.insert_active(row("a")).await.unwrap(), InsertOutcome::Inserted);
        assert!(matches!(
            locks.insert_active(row("b")).await.unwrap(),
            InsertOutcome::Conflict(existing) if existing.lock_id == "a"
        ));
        assert_eq!(locks.rows().len(), 1);

        assert!(locks.release("a", "u", Utc::now()).await.unwrap());
        assert!(!locks.force_release("a", "ops", Utc::now()).await.unwrap());
        let released = locks.get("a").await.unwrap().unwrap();
        assert_eq!(released.status, LockStatus::Released);
        assert_eq!(released.released_by.as_deref(), Some("u"));
    }
}
