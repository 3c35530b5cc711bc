//! Table-backed migration lock with TTL expiry and forced takeover.
//!
//! At most one lock row is ACTIVE at a time; the storage enforces this (a
//! partial unique index in PostgreSQL, a mutex in memory), so two processes
//! racing through [`LockManager::try_acquire`] cannot both win. Holders get an
//! explicit [`LockHandle`] back and pass it to [`LockManager::release`].
//!
//! ```rust,ignore
//! let locks = LockManager::new(store);
//! let handle = locks.acquire(&LockRequest::new("migrate").wait(Duration::from_secs(30))).await?;
//! // ... apply migrations ...
//! locks.release(&handle).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{MigrateResult, MigrationError};

/// Lifecycle of a lock row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockStatus {
    /// Held by its owner.
    Active,
    /// Released by its owner.
    Released,
    /// Swept after its TTL passed.
    Expired,
    /// Taken over by another actor.
    ForceReleased,
}

impl LockStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Released => "RELEASED",
            Self::Expired => "EXPIRED",
            Self::ForceReleased => "FORCE_RELEASED",
        }
    }

    /// Parse the storage representation.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ACTIVE" => Some(Self::Active),
            "RELEASED" => Some(Self::Released),
            "EXPIRED" => Some(Self::Expired),
            "FORCE_RELEASED" => Some(Self::ForceReleased),
            _ => None,
        }
    }
}

/// One row of the lock table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Label of the work the lock guards.
    pub migration_id: String,
    /// User that acquired the lock.
    pub acquired_by: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the TTL runs out.
    pub expires_at: DateTime<Utc>,
    /// When the row stopped being active.
    pub released_at: Option<DateTime<Utc>>,
    /// Who ended it: the owner, another actor or the sweeper.
    pub released_by: Option<String>,
    /// Current status.
    pub status: LockStatus,
    /// Host of the holder.
    pub machine_name: String,
    /// Process id of the holder.
    pub process_id: u32,
}

impl LockRecord {
    /// Whether the TTL has passed at `now`.
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

impl From<LockRecord> for MigrationError {
    fn from(holder: LockRecord) -> Self {
        MigrationError::LockHeld {
            lock_id: holder.lock_id,
            holder: holder.acquired_by,
            machine: holder.machine_name,
            acquired_at: holder.acquired_at,
        }
    }
}

/// Result of inserting an ACTIVE row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The row is now the active lock.
    Inserted,
    /// Another row was already active.
    Conflict(LockRecord),
}

/// Storage primitives for the lock table.
#[async_trait::async_trait]
pub trait LockRepository: Send + Sync {
    /// Create the lock table.
    async fn initialize(&self) -> MigrateResult<()>;

    /// Mark every ACTIVE row whose TTL passed as EXPIRED. Returns the count.
    async fn expire_stale(&self, now: DateTime<Utc>) -> MigrateResult<u64>;

    /// The ACTIVE row, if any.
    async fn active(&self) -> MigrateResult<Option<LockRecord>>;

    /// Insert an ACTIVE row unless one already exists. Must be atomic.
    async fn insert_active(&self, record: LockRecord) -> MigrateResult<InsertOutcome>;

    /// Mark a row FORCE_RELEASED if it is still ACTIVE. Returns whether it was.
    async fn force_release(
        &self,
        lock_id: &str,
        by: &str,
        at: DateTime<Utc>,
    ) -> MigrateResult<bool>;

    /// Mark a row RELEASED if it is still ACTIVE. Returns whether it was.
    async fn release(&self, lock_id: &str, by: &str, at: DateTime<Utc>) -> MigrateResult<bool>;

    /// Mark every ACTIVE row FORCE_RELEASED. Returns the count.
    async fn force_release_all(&self, by: &str, at: DateTime<Utc>) -> MigrateResult<u64>;

    /// Fetch a row by id.
    async fn get(&self, lock_id: &str) -> MigrateResult<Option<LockRecord>>;
}

/// Who is acting: user, machine and process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// User name.
    pub user: String,
    /// Host name.
    pub machine: String,
    /// Process id.
    pub process_id: u32,
}

impl Identity {
    /// Create an explicit identity.
    pub fn new(user: impl Into<String>, machine: impl Into<String>, process_id: u32) -> Self {
        Self {
            user: user.into(),
            machine: machine.into(),
            process_id,
        }
    }

    /// Identity of the running process, read from the environment.
    pub fn current() -> Self {
        let from_env = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| std::env::var(k).ok().filter(|v| !v.trim().is_empty()))
                .unwrap_or_else(|| "unknown".to_string())
        };
        Self {
            user: from_env(&["USER", "USERNAME"]),
            machine: from_env(&["HOSTNAME", "COMPUTERNAME"]),
            process_id: std::process::id(),
        }
    }
}

/// Parameters of an acquisition.
#[derive(Debug, Clone)]
pub struct LockRequest {
    /// Label recorded on the lock row.
    pub migration_id: String,
    /// Time-to-live of the lock.
    pub ttl: Duration,
    /// How long to wait for a holder to go away. `None` fails fast.
    pub wait: Option<Duration>,
    /// First poll delay; doubled after each attempt.
    pub poll_interval: Duration,
    /// Take over an active lock instead of waiting.
    pub force: bool,
}

impl LockRequest {
    /// Fail-fast request with a 15 minute TTL.
    pub fn new(migration_id: impl Into<String>) -> Self {
        Self {
            migration_id: migration_id.into(),
            ttl: Duration::from_secs(15 * 60),
            wait: None,
            poll_interval: Duration::from_millis(250),
            force: false,
        }
    }

    /// Set the TTL.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Wait up to `timeout` for the lock.
    pub fn wait(mut self, timeout: Duration) -> Self {
        self.wait = Some(timeout);
        self
    }

    /// Set the first poll delay.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Take over an active lock.
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

/// Token proving ownership of the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    /// Identifier of the held row.
    pub lock_id: String,
    /// Label the lock was taken for.
    pub migration_id: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the TTL runs out.
    pub expires_at: DateTime<Utc>,
}

impl LockHandle {
    /// Whether the TTL has passed. The lock may have been swept by now.
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

impl From<&LockRecord> for LockHandle {
    fn from(record: &LockRecord) -> Self {
        Self {
            lock_id: record.lock_id.clone(),
            migration_id: record.migration_id.clone(),
            acquired_at: record.acquired_at,
            expires_at: record.expires_at,
        }
    }
}

/// Outcome of a single acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    /// The caller now holds the lock.
    Acquired(LockHandle),
    /// Someone else holds it.
    Held(LockRecord),
}

/// Longest delay between polls.
const MAX_POLL_DELAY: Duration = Duration::from_secs(5);

/// Acquires and releases the migration lock.
pub struct LockManager<L: LockRepository> {
    repo: Arc<L>,
    identity: Identity,
}

impl<L: LockRepository + 'static> LockManager<L> {
    /// Create a manager acting as the current process.
    pub fn new(repo: L) -> Self {
        Self::from_arc(Arc::new(repo))
    }

    /// Create a manager over a shared repository.
    pub fn from_arc(repo: Arc<L>) -> Self {
        Self {
            repo,
            identity: Identity::current(),
        }
    }

    /// Act as a different identity.
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    /// The acting identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Access the repository.
    pub fn repository(&self) -> &Arc<L> {
        &self.repo
    }

    /// One attempt: sweep stale rows, then take the lock or report the holder.
    pub async fn try_acquire(&self, request: &LockRequest) -> MigrateResult<LockOutcome> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(request.ttl)
            .map_err(|e| MigrationError::config(format!("Invalid lock TTL: {}", e)))?;

        let expired = self.repo.expire_stale(now).await?;
        if expired > 0 {
            info!(count = expired, "Expired stale migration locks");
        }

        if let Some(active) = self.repo.active().await? {
            if !request.force {
                debug!(lock_id = %active.lock_id, holder = %active.acquired_by, "Migration lock is held");
                return Ok(LockOutcome::Held(active));
            }
            let taken = self
                .repo
                .force_release(&active.lock_id, &self.identity.user, now)
                .await?;
            if taken {
                warn!(
                    lock_id = %active.lock_id,
                    previous_holder = %active.acquired_by,
                    previous_machine = %active.machine_name,
                    previous_pid = active.process_id,
                    taken_by = %self.identity.user,
                    "Forcibly took over migration lock"
                );
            } else {
                debug!(lock_id = %active.lock_id, "Holder let go before the takeover");
            }
        }

        let record = LockRecord {
            lock_id: uuid::Uuid::new_v4().to_string(),
            migration_id: request.migration_id.clone(),
            acquired_by: self.identity.user.clone(),
            acquired_at: now,
            expires_at: now + ttl,
            released_at: None,
            released_by: None,
            status: LockStatus::Active,
            machine_name: self.identity.machine.clone(),
            process_id: self.identity.process_id,
        };

        match self.repo.insert_active(record.clone()).await? {
            InsertOutcome::Inserted => {
                info!(
                    lock_id = %record.lock_id,
                    migration_id = %record.migration_id,
                    expires_at = %record.expires_at,
                    "Migration lock acquired"
                );
                Ok(LockOutcome::Acquired(LockHandle::from(&record)))
            }
            InsertOutcome::Conflict(existing) => Ok(LockOutcome::Held(existing)),
        }
    }

    /// Acquire, polling with exponential backoff until the request's wait
    /// timeout. Fails with [`MigrationError::LockHeld`] naming the holder.
    pub async fn acquire(&self, request: &LockRequest) -> MigrateResult<LockHandle> {
        let deadline = request.wait.map(|w| tokio::time::Instant::now() + w);
        let mut delay = request.poll_interval.max(Duration::from_millis(1));

        loop {
            let holder = match self.try_acquire(request).await? {
                LockOutcome::Acquired(handle) => return Ok(handle),
                LockOutcome::Held(holder) => holder,
            };

            let Some(deadline) = deadline else {
                return Err(holder.into());
            };
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(holder.into());
            }

            let sleep = delay.min(deadline - now);
            debug!(holder = %holder.acquired_by, wait_ms = sleep.as_millis() as u64, "Waiting for migration lock");
            tokio::time::sleep(sleep).await;
            delay = (delay * 2).min(MAX_POLL_DELAY);
        }
    }

    /// Release a held lock. Releasing twice, or after expiry, is a no-op.
    pub async fn release(&self, handle: &LockHandle) -> MigrateResult<bool> {
        let released = self
            .repo
            .release(&handle.lock_id, &self.identity.user, Utc::now())
            .await?;
        if released {
            info!(lock_id = %handle.lock_id, "Migration lock released");
        } else {
            debug!(lock_id = %handle.lock_id, "Migration lock was no longer active");
        }
        Ok(released)
    }

    /// Release every active lock regardless of holder.
    pub async fn force_release_all(&self, actor: &str) -> MigrateResult<u64> {
        let count = self.repo.force_release_all(actor, Utc::now()).await?;
        warn!(count, actor = %actor, "Force-released migration locks");
        Ok(count)
    }

    /// Start a background sweeper over this manager's repository.
    pub fn spawn_sweeper(&self, interval: Duration) -> LockSweeper {
        LockSweeper::spawn(Arc::clone(&self.repo), interval)
    }
}

/// Background task that periodically expires stale locks.
pub struct LockSweeper {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LockSweeper {
    /// Spawn the sweeper on the current runtime.
    pub fn spawn<L: LockRepository + 'static>(repo: Arc<L>, interval: Duration) -> Self {
        let (stop, mut stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            debug!(interval_ms = interval.as_millis() as u64, "Lock sweeper started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        match repo.expire_stale(Utc::now()).await {
                            Ok(0) => {}
                            Ok(count) => info!(count, "Lock sweeper expired stale locks"),
                            Err(e) => error!(error = %e, "Lock sweep failed"),
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Lock sweeper stopped");
        });

        Self { stop, task }
    }

    /// Signal the sweeper to stop and wait for it.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Lock sweeper task failed");
        }
    }
}

/// SQL for the lock table (PostgreSQL).
pub const POSTGRES_INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS "_tidemark_locks" (
    lock_id VARCHAR(64) PRIMARY KEY,
    migration_id VARCHAR(255) NOT NULL,
    acquired_by VARCHAR(255) NOT NULL,
    acquired_at TIMESTAMP WITH TIME ZONE NOT NULL,
    expires_at TIMESTAMP WITH TIME ZONE NOT NULL,
    released_at TIMESTAMP WITH TIME ZONE,
    released_by VARCHAR(255),
    status VARCHAR(16) NOT NULL,
    machine_name VARCHAR(255) NOT NULL,
    process_id BIGINT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS "_tidemark_locks_single_active"
    ON "_tidemark_locks" (status) WHERE status = 'ACTIVE';
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryLocks;

    fn manager(store: &Arc<InMemoryLocks>, user: &str) -> LockManager<InMemoryLocks> {
        LockManager::from_arc(Arc::clone(store)).with_identity(Identity::new(user, "host", 42))
    }

    /// Lets the holder release right after `active()` reports it.
    struct ReleasingHolder {
        inner: InMemoryLocks,
    }

    #[async_trait::async_trait]
    impl LockRepository for ReleasingHolder {
        async fn initialize(&self) -> MigrateResult<()> {
            self.inner.initialize().await
        }

        async fn expire_stale(&self, now: DateTime<Utc>) -> MigrateResult<u64> {
            self.inner.expire_stale(now).await
        }

        async fn active(&self) -> MigrateResult<Option<LockRecord>> {
            let active = self.inner.active().await?;
            if let Some(holder) = &active {
                self.inner
                    .release(&holder.lock_id, &holder.acquired_by, Utc::now())
                    .await?;
            }
            Ok(active)
        }

        async fn insert_active(&self, record: LockRecord) -> MigrateResult<InsertOutcome> {
            self.inner.insert_active(record).await
        }

        async fn force_release(
            &self,
            lock_id: &str,
            by: &str,
            at: DateTime<Utc>,
        ) -> MigrateResult<bool> {
            self.inner.force_release(lock_id, by, at).await
        }

        async fn release(&self, lock_id: &str, by: &str, at: DateTime<Utc>) -> MigrateResult<bool> {
            self.inner.release(lock_id, by, at).await
        }

        async fn force_release_all(&self, by: &str, at: DateTime<Utc>) -> MigrateResult<u64> {
            self.inner.force_release_all(by, at).await
        }

        async fn get(&self, lock_id: &str) -> MigrateResult<Option<LockRecord>> {
            self.inner.get(lock_id).await
        }
    }

    #[tokio::test]
    async fn test_second_holder_sees_first() {
        let store = Arc::new(InMemoryLocks::new());
        let alice = manager(&store, "alice");
        let bob = manager(&store, "bob");
        let request = LockRequest::new("migrate");

        let handle = match alice.try_acquire(&request).await.unwrap() {
            LockOutcome::Acquired(h) => h,
            other => panic!("expected lock, got {:?}", other),
        };

        match bob.try_acquire(&request).await.unwrap() {
            LockOutcome::Held(holder) => {
                assert_eq!(holder.acquired_by, "alice");
                assert_eq!(holder.lock_id, handle.lock_id);
            }
            other => panic!("expected holder, got {:?}", other),
        }

        let err = bob.acquire(&request).await.unwrap_err();
        assert!(matches!(err, MigrationError::LockHeld { ref holder, .. } if holder == "alice"));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let store = Arc::new(InMemoryLocks::new());
        let alice = manager(&store, "alice");
        let handle = alice.acquire(&LockRequest::new("migrate")).await.unwrap();

        assert!(alice.release(&handle).await.unwrap());
        assert!(!alice.release(&handle).await.unwrap());

        let row = store.get(&handle.lock_id).await.unwrap().unwrap();
        assert_eq!(row.status, LockStatus::Released);
        assert_eq!(row.released_by.as_deref(), Some("alice"));
        assert!(store.active().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_lock_is_expired_before_acquire() {
        let store = Arc::new(InMemoryLocks::new());
        let alice = manager(&store, "alice");
        let bob = manager(&store, "bob");

        let stale = alice
            .acquire(&LockRequest::new("migrate").ttl(Duration::ZERO))
            .await
            .unwrap();
        assert!(stale.is_expired());

        let fresh = bob.acquire(&LockRequest::new("migrate")).await.unwrap();
        assert_ne!(fresh.lock_id, stale.lock_id);
        assert_eq!(
            store.get(&stale.lock_id).await.unwrap().unwrap().status,
            LockStatus::Expired
        );
    }

    #[tokio::test]
    async fn test_force_takeover() {
        let store = Arc::new(InMemoryLocks::new());
        let alice = manager(&store, "alice");
        let bob = manager(&store, "bob");

        let first = alice.acquire(&LockRequest::new("migrate")).await.unwrap();
        let second = bob
            .acquire(&LockRequest::new("migrate").force(true))
            .await
            .unwrap();

        let old = store.get(&first.lock_id).await.unwrap().unwrap();
        assert_eq!(old.status, LockStatus::ForceReleased);
        assert_eq!(old.released_by.as_deref(), Some("bob"));
        assert_eq!(store.active().await.unwrap().unwrap().lock_id, second.lock_id);

        // Alice's late release must not free Bob's lock.
        assert!(!alice.release(&first).await.unwrap());
        assert!(store.active().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_takeover_keeps_release_of_departed_holder() {
        let store = Arc::new(ReleasingHolder {
            inner: InMemoryLocks::new(),
        });
        let alice = LockManager::from_arc(Arc::clone(&store))
            .with_identity(Identity::new("alice", "host", 1));
        let bob = LockManager::from_arc(Arc::clone(&store))
            .with_identity(Identity::new("bob", "host", 2));

        let first = match alice.try_acquire(&LockRequest::new("migrate")).await.unwrap() {
            LockOutcome::Acquired(h) => h,
            other => panic!("expected lock, got {:?}", other),
        };
        let second = bob
            .acquire(&LockRequest::new("migrate").force(true))
            .await
            .unwrap();

        let old = store.get(&first.lock_id).await.unwrap().unwrap();
        assert_eq!(old.status, LockStatus::Released);
        assert_eq!(old.released_by.as_deref(), Some("alice"));
        assert_eq!(
            store.get(&second.lock_id).await.unwrap().unwrap().status,
            LockStatus::Active
        );
    }

    #[tokio::test]
    async fn test_waiting_acquire_succeeds_after_release() {
        let store = Arc::new(InMemoryLocks::new());
        let alice = Arc::new(manager(&store, "alice"));
        let bob = manager(&store, "bob");

        let handle = alice.acquire(&LockRequest::new("migrate")).await.unwrap();
        let releaser = {
            let alice = Arc::clone(&alice);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                alice.release(&handle).await.unwrap();
            })
        };

        let request = LockRequest::new("migrate")
            .wait(Duration::from_secs(5))
            .poll_interval(Duration::from_millis(5));
        let acquired = bob.acquire(&request).await.unwrap();
        releaser.await.unwrap();

        assert_eq!(store.active().await.unwrap().unwrap().lock_id, acquired.lock_id);
    }

    #[tokio::test]
    async fn test_waiting_acquire_times_out() {
        let store = Arc::new(InMemoryLocks::new());
        let alice = manager(&store, "alice");
        let bob = manager(&store, "bob");

        alice.acquire(&LockRequest::new("migrate")).await.unwrap();
        let request = LockRequest::new("migrate")
            .wait(Duration::from_millis(40))
            .poll_interval(Duration::from_millis(5));
        assert!(matches!(
            bob.acquire(&request).await,
            Err(MigrationError::LockHeld { .. })
        ));
    }

    #[tokio::test]
    async fn test_force_release_all() {
        let store = Arc::new(InMemoryLocks::new());
        let alice = manager(&store, "alice");
        alice.acquire(&LockRequest::new("migrate")).await.unwrap();

        assert_eq!(alice.force_release_all("ops").await.unwrap(), 1);
        assert_eq!(alice.force_release_all("ops").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweeper_expires_and_stops() {
        let store = Arc::new(InMemoryLocks::new());
        let alice = manager(&store, "alice");
        let handle = alice
            .acquire(&LockRequest::new("migrate").ttl(Duration::ZERO))
            .await
            .unwrap();

        let sweeper = alice.spawn_sweeper(Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(50)).await;
        sweeper.shutdown().await;

        assert_eq!(
            store.get(&handle.lock_id).await.unwrap().unwrap().status,
            LockStatus::Expired
        );
    }

    #[test]
    fn test_status_strings() {
        for status in [
            LockStatus::Active,
            LockStatus::Released,
            LockStatus::Expired,
            LockStatus::ForceReleased,
        ] {
            assert_eq!(LockStatus::parse(status.as_str()), Some(status));
        }
        assert!(POSTGRES_INIT_SQL.contains("WHERE status = 'ACTIVE'"));
    }
}
