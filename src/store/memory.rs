//! Embedded in-process store.
//!
//! Implements every store capability against a single process-local table so
//! the strategies can be exercised without an external server. Versioned
//! entries back compare-and-swap, per-key tokio mutexes back transaction locks,
//! and an expiring lock table backs the named mutexes.
//!
//! Faults and latency can be injected to reproduce replication hiccups and to
//! widen the gap between a read and the following write.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, Notify, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{
    ConditionalStore, KvStore, LockService, LockToken, LockWait, Script, ScriptContext,
    ScriptStore, StoreError, Transaction, TransactionalStore, Versioned,
};

/// Configuration for the embedded store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStoreConfig {
    /// Artificial delay added to every operation, in milliseconds
    #[serde(default)]
    pub latency_ms: u64,
}

struct Entry {
    value: Vec<u8>,
    version: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

struct HeldLock {
    id: Uuid,
    expires_at: Instant,
}

struct Inner {
    entries: Mutex<HashMap<String, Entry>>,
    next_version: AtomicU64,
    key_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    named_locks: Mutex<HashMap<String, HeldLock>>,
    lock_released: Notify,
    pending_unavailable: AtomicU32,
    pending_conflicts: AtomicU32,
    operations: AtomicU64,
    latency: Option<Duration>,
}

impl Inner {
    fn bump_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// An embedded store implementing every capability.
///
/// Cloning is cheap; clones share the same table.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.inner.entries.lock().len())
            .field("operations", &self.operation_count())
            .field("latency", &self.inner.latency)
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store with no injected latency.
    pub fn new() -> Self {
        Self::with_config(&MemoryStoreConfig::default())
    }

    /// Create an empty store from configuration.
    pub fn with_config(config: &MemoryStoreConfig) -> Self {
        let latency = (config.latency_ms > 0).then(|| Duration::from_millis(config.latency_ms));
        Self::build(latency)
    }

    /// Create an empty store that delays every operation by `latency`.
    pub fn with_latency(latency: Duration) -> Self {
        Self::build(Some(latency))
    }

    fn build(latency: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                next_version: AtomicU64::new(0),
                key_locks: DashMap::new(),
                named_locks: Mutex::new(HashMap::new()),
                lock_released: Notify::new(),
                pending_unavailable: AtomicU32::new(0),
                pending_conflicts: AtomicU32::new(0),
                operations: AtomicU64::new(0),
                latency,
            }),
        }
    }

    /// Fail the next `n` operations with [`StoreError::QuorumUnavailable`].
    pub fn fail_next_unavailable(&self, n: u32) {
        self.inner.pending_unavailable.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` transaction commits with [`StoreError::WriteConflict`].
    pub fn conflict_next_commits(&self, n: u32) {
        self.inner.pending_conflicts.store(n, Ordering::SeqCst);
    }

    /// Total number of operations issued against this store.
    pub fn operation_count(&self) -> u64 {
        self.inner.operations.load(Ordering::SeqCst)
    }

    /// Number of live named locks.
    pub fn held_lock_count(&self) -> usize {
        let now = Instant::now();
        self.inner
            .named_locks
            .lock()
            .values()
            .filter(|held| held.expires_at > now)
            .count()
    }

    async fn enter(&self, op: &'static str) -> Result<(), StoreError> {
        self.inner.operations.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.inner.latency {
            tokio::time::sleep(latency).await;
        }
        if take_one(&self.inner.pending_unavailable) {
            debug!(op, "Injected quorum failure");
            return Err(StoreError::QuorumUnavailable(op.to_string()));
        }
        Ok(())
    }

    fn key_lock(&self, key: &str) -> Arc<AsyncMutex<()>> {
        self.inner
            .key_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn parse_counter(key: &str, raw: &[u8]) -> Result<i64, StoreError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .ok_or_else(|| StoreError::Corrupt {
            key: key.to_string(),
            reason: "value is not an integer".to_string(),
        })
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.enter("get").await?;
        let now = Instant::now();
        let entries = self.inner.entries.lock();
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.enter("put").await?;
        let now = Instant::now();
        let version = self.inner.bump_version();
        self.inner.entries.lock().insert(
            key.to_string(),
            Entry {
                value,
                version,
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.enter("delete").await?;
        let now = Instant::now();
        Ok(self
            .inner
            .entries
            .lock()
            .remove(key)
            .is_some_and(|e| e.is_live(now)))
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.enter("incr").await?;
        let now = Instant::now();
        let mut entries = self.inner.entries.lock();
        incr_entry(&self.inner, &mut entries, key, delta, now)
    }
}

fn incr_entry(
    inner: &Inner,
    entries: &mut HashMap<String, Entry>,
    key: &str,
    delta: i64,
    now: Instant,
) -> Result<i64, StoreError> {
    let (current, expires_at) = match entries.get(key).filter(|e| e.is_live(now)) {
        Some(entry) => (parse_counter(key, &entry.value)?, entry.expires_at),
        None => (0, None),
    };
    let next = current.checked_add(delta).ok_or_else(|| StoreError::Corrupt {
        key: key.to_string(),
        reason: "increment overflows".to_string(),
    })?;
    entries.insert(
        key.to_string(),
        Entry {
            value: next.to_string().into_bytes(),
            version: inner.bump_version(),
            expires_at,
        },
    );
    Ok(next)
}

#[async_trait]
impl ConditionalStore for MemoryStore {
    async fn get_versioned(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        self.enter("get_versioned").await?;
        let now = Instant::now();
        let entries = self.inner.entries.lock();
        Ok(entries.get(key).filter(|e| e.is_live(now)).map(|e| Versioned {
            value: e.value.clone(),
            version: e.version,
        }))
    }

    async fn compare_and_put(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        self.enter("compare_and_put").await?;
        let now = Instant::now();
        let mut entries = self.inner.entries.lock();
        let current = entries.get(key).filter(|e| e.is_live(now)).map(|e| e.version);
        if current != expected {
            trace!(key, ?expected, ?current, "Compare-and-put lost the race");
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value,
                version: self.inner.bump_version(),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(true)
    }
}

/// Transaction over a [`MemoryStore`].
///
/// Key locks are held as owned mutex guards, so they are released on commit,
/// rollback, or drop.
pub struct MemoryTransaction {
    store: MemoryStore,
    guards: HashMap<String, OwnedMutexGuard<()>>,
    reads: HashMap<String, Option<u64>>,
    writes: HashMap<String, (Vec<u8>, Option<Duration>)>,
}

impl MemoryTransaction {
    /// Number of key locks currently held.
    pub fn held_locks(&self) -> usize {
        self.guards.len()
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn lock(&mut self, key: &str, wait: LockWait) -> Result<(), StoreError> {
        if self.guards.contains_key(key) {
            return Ok(());
        }
        self.store.enter("lock").await?;
        let mutex = self.store.key_lock(key);
        let guard = match wait {
            LockWait::Block => mutex.lock_owned().await,
            LockWait::NoWait => mutex
                .try_lock_owned()
                .map_err(|_| StoreError::LockTimeout(key.to_string()))?,
            LockWait::Timeout(limit) => tokio::time::timeout(limit, mutex.lock_owned())
                .await
                .map_err(|_| StoreError::LockTimeout(key.to_string()))?,
        };
        self.guards.insert(key.to_string(), guard);
        Ok(())
    }

    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some((value, _)) = self.writes.get(key) {
            return Ok(Some(value.clone()));
        }
        self.store.enter("txn_get").await?;
        let now = Instant::now();
        let entries = self.store.inner.entries.lock();
        let entry = entries.get(key).filter(|e| e.is_live(now));
        self.reads
            .entry(key.to_string())
            .or_insert_with(|| entry.map(|e| e.version));
        Ok(entry.map(|e| e.value.clone()))
    }

    fn set(&mut self, key: &str, value: Vec<u8>, ttl: Option<Duration>) {
        self.writes.insert(key.to_string(), (value, ttl));
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.store.enter("commit").await?;
        if take_one(&self.store.inner.pending_conflicts) {
            debug!("Injected commit conflict");
            return Err(StoreError::WriteConflict("injected".to_string()));
        }

        let now = Instant::now();
        let inner = &self.store.inner;
        let mut entries = inner.entries.lock();

        for key in self.writes.keys() {
            if let Some(seen) = self.reads.get(key) {
                let current = entries.get(key).filter(|e| e.is_live(now)).map(|e| e.version);
                if current != *seen {
                    return Err(StoreError::WriteConflict(key.clone()));
                }
            }
        }

        for (key, (value, ttl)) in self.writes {
            entries.insert(
                key,
                Entry {
                    value,
                    version: inner.bump_version(),
                    expires_at: ttl.map(|ttl| now + ttl),
                },
            );
        }
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.store.inner.operations.fetch_add(1, Ordering::SeqCst);
        trace!(locks = self.guards.len(), "Rolling back transaction");
        Ok(())
    }
}

#[async_trait]
impl TransactionalStore for MemoryStore {
    type Txn = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction, StoreError> {
        self.enter("begin").await?;
        Ok(MemoryTransaction {
            store: self.clone(),
            guards: HashMap::new(),
            reads: HashMap::new(),
            writes: HashMap::new(),
        })
    }
}

struct MemoryScriptContext<'a> {
    inner: &'a Inner,
    entries: &'a mut HashMap<String, Entry>,
    now: Instant,
}

impl ScriptContext for MemoryScriptContext<'_> {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries
            .get(key)
            .filter(|e| e.is_live(self.now))
            .map(|e| e.value.clone())
    }

    fn set(&mut self, key: &str, value: Vec<u8>) {
        let version = self.inner.bump_version();
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                version,
                expires_at: None,
            },
        );
    }

    fn expire(&mut self, key: &str, ttl: Duration) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(self.now + ttl);
        }
    }

    fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64, StoreError> {
        incr_entry(self.inner, self.entries, key, delta, self.now)
    }
}

#[async_trait]
impl ScriptStore for MemoryStore {
    async fn eval(
        &self,
        script: &Script,
        keys: &[String],
        args: &[i64],
    ) -> Result<Vec<i64>, StoreError> {
        self.enter("eval").await?;
        let mut entries = self.inner.entries.lock();
        let mut ctx = MemoryScriptContext {
            inner: &self.inner,
            entries: &mut *entries,
            now: Instant::now(),
        };
        script.invoke(&mut ctx, keys, args)
    }
}

#[async_trait]
impl LockService for MemoryStore {
    async fn acquire_lock(
        &self,
        name: &str,
        ttl: Duration,
        acquire_timeout: Duration,
    ) -> Result<LockToken, StoreError> {
        self.enter("acquire_lock").await?;
        let deadline = Instant::now() + acquire_timeout;

        loop {
            let notified = self.inner.lock_released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let holder_expires_at = {
                let mut locks = self.inner.named_locks.lock();
                let now = Instant::now();
                match locks.get(name) {
                    Some(held) if held.expires_at > now => held.expires_at,
                    _ => {
                        let id = Uuid::new_v4();
                        locks.insert(
                            name.to_string(),
                            HeldLock {
                                id,
                                expires_at: now + ttl,
                            },
                        );
                        return Ok(LockToken {
                            name: name.to_string(),
                            id,
                        });
                    }
                }
            };

            if Instant::now() >= deadline {
                return Err(StoreError::LockTimeout(name.to_string()));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(holder_expires_at.min(deadline)) => {}
            }
        }
    }

    async fn release_lock(&self, token: &LockToken) -> Result<(), StoreError> {
        self.inner.operations.fetch_add(1, Ordering::SeqCst);
        let released = {
            let mut locks = self.inner.named_locks.lock();
            match locks.get(&token.name) {
                Some(held) if held.id == token.id => {
                    locks.remove(&token.name);
                    true
                }
                _ => false,
            }
        };

        if released {
            self.inner.lock_released.notify_waiters();
            Ok(())
        } else {
            Err(StoreError::LockNotHeld(token.name.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();

        assert_eq!(store.get("k").await.unwrap(), None);
        store.put("k", b"v".to_vec(), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));

        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert_eq!(store.operation_count(), 5);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .put("k", b"v".to_vec(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(store.get("k").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incr_creates_and_rejects_non_integers() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("n", 5).await.unwrap(), 5);
        assert_eq!(store.incr("n", 2).await.unwrap(), 7);

        store.put("s", b"not a number".to_vec(), None).await.unwrap();
        assert!(matches!(
            store.incr("s", 1).await,
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_compare_and_put() {
        let store = MemoryStore::new();

        // Absent key: only an "expect absent" write succeeds
        assert!(!store.compare_and_put("k", Some(1), b"a".to_vec(), None).await.unwrap());
        assert!(store.compare_and_put("k", None, b"a".to_vec(), None).await.unwrap());

        let seen = store.get_versioned("k").await.unwrap().unwrap();
        assert_eq!(seen.value, b"a".to_vec());

        // Someone else writes in between
        store.put("k", b"b".to_vec(), None).await.unwrap();
        assert!(!store
            .compare_and_put("k", Some(seen.version), b"c".to_vec(), None)
            .await
            .unwrap());

        let fresh = store.get_versioned("k").await.unwrap().unwrap();
        assert!(store
            .compare_and_put("k", Some(fresh.version), b"c".to_vec(), None)
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(b"c".to_vec()));
    }

    #[tokio::test]
    async fn test_transaction_commit_and_rollback() {
        let store = MemoryStore::new();

        let mut txn = store.begin().await.unwrap();
        txn.lock("k", LockWait::Block).await.unwrap();
        assert_eq!(txn.get("k").await.unwrap(), None);
        txn.set("k", b"1".to_vec(), None);
        assert_eq!(txn.get("k").await.unwrap(), Some(b"1".to_vec()));
        txn.commit().await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"1".to_vec()));

        let mut txn = store.begin().await.unwrap();
        txn.lock("k", LockWait::Block).await.unwrap();
        txn.set("k", b"2".to_vec(), None);
        txn.rollback().await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn test_transaction_lock_released_on_rollback_and_drop() {
        let store = MemoryStore::new();

        let mut first = store.begin().await.unwrap();
        first.lock("k", LockWait::Block).await.unwrap();
        assert_eq!(first.held_locks(), 1);

        let mut second = store.begin().await.unwrap();
        assert!(matches!(
            second.lock("k", LockWait::NoWait).await,
            Err(StoreError::LockTimeout(_))
        ));

        first.rollback().await.unwrap();
        second.lock("k", LockWait::NoWait).await.unwrap();

        drop(second);
        let mut third = store.begin().await.unwrap();
        third.lock("k", LockWait::NoWait).await.unwrap();
    }

    #[tokio::test]
    async fn test_transaction_detects_write_conflict() {
        let store = MemoryStore::new();
        store.put("k", b"0".to_vec(), None).await.unwrap();

        let mut txn = store.begin().await.unwrap();
        txn.get("k").await.unwrap();
        txn.set("k", b"1".to_vec(), None);

        // A writer that does not take the transaction lock
        store.put("k", b"9".to_vec(), None).await.unwrap();

        assert!(matches!(
            txn.commit().await,
            Err(StoreError::WriteConflict(_))
        ));
        assert_eq!(store.get("k").await.unwrap(), Some(b"9".to_vec()));
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let store = MemoryStore::new();
        store.fail_next_unavailable(2);

        assert!(matches!(
            store.get("k").await,
            Err(StoreError::QuorumUnavailable(_))
        ));
        assert!(store.get("k").await.unwrap_err().is_transient());
        assert_eq!(store.get("k").await.unwrap(), None);

        store.conflict_next_commits(1);
        let txn = store.begin().await.unwrap();
        assert!(matches!(
            txn.commit().await,
            Err(StoreError::WriteConflict(_))
        ));
        let txn = store.begin().await.unwrap();
        txn.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_named_lock_timeout_and_release() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(5);

        let token = store
            .acquire_lock("lock:k", ttl, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(store.held_lock_count(), 1);

        let err = store
            .acquire_lock("lock:k", ttl, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::LockTimeout("lock:k".to_string()));

        store.release_lock(&token).await.unwrap();
        assert_eq!(store.held_lock_count(), 0);
        assert!(matches!(
            store.release_lock(&token).await,
            Err(StoreError::LockNotHeld(_))
        ));
    }

    #[tokio::test]
    async fn test_named_lock_waiter_woken_by_release() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(5);
        let token = store
            .acquire_lock("lock:k", ttl, Duration::from_millis(10))
            .await
            .unwrap();

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .acquire_lock("lock:k", ttl, Duration::from_secs(2))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.release_lock(&token).await.unwrap();

        let second = waiter.await.unwrap().unwrap();
        assert_ne!(second.id, token.id);
    }

    #[tokio::test]
    async fn test_expired_named_lock_is_taken_over() {
        let store = MemoryStore::new();
        let stale = store
            .acquire_lock("lock:k", Duration::from_millis(20), Duration::from_millis(10))
            .await
            .unwrap();

        let fresh = store
            .acquire_lock("lock:k", Duration::from_secs(5), Duration::from_secs(1))
            .await
            .unwrap();
        assert_ne!(stale.id, fresh.id);

        assert!(matches!(
            store.release_lock(&stale).await,
            Err(StoreError::LockNotHeld(_))
        ));
        store.release_lock(&fresh).await.unwrap();
    }

    #[tokio::test]
    async fn test_script_runs_atomically() {
        let store = MemoryStore::new();
        let script = Script::new("bump_both", |ctx, keys, args| {
            let a = ctx.incr_by(&keys[0], args[0])?;
            let b = ctx.incr_by(&keys[1], args[0])?;
            ctx.expire(&keys[0], Duration::from_secs(60));
            Ok(vec![a, b])
        });

        let keys = vec!["a".to_string(), "b".to_string()];
        assert_eq!(store.eval(&script, &keys, &[3]).await.unwrap(), vec![3, 3]);
        assert_eq!(store.eval(&script, &keys, &[2]).await.unwrap(), vec![5, 5]);
        assert_eq!(store.get("b").await.unwrap(), Some(b"5".to_vec()));
    }
}
