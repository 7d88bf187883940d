//! Store capabilities consumed by the consistency strategies.
//!
//! Each strategy asks for the narrowest capability it needs. A backend adapter
//! implements whichever of these traits its store can honor; the embedded
//! [`MemoryStore`] implements all of them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

mod memory;

pub use memory::{MemoryStore, MemoryStoreConfig};

/// Errors reported by a store adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The key does not exist and no default was substituted.
    #[error("key not found: {0}")]
    NotFound(String),

    /// A concurrent commit touched the same key.
    #[error("write conflict on {0}")]
    WriteConflict(String),

    /// Not enough replicas acknowledged the operation.
    #[error("quorum unavailable: {0}")]
    QuorumUnavailable(String),

    /// The store could not be reached.
    #[error("store unreachable: {0}")]
    Unreachable(String),

    /// A lock could not be acquired in time.
    #[error("timed out acquiring lock {0}")]
    LockTimeout(String),

    /// The lock expired and is now owned by somebody else.
    #[error("lock {0} is not held by this token")]
    LockNotHeld(String),

    /// Stored bytes could not be interpreted.
    #[error("corrupt value at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// A server-side script failed.
    #[error("script {name} failed: {reason}")]
    Script { name: String, reason: String },
}

impl StoreError {
    /// Whether the failure is a transient availability problem.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::QuorumUnavailable(_) | StoreError::Unreachable(_)
        )
    }
}

/// A value together with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: Vec<u8>,
    pub version: u64,
}

/// Plain key-value access.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a key, returning `None` when it is absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Unconditionally write a key, optionally with a time-to-live.
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
        -> Result<(), StoreError>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Atomically add `delta` to an integer counter, creating it at zero.
    async fn incr(&self, key: &str, delta: i64) -> Result<i64, StoreError>;
}

/// Version-checked writes (compare-and-swap).
#[async_trait]
pub trait ConditionalStore: KvStore {
    /// Read a key together with its current version.
    async fn get_versioned(&self, key: &str) -> Result<Option<Versioned>, StoreError>;

    /// Write `value` only if the key is still at `expected`.
    ///
    /// `expected == None` means the key must still be absent. Returns `false`
    /// when the condition no longer holds.
    async fn compare_and_put(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;
}

/// How long a transaction waits for a key lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWait {
    /// Wait until the lock is granted. Callers bound this with their own deadline.
    Block,
    /// Fail immediately if the lock is held.
    NoWait,
    /// Wait at most this long.
    Timeout(Duration),
}

/// An open transaction.
///
/// Dropping a transaction without committing rolls it back and releases every
/// lock it holds.
#[async_trait]
pub trait Transaction: Send {
    /// Take an exclusive lock on `key` for the rest of the transaction.
    async fn lock(&mut self, key: &str, wait: LockWait) -> Result<(), StoreError>;

    /// Read a key as seen by this transaction.
    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Buffer a write, applied on commit.
    fn set(&mut self, key: &str, value: Vec<u8>, ttl: Option<Duration>);

    /// Apply buffered writes. Fails with [`StoreError::WriteConflict`] if a
    /// key read by this transaction changed underneath it.
    async fn commit(self) -> Result<(), StoreError>;

    /// Discard buffered writes and release locks.
    async fn rollback(self) -> Result<(), StoreError>;
}

/// Stores that support interactive transactions.
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    type Txn: Transaction + 'static;

    async fn begin(&self) -> Result<Self::Txn, StoreError>;
}

/// Operations available to a script while it runs on the store.
pub trait ScriptContext {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn set(&mut self, key: &str, value: Vec<u8>);
    fn expire(&mut self, key: &str, ttl: Duration);
    fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64, StoreError>;
}

type ScriptBody =
    dyn Fn(&mut dyn ScriptContext, &[String], &[i64]) -> Result<Vec<i64>, StoreError> + Send + Sync;

/// A named program evaluated by the store as one indivisible step.
#[derive(Clone)]
pub struct Script {
    name: &'static str,
    body: Arc<ScriptBody>,
}

impl Script {
    pub fn new<F>(name: &'static str, body: F) -> Self
    where
        F: Fn(&mut dyn ScriptContext, &[String], &[i64]) -> Result<Vec<i64>, StoreError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name,
            body: Arc::new(body),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Run the script against a context. Only store adapters call this.
    pub fn invoke(
        &self,
        ctx: &mut dyn ScriptContext,
        keys: &[String],
        args: &[i64],
    ) -> Result<Vec<i64>, StoreError> {
        (self.body)(ctx, keys, args)
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Script").field("name", &self.name).finish()
    }
}

/// Server-side atomic script execution.
#[async_trait]
pub trait ScriptStore: Send + Sync {
    async fn eval(
        &self,
        script: &Script,
        keys: &[String],
        args: &[i64],
    ) -> Result<Vec<i64>, StoreError>;
}

/// Proof of ownership of a named distributed lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub name: String,
    pub id: Uuid,
}

/// Named distributed mutexes with a time-to-live.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Acquire `name`, waiting at most `acquire_timeout`. The lock expires on
    /// its own after `ttl` if never released.
    async fn acquire_lock(
        &self,
        name: &str,
        ttl: Duration,
        acquire_timeout: Duration,
    ) -> Result<LockToken, StoreError>;

    /// Release a lock previously returned by [`LockService::acquire_lock`].
    async fn release_lock(&self, token: &LockToken) -> Result<(), StoreError>;
}
