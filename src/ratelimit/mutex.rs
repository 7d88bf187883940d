//! Distributed mutex: take a named lock for the key, then do a plain
//! read-check-write while holding it.
//!
//! The lock has a time-to-live so a crashed holder cannot wedge the key
//! forever. A critical section that outlives the TTL is no longer exclusive;
//! `lock_ttl_ms` must comfortably exceed one store round trip.

use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use super::context::RequestContext;
use super::outcome::{Admission, ConsumeError};
use super::strategy::{decode_or_default, denial, ConsistencyStrategy, StrategyConfig};
use super::window::LimiterState;
use crate::store::{KvStore, LockService, LockToken};

/// Named lock around a read-check-write.
pub struct MutexStrategy<S> {
    store: S,
    config: StrategyConfig,
}

impl<S> MutexStrategy<S>
where
    S: LockService + KvStore + Clone + 'static,
{
    pub fn new(store: S, config: &StrategyConfig) -> Self {
        Self {
            store,
            config: config.clone(),
        }
    }

    fn lock_name(key: &str) -> String {
        format!("lock:{}", key)
    }

    /// Wait for the configured acquire timeout, but never past the caller's deadline.
    fn acquire_timeout(&self, ctx: &RequestContext) -> Duration {
        let configured = Duration::from_millis(self.config.lock_acquire_timeout_ms);
        match ctx.remaining() {
            Some(remaining) => configured.min(remaining),
            None => configured,
        }
    }

    async fn critical_section(
        &self,
        ctx: &RequestContext,
        key: &str,
        amount: u64,
    ) -> Result<Admission, ConsumeError> {
        let raw = ctx.run(self.store.get(key)).await??;
        let state = decode_or_default(raw.as_deref(), &self.config)?;

        let Some(next) = state.try_consume(amount) else {
            return Ok(denial(&state));
        };

        ctx.run(
            self.store
                .put(key, next.encode()?, self.config.state_ttl()),
        )
        .await??;
        Ok(Admission::Admitted {
            new_counts: next.counts(),
        })
    }
}

/// Releases a held lock exactly once.
///
/// If the holder is dropped without calling [`HeldLock::release`] (the call
/// was cancelled mid-section), the release is handed to the runtime.
struct HeldLock<S: LockService + Clone + 'static> {
    store: S,
    token: Option<LockToken>,
}

impl<S: LockService + Clone + 'static> HeldLock<S> {
    async fn release(mut self) {
        if let Some(token) = self.token.take() {
            if let Err(err) = self.store.release_lock(&token).await {
                // The TTL ran out and someone else may have written meanwhile
                warn!(lock = %token.name, error = %err, "Lock expired before release");
            }
        }
    }
}

impl<S: LockService + Clone + 'static> Drop for HeldLock<S> {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        match Handle::try_current() {
            Ok(handle) => {
                let store = self.store.clone();
                handle.spawn(async move {
                    if let Err(err) = store.release_lock(&token).await {
                        debug!(lock = %token.name, error = %err, "Deferred lock release failed");
                    }
                });
            }
            Err(_) => {
                warn!(lock = %token.name, "No runtime to release lock; leaving it to expire");
            }
        }
    }
}

#[async_trait]
impl<S> ConsistencyStrategy for MutexStrategy<S>
where
    S: LockService + KvStore + Clone + 'static,
{
    fn name(&self) -> &'static str {
        "mutex"
    }

    async fn try_consume(
        &self,
        ctx: &RequestContext,
        key: &str,
        amount: u64,
    ) -> Result<Admission, ConsumeError> {
        let name = Self::lock_name(key);
        let ttl = Duration::from_millis(self.config.lock_ttl_ms);
        let timeout = self.acquire_timeout(ctx);

        let token = ctx
            .run(self.store.acquire_lock(&name, ttl, timeout))
            .await??;
        trace!(key, lock = %name, "Lock acquired");

        let held = HeldLock {
            store: self.store.clone(),
            token: Some(token),
        };
        let result = self.critical_section(ctx, key, amount).await;
        held.release().await;
        result
    }

    async fn reset(&self, key: &str, state: &LimiterState) -> Result<(), ConsumeError> {
        let name = Self::lock_name(key);
        let token = self
            .store
            .acquire_lock(
                &name,
                Duration::from_millis(self.config.lock_ttl_ms),
                Duration::from_millis(self.config.lock_acquire_timeout_ms),
            )
            .await?;
        let held = HeldLock {
            store: self.store.clone(),
            token: Some(token),
        };
        let written = self
            .store
            .put(key, state.encode()?, self.config.state_ttl())
            .await;
        held.release().await;
        Ok(written?)
    }

    async fn load(&self, key: &str) -> Result<Option<LimiterState>, ConsumeError> {
        let raw = self.store.get(key).await?;
        raw.map(|bytes| decode_or_default(Some(&bytes), &self.config))
            .transpose()
    }
}
