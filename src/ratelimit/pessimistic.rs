//! Pessimistic concurrency: lock the key inside a transaction, then
//! read-check-write-commit.
//!
//! Every exit path ends the transaction. Commit and rollback release the key
//! lock explicitly; if the call is cancelled mid-flight the transaction is
//! dropped, which releases it as well. A retry never starts while the previous
//! attempt still holds the lock.

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use super::context::RequestContext;
use super::outcome::{Admission, ConsumeError};
use super::strategy::{decode_or_default, denial, ConsistencyStrategy, StrategyConfig};
use super::window::LimiterState;
use crate::store::{LockWait, Transaction, TransactionalStore};

/// Lock + transaction with a fixed retry budget on write conflict.
pub struct PessimisticStrategy<S> {
    store: S,
    config: StrategyConfig,
}

impl<S: TransactionalStore> PessimisticStrategy<S> {
    pub fn new(store: S, config: &StrategyConfig) -> Self {
        Self {
            store,
            config: config.clone(),
        }
    }

    /// One transaction attempt. The transaction is always finished on return.
    async fn attempt(
        &self,
        ctx: &RequestContext,
        key: &str,
        amount: u64,
    ) -> Result<Admission, ConsumeError> {
        let mut txn = ctx.run(self.store.begin()).await??;

        match self.stage(ctx, &mut txn, key, amount).await {
            Ok(Staged::Write(next)) => {
                ctx.run(txn.commit()).await??;
                Ok(Admission::Admitted {
                    new_counts: next.counts(),
                })
            }
            Ok(Staged::Deny(current)) => {
                // Nothing was written; roll back to release the lock
                rollback(txn, key).await;
                Ok(denial(&current))
            }
            Err(err) => {
                rollback(txn, key).await;
                Err(err)
            }
        }
    }

    /// Lock, read, check, and buffer the write.
    async fn stage(
        &self,
        ctx: &RequestContext,
        txn: &mut S::Txn,
        key: &str,
        amount: u64,
    ) -> Result<Staged, ConsumeError> {
        ctx.run(txn.lock(key, LockWait::Block)).await??;
        let raw = txn.get(key).await?;
        let state = decode_or_default(raw.as_deref(), &self.config)?;

        match state.try_consume(amount) {
            Some(next) => {
                txn.set(key, next.encode()?, self.config.state_ttl());
                Ok(Staged::Write(next))
            }
            None => Ok(Staged::Deny(state)),
        }
    }
}

enum Staged {
    Write(LimiterState),
    Deny(LimiterState),
}

async fn rollback<T: Transaction>(txn: T, key: &str) {
    if let Err(err) = txn.rollback().await {
        warn!(key, error = %err, "Transaction rollback failed");
    }
}

#[async_trait]
impl<S: TransactionalStore> ConsistencyStrategy for PessimisticStrategy<S> {
    fn name(&self) -> &'static str {
        "pessimistic"
    }

    async fn try_consume(
        &self,
        ctx: &RequestContext,
        key: &str,
        amount: u64,
    ) -> Result<Admission, ConsumeError> {
        let max_attempts = self.config.pessimistic_max_attempts;

        for attempt in 1..=max_attempts {
            match self.attempt(ctx, key, amount).await {
                Err(ConsumeError::RetryableConflict { .. }) if attempt < max_attempts => {
                    trace!(key, attempt, "Commit hit a write conflict, retrying");
                }
                Err(ConsumeError::RetryableConflict { .. }) => break,
                other => return other,
            }
        }

        debug!(key, attempts = max_attempts, "Transaction retries exhausted");
        Err(ConsumeError::RetryableConflict {
            attempts: max_attempts,
        })
    }

    async fn reset(&self, key: &str, state: &LimiterState) -> Result<(), ConsumeError> {
        let mut txn = self.store.begin().await?;
        txn.lock(key, LockWait::Block).await?;
        txn.set(key, state.encode()?, self.config.state_ttl());
        txn.commit().await?;
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<LimiterState>, ConsumeError> {
        let mut txn = self.store.begin().await?;
        let raw = txn.get(key).await;
        rollback(txn, key).await;
        raw?.map(|bytes| decode_or_default(Some(&bytes), &self.config))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::window::WindowSpec;
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use std::time::Duration;

    fn config(limit: u64) -> StrategyConfig {
        StrategyConfig {
            default_windows: vec![WindowSpec::fixed(limit)],
            ..StrategyConfig::default()
        }
    }

    #[tokio::test]
    async fn test_commit_and_deny() {
        let store = MemoryStore::new();
        let strategy = PessimisticStrategy::new(store.clone(), &config(2));
        let ctx = RequestContext::new();

        assert!(matches!(
            strategy.try_consume(&ctx, "k", 2).await.unwrap(),
            Admission::Admitted { .. }
        ));
        assert_eq!(
            strategy.try_consume(&ctx, "k", 1).await.unwrap(),
            Admission::Denied {
                current_counts: vec![2],
                limits: vec![2]
            }
        );
    }

    #[tokio::test]
    async fn test_denial_releases_lock() {
        let store = MemoryStore::new();
        let strategy = PessimisticStrategy::new(store.clone(), &config(1));
        let ctx = RequestContext::new();

        strategy.try_consume(&ctx, "k", 1).await.unwrap();
        strategy.try_consume(&ctx, "k", 1).await.unwrap();

        // The key lock must be free again after the denied attempt
        let mut txn = store.begin().await.unwrap();
        txn.lock("k", LockWait::NoWait).await.unwrap();
    }

    #[tokio::test]
    async fn test_retries_injected_conflicts() {
        let store = MemoryStore::new();
        let strategy = PessimisticStrategy::new(store.clone(), &config(10));
        let ctx = RequestContext::new();

        store.conflict_next_commits(2);
        assert_eq!(
            strategy.try_consume(&ctx, "k", 1).await.unwrap(),
            Admission::Admitted { new_counts: vec![1] }
        );

        store.conflict_next_commits(3);
        assert_eq!(
            strategy.try_consume(&ctx, "k", 1).await.unwrap_err(),
            ConsumeError::RetryableConflict { attempts: 3 }
        );

        // Nothing leaked: the key is unlocked and the count unchanged
        let mut txn = store.begin().await.unwrap();
        txn.lock("k", LockWait::NoWait).await.unwrap();
        drop(txn);
        assert_eq!(strategy.load("k").await.unwrap().unwrap().counts(), vec![1]);
    }

    #[tokio::test]
    async fn test_cancelled_while_waiting_for_lock() {
        let store = MemoryStore::new();
        let strategy = PessimisticStrategy::new(store.clone(), &config(10));

        let mut holder = store.begin().await.unwrap();
        holder.lock("k", LockWait::Block).await.unwrap();

        let ctx = RequestContext::with_timeout_from_now(Duration::from_millis(30));
        let err = strategy.try_consume(&ctx, "k", 1).await.unwrap_err();
        assert_eq!(err, ConsumeError::Cancelled);

        holder.rollback().await.unwrap();
        let mut txn = store.begin().await.unwrap();
        txn.lock("k", LockWait::NoWait).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_serializes_concurrent_writers() {
        let store = MemoryStore::with_latency(Duration::from_micros(200));
        let strategy = Arc::new(PessimisticStrategy::new(store, &config(40)));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let strategy = strategy.clone();
            handles.push(tokio::spawn(async move {
                let ctx = RequestContext::new();
                for _ in 0..10 {
                    strategy.try_consume(&ctx, "k", 1).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let state = strategy.load("k").await.unwrap().unwrap();
        assert_eq!(state.counts(), vec![40]);
    }
}
