//! Optimistic concurrency: read, check, compare-and-swap, retry on conflict.
//!
//! The strategy is only defined over stores with a real conditional write.
//! A plain read-then-write loop lets two writers both read the same count and
//! both succeed, pushing the counter past its limit.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::backoff::BackoffPolicy;
use super::context::RequestContext;
use super::outcome::{Admission, ConsumeError};
use super::strategy::{decode_or_default, denial, ConsistencyStrategy, StrategyConfig};
use super::window::LimiterState;
use crate::store::{ConditionalStore, KvStore};

/// Compare-and-swap with a bounded retry budget.
pub struct OptimisticStrategy<S> {
    store: S,
    config: StrategyConfig,
    conflict_backoff: BackoffPolicy,
}

impl<S: ConditionalStore> OptimisticStrategy<S> {
    pub fn new(store: S, config: &StrategyConfig) -> Self {
        let base = Duration::from_millis(config.conflict_backoff_ms);
        Self {
            store,
            config: config.clone(),
            conflict_backoff: BackoffPolicy::new(base, base * 16),
        }
    }
}

#[async_trait]
impl<S: ConditionalStore> ConsistencyStrategy for OptimisticStrategy<S> {
    fn name(&self) -> &'static str {
        "optimistic"
    }

    async fn try_consume(
        &self,
        ctx: &RequestContext,
        key: &str,
        amount: u64,
    ) -> Result<Admission, ConsumeError> {
        let max_attempts = self.config.optimistic_max_attempts;

        for attempt in 0..max_attempts {
            let current = ctx.run(self.store.get_versioned(key)).await??;
            let (version, state) = match current {
                Some(v) => (Some(v.version), LimiterState::decode(&v.value)?),
                None => (None, self.config.initial_state()?),
            };

            let Some(next) = state.try_consume(amount) else {
                return Ok(denial(&state));
            };

            let written = ctx
                .run(self.store.compare_and_put(
                    key,
                    version,
                    next.encode()?,
                    self.config.state_ttl(),
                ))
                .await??;

            if written {
                trace!(key, attempt, "Compare-and-swap committed");
                return Ok(Admission::Admitted {
                    new_counts: next.counts(),
                });
            }

            trace!(key, attempt, "Compare-and-swap conflict, retrying");
            if attempt + 1 < max_attempts {
                ctx.sleep(self.conflict_backoff.delay(attempt)).await?;
            }
        }

        debug!(key, attempts = max_attempts, "Optimistic retries exhausted");
        Err(ConsumeError::RetryableConflict {
            attempts: max_attempts,
        })
    }

    async fn reset(&self, key: &str, state: &LimiterState) -> Result<(), ConsumeError> {
        self.store
            .put(key, state.encode()?, self.config.state_ttl())
            .await?;
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<LimiterState>, ConsumeError> {
        let raw = self.store.get(key).await?;
        raw.map(|bytes| decode_or_default(Some(&bytes), &self.config))
            .transpose()
    }
}
