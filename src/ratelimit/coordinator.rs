//! Entry point callers use to consume from a rate limit.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace};

use super::backoff::BackoffPolicy;
use super::context::RequestContext;
use super::outcome::{ConsumeError, ConsumeRequest, ConsumeResult, FailureCause};
use super::strategy::ConsistencyStrategy;
use super::window::{LimiterState, WindowSpec};
use crate::error::{Result, TallyguardError};

/// Coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// First backoff delay after a transient failure, in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound on the backoff delay, in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Retries after a transient store failure before giving up
    #[serde(default = "default_max_transient_retries")]
    pub max_transient_retries: u32,

    /// Per-call deadline, in milliseconds. Unbounded when absent.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_transient_retries: default_max_transient_retries(),
            request_timeout_ms: None,
        }
    }
}

fn default_backoff_base_ms() -> u64 {
    10
}

fn default_backoff_max_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_transient_retries() -> u32 {
    5
}

impl CoordinatorConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.backoff_base_ms),
            multiplier: self.backoff_multiplier,
            max: Duration::from_millis(self.backoff_max_ms),
            ..BackoffPolicy::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.backoff_multiplier < 1.0 {
            return Err(TallyguardError::Config(
                "backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(TallyguardError::Config(
                "backoff_max_ms must not be below backoff_base_ms".to_string(),
            ));
        }
        if self.request_timeout_ms == Some(0) {
            return Err(TallyguardError::Config(
                "request_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Runs consume requests through a consistency strategy.
///
/// The coordinator owns request validation, the per-call deadline, retrying
/// transient store failures, and mapping strategy errors to a
/// [`ConsumeResult`]. It is cheap to share behind an `Arc`.
pub struct RateLimitCoordinator {
    strategy: Arc<dyn ConsistencyStrategy>,
    backoff: BackoffPolicy,
    max_transient_retries: u32,
    request_timeout: Option<Duration>,
}

impl RateLimitCoordinator {
    pub fn new(strategy: Arc<dyn ConsistencyStrategy>, config: &CoordinatorConfig) -> Self {
        Self {
            strategy,
            backoff: config.backoff(),
            max_transient_retries: config.max_transient_retries,
            request_timeout: config.request_timeout_ms.map(Duration::from_millis),
        }
    }

    /// Replace the backoff used between transient retries.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Atomically check and increment the windows at `request.resource_key`.
    ///
    /// Never returns an error: every failure is folded into
    /// [`ConsumeResult::Failed`] with its cause.
    #[instrument(
        skip(self, ctx, request),
        fields(
            strategy = self.strategy.name(),
            key = %request.resource_key,
            amount = request.amount
        )
    )]
    pub async fn try_consume(&self, ctx: &RequestContext, request: &ConsumeRequest) -> ConsumeResult {
        if let Err(cause) = request.validate() {
            debug!(%cause, "Rejecting malformed request");
            return ConsumeResult::Failed { cause };
        }
        if ctx.is_done() {
            return ConsumeResult::Failed {
                cause: FailureCause::Cancelled,
            };
        }

        let ctx = match self.request_timeout {
            Some(timeout) => ctx.child_with_timeout(timeout),
            None => ctx.clone(),
        };

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let outcome = ctx
                .run(
                    self.strategy
                        .try_consume(&ctx, &request.resource_key, request.amount),
                )
                .await
                .and_then(|result| result);

            match outcome {
                Ok(admission) => {
                    trace!(attempts, "Consume finished");
                    return admission.into();
                }
                Err(ConsumeError::TransientUnavailable(reason))
                    if attempts <= self.max_transient_retries =>
                {
                    let delay = self.backoff.delay(attempts - 1);
                    debug!(attempts, %reason, ?delay, "Store unavailable, backing off");
                    if let Err(err) = ctx.sleep(delay).await {
                        return ConsumeResult::Failed {
                            cause: err.into_cause(attempts),
                        };
                    }
                }
                Err(err) => {
                    let cause = err.into_cause(attempts);
                    debug!(attempts, %cause, "Consume failed");
                    return ConsumeResult::Failed { cause };
                }
            }
        }
    }

    /// Overwrite the state at `key` with fresh windows.
    pub async fn reset(&self, key: &str, windows: &[WindowSpec]) -> Result<LimiterState> {
        let state = LimiterState::from_specs(windows)?;
        self.strategy.reset(key, &state).await?;
        debug!(key, windows = windows.len(), "Limiter state reset");
        Ok(state)
    }

    /// Read the state at `key` without modifying it.
    pub async fn snapshot(&self, key: &str) -> Result<Option<LimiterState>> {
        Ok(self.strategy.load(key).await?)
    }
}
