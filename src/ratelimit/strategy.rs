//! The consistency strategy seam.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::context::RequestContext;
use super::outcome::{Admission, ConsumeError};
use super::window::{LimiterState, WindowSpec};
use crate::error::{Result, TallyguardError};
use crate::store::MemoryStore;

/// A way of making check-and-increment atomic against a shared store.
///
/// All implementations share one contract: `try_consume` either adds `amount`
/// to every window of the state at `key` or leaves the state untouched, and
/// returns [`Admission::Denied`] only when some window lacks room.
#[async_trait]
pub trait ConsistencyStrategy: Send + Sync {
    /// Short name used in logs and reports.
    fn name(&self) -> &'static str;

    /// Atomically check and increment the state at `key`.
    async fn try_consume(
        &self,
        ctx: &RequestContext,
        key: &str,
        amount: u64,
    ) -> std::result::Result<Admission, ConsumeError>;

    /// Overwrite the state at `key`. Administrative; not on the hot path.
    async fn reset(&self, key: &str, state: &LimiterState) -> std::result::Result<(), ConsumeError>;

    /// Read the state at `key` without modifying it.
    async fn load(&self, key: &str) -> std::result::Result<Option<LimiterState>, ConsumeError>;
}

/// Which strategy to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Optimistic,
    Pessimistic,
    Script,
    Mutex,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 4] = [
        StrategyKind::Optimistic,
        StrategyKind::Pessimistic,
        StrategyKind::Script,
        StrategyKind::Mutex,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Optimistic => "optimistic",
            StrategyKind::Pessimistic => "pessimistic",
            StrategyKind::Script => "script",
            StrategyKind::Mutex => "mutex",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = TallyguardError;

    fn from_str(s: &str) -> Result<Self> {
        StrategyKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| TallyguardError::Config(format!("unknown strategy: {}", s)))
    }
}

/// Tunables shared by all strategies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Strategy to run
    #[serde(default = "default_kind")]
    pub kind: StrategyKind,

    /// Windows created when a key is first consumed
    #[serde(default)]
    pub default_windows: Vec<WindowSpec>,

    /// Time-to-live refreshed on every write, in milliseconds
    #[serde(default = "default_state_ttl_ms")]
    pub state_ttl_ms: u64,

    /// Compare-and-swap attempts before giving up
    #[serde(default = "default_optimistic_attempts")]
    pub optimistic_max_attempts: u32,

    /// Base delay between compare-and-swap attempts, in milliseconds
    #[serde(default = "default_conflict_backoff_ms")]
    pub conflict_backoff_ms: u64,

    /// Transaction attempts on write conflict
    #[serde(default = "default_pessimistic_attempts")]
    pub pessimistic_max_attempts: u32,

    /// Distributed mutex time-to-live, in milliseconds
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,

    /// How long to wait for the distributed mutex, in milliseconds
    #[serde(default = "default_lock_acquire_timeout_ms")]
    pub lock_acquire_timeout_ms: u64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            default_windows: Vec::new(),
            state_ttl_ms: default_state_ttl_ms(),
            optimistic_max_attempts: default_optimistic_attempts(),
            conflict_backoff_ms: default_conflict_backoff_ms(),
            pessimistic_max_attempts: default_pessimistic_attempts(),
            lock_ttl_ms: default_lock_ttl_ms(),
            lock_acquire_timeout_ms: default_lock_acquire_timeout_ms(),
        }
    }
}

fn default_kind() -> StrategyKind {
    StrategyKind::Optimistic
}

fn default_state_ttl_ms() -> u64 {
    24 * 60 * 60 * 1000
}

fn default_optimistic_attempts() -> u32 {
    64
}

fn default_conflict_backoff_ms() -> u64 {
    1
}

fn default_pessimistic_attempts() -> u32 {
    3
}

fn default_lock_ttl_ms() -> u64 {
    5000
}

fn default_lock_acquire_timeout_ms() -> u64 {
    1000
}

impl StrategyConfig {
    pub fn state_ttl(&self) -> Option<Duration> {
        (self.state_ttl_ms > 0).then(|| Duration::from_millis(self.state_ttl_ms))
    }

    /// The state a key starts with when nothing is stored yet.
    pub fn initial_state(&self) -> Result<LimiterState> {
        LimiterState::from_specs(&self.default_windows)
    }

    pub fn validate(&self) -> Result<()> {
        if self.optimistic_max_attempts == 0 || self.pessimistic_max_attempts == 0 {
            return Err(TallyguardError::Config(
                "strategy attempt budgets must be at least 1".to_string(),
            ));
        }
        if self.lock_ttl_ms == 0 {
            return Err(TallyguardError::Config(
                "lock_ttl_ms must be greater than zero".to_string(),
            ));
        }
        self.initial_state().map(|_| ())
    }
}

/// Build the configured strategy over the embedded store.
pub fn build_strategy(
    store: MemoryStore,
    config: &StrategyConfig,
) -> Result<Arc<dyn ConsistencyStrategy>> {
    config.validate()?;
    let strategy: Arc<dyn ConsistencyStrategy> = match config.kind {
        StrategyKind::Optimistic => Arc::new(super::OptimisticStrategy::new(store, config)),
        StrategyKind::Pessimistic => Arc::new(super::PessimisticStrategy::new(store, config)),
        StrategyKind::Script => Arc::new(super::ScriptStrategy::new(store, config)),
        StrategyKind::Mutex => Arc::new(super::MutexStrategy::new(store, config)),
    };
    Ok(strategy)
}

/// Decode a stored blob, falling back to the configured default windows.
pub(crate) fn decode_or_default(
    raw: Option<&[u8]>,
    config: &StrategyConfig,
) -> std::result::Result<LimiterState, ConsumeError> {
    match raw {
        Some(bytes) => Ok(LimiterState::decode(bytes)?),
        None => Ok(config.initial_state()?),
    }
}

/// The denial returned when `state` cannot take `amount`.
pub(crate) fn denial(state: &LimiterState) -> Admission {
    Admission::Denied {
        current_counts: state.counts(),
        limits: state.limits(),
    }
}
