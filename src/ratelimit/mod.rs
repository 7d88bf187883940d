//! Multi-window rate limiting over a shared store.
//!
//! [`RateLimitCoordinator`] is the entry point. It drives one
//! [`ConsistencyStrategy`], which makes check-and-increment atomic against the
//! store in its own way.

mod backoff;
mod context;
mod coordinator;
mod mutex;
mod optimistic;
mod outcome;
mod pessimistic;
mod script;
mod strategy;
mod window;

pub use backoff::BackoffPolicy;
pub use context::RequestContext;
pub use coordinator::{CoordinatorConfig, RateLimitCoordinator};
pub use mutex::MutexStrategy;
pub use optimistic::OptimisticStrategy;
pub use outcome::{Admission, ConsumeError, ConsumeRequest, ConsumeResult, FailureCause};
pub use pessimistic::PessimisticStrategy;
pub use script::{check_and_increment_script, ScriptStrategy};
pub use strategy::{build_strategy, ConsistencyStrategy, StrategyConfig, StrategyKind};
pub use window::{LimiterState, Window, WindowKind, WindowSpec};
