//! Results and error classification for consume operations.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::error::TallyguardError;
use crate::store::StoreError;

/// What a strategy decided for one consume attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The amount was added to every window.
    Admitted { new_counts: Vec<u64> },
    /// At least one window had no room; nothing was written.
    Denied {
        current_counts: Vec<u64>,
        limits: Vec<u64>,
    },
}

/// Failures a strategy can report.
///
/// Only `RetryableConflict` (inside a strategy) and `TransientUnavailable`
/// (inside the coordinator) are retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConsumeError {
    #[error("write conflict persisted after {attempts} attempts")]
    RetryableConflict { attempts: u32 },

    #[error("store temporarily unavailable: {0}")]
    TransientUnavailable(String),

    #[error("lock not acquired in time: {0}")]
    LockTimeout(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<StoreError> for ConsumeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::WriteConflict(_) => ConsumeError::RetryableConflict { attempts: 1 },
            StoreError::QuorumUnavailable(_) | StoreError::Unreachable(_) => {
                ConsumeError::TransientUnavailable(err.to_string())
            }
            StoreError::LockTimeout(name) => ConsumeError::LockTimeout(name),
            StoreError::NotFound(_)
            | StoreError::LockNotHeld(_)
            | StoreError::Corrupt { .. }
            | StoreError::Script { .. } => ConsumeError::Fatal(err.to_string()),
        }
    }
}

impl From<TallyguardError> for ConsumeError {
    fn from(err: TallyguardError) -> Self {
        match err {
            TallyguardError::Store(store) => store.into(),
            TallyguardError::Consume(err) => err,
            other => ConsumeError::Fatal(other.to_string()),
        }
    }
}

impl ConsumeError {
    /// The caller-facing cause for a strategy failure.
    ///
    /// `TransientUnavailable` only reaches this point once the coordinator has
    /// given up, so `transient_attempts` is the number of tries it made.
    pub fn into_cause(self, transient_attempts: u32) -> FailureCause {
        match self {
            ConsumeError::RetryableConflict { attempts } => FailureCause::RetryExhausted { attempts },
            ConsumeError::TransientUnavailable(_) => FailureCause::Unavailable {
                attempts: transient_attempts,
            },
            ConsumeError::LockTimeout(_) => FailureCause::LockTimeout,
            ConsumeError::Cancelled => FailureCause::Cancelled,
            ConsumeError::Fatal(reason) => FailureCause::Fatal { reason },
        }
    }
}

/// One unit of work against a resource key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeRequest {
    pub resource_key: String,
    pub amount: u64,
}

impl ConsumeRequest {
    pub fn new(resource_key: impl Into<String>, amount: u64) -> Self {
        Self {
            resource_key: resource_key.into(),
            amount,
        }
    }

    pub fn validate(&self) -> Result<(), FailureCause> {
        if self.resource_key.is_empty() {
            return Err(FailureCause::InvalidRequest {
                reason: "resource key is empty".to_string(),
            });
        }
        if self.amount == 0 {
            return Err(FailureCause::InvalidRequest {
                reason: "amount must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Why a consume call failed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum FailureCause {
    /// Conflicting writers kept winning.
    RetryExhausted { attempts: u32 },
    /// A lock could not be acquired in time.
    LockTimeout,
    /// The caller's deadline or cancellation fired.
    Cancelled,
    /// Transient store failures outlasted the retry budget.
    Unavailable { attempts: u32 },
    /// Malformed state or another non-recoverable error.
    Fatal { reason: String },
    /// The request itself was malformed.
    InvalidRequest { reason: String },
}

impl FailureCause {
    /// Short stable label used for grouping and log fields.
    pub fn label(&self) -> &'static str {
        match self {
            FailureCause::RetryExhausted { .. } => "retry_exhausted",
            FailureCause::LockTimeout => "lock_timeout",
            FailureCause::Cancelled => "cancelled",
            FailureCause::Unavailable { .. } => "unavailable",
            FailureCause::Fatal { .. } => "fatal",
            FailureCause::InvalidRequest { .. } => "invalid_request",
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::RetryExhausted { attempts } => {
                write!(f, "retry exhausted after {} attempts", attempts)
            }
            FailureCause::Unavailable { attempts } => {
                write!(f, "store unavailable after {} attempts", attempts)
            }
            FailureCause::Fatal { reason } => write!(f, "fatal: {}", reason),
            FailureCause::InvalidRequest { reason } => write!(f, "invalid request: {}", reason),
            other => f.write_str(other.label()),
        }
    }
}

/// The outcome of a `try_consume` call as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeResult {
    Accepted {
        new_counts: Vec<u64>,
    },
    Rejected {
        current_counts: Vec<u64>,
        limits: Vec<u64>,
    },
    Failed {
        cause: FailureCause,
    },
}

impl ConsumeResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ConsumeResult::Accepted { .. })
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, ConsumeResult::Rejected { .. })
    }

    pub fn failure(&self) -> Option<&FailureCause> {
        match self {
            ConsumeResult::Failed { cause } => Some(cause),
            _ => None,
        }
    }
}

impl From<Admission> for ConsumeResult {
    fn from(admission: Admission) -> Self {
        match admission {
            Admission::Admitted { new_counts } => ConsumeResult::Accepted { new_counts },
            Admission::Denied {
                current_counts,
                limits,
            } => ConsumeResult::Rejected {
                current_counts,
                limits,
            },
        }
    }
}
