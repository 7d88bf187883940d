//! Window model: counters, limits, and the check-and-increment arithmetic.
//!
//! Everything here is pure. Making `check_admit` + `apply` atomic against a
//! shared store is the job of the consistency strategies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TallyguardError};

/// How an external roll-over policy should interpret a window's start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    Sliding,
    Fixed,
}

/// A single counter with its own limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub kind: WindowKind,
    pub count: u64,
    pub limit: u64,
    pub start_time: DateTime<Utc>,
}

impl Window {
    /// Create an empty window starting now.
    pub fn new(kind: WindowKind, limit: u64) -> Result<Self> {
        if limit == 0 {
            return Err(TallyguardError::Config(
                "window limit must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            kind,
            count: 0,
            limit,
            start_time: Utc::now(),
        })
    }

    /// Whether `amount` more units fit under the limit.
    pub fn admits(&self, amount: u64) -> bool {
        self.count
            .checked_add(amount)
            .is_some_and(|next| next <= self.limit)
    }

    /// Units left before the limit is reached.
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.count)
    }
}

/// The configuration form of a window: what a fresh state is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSpec {
    pub kind: WindowKind,
    pub limit: u64,
}

impl WindowSpec {
    pub fn sliding(limit: u64) -> Self {
        Self {
            kind: WindowKind::Sliding,
            limit,
        }
    }

    pub fn fixed(limit: u64) -> Self {
        Self {
            kind: WindowKind::Fixed,
            limit,
        }
    }

    pub fn build(&self) -> Result<Window> {
        Window::new(self.kind, self.limit)
    }
}

/// All windows guarding one resource key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterState {
    #[serde(default)]
    pub windows: Vec<Window>,
}

impl LimiterState {
    pub fn new(windows: Vec<Window>) -> Self {
        Self { windows }
    }

    /// Build a fresh state with zeroed counters from window specs.
    pub fn from_specs(specs: &[WindowSpec]) -> Result<Self> {
        let windows = specs.iter().map(WindowSpec::build).collect::<Result<_>>()?;
        Ok(Self { windows })
    }

    /// True iff every window can take `amount` more units.
    ///
    /// A single failing window vetoes the whole request.
    pub fn check_admit(&self, amount: u64) -> bool {
        self.windows.iter().all(|w| w.admits(amount))
    }

    /// Return a copy with `amount` added to every window.
    ///
    /// Only meaningful after [`LimiterState::check_admit`] returned true.
    pub fn apply(&self, amount: u64) -> LimiterState {
        let windows = self
            .windows
            .iter()
            .map(|w| Window {
                count: w.count.saturating_add(amount),
                ..w.clone()
            })
            .collect();
        LimiterState { windows }
    }

    /// Check and apply in one step, returning the new state if admitted.
    pub fn try_consume(&self, amount: u64) -> Option<LimiterState> {
        self.check_admit(amount).then(|| self.apply(amount))
    }

    pub fn counts(&self) -> Vec<u64> {
        self.windows.iter().map(|w| w.count).collect()
    }

    pub fn limits(&self) -> Vec<u64> {
        self.windows.iter().map(|w| w.limit).collect()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
