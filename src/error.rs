//! Error types for the Tallyguard crate.

use thiserror::Error;

use crate::ratelimit::ConsumeError;
use crate::store::StoreError;

/// Main error type for Tallyguard operations.
#[derive(Error, Debug)]
pub enum TallyguardError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors surfaced by a backing store
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A limiter operation failed
    #[error("Limiter error: {0}")]
    Consume(#[from] ConsumeError),

    /// Limiter state could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A benchmark worker task panicked or was aborted
    #[error("Worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TallyguardError {
    fn from(err: config::ConfigError) -> Self {
        TallyguardError::Config(err.to_string())
    }
}

/// Result type alias for Tallyguard operations.
pub type Result<T> = std::result::Result<T, TallyguardError>;
