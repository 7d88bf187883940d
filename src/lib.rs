//! Tallyguard - Multi-Window Rate Limiting over Shared Stores
//!
//! This crate makes check-and-increment of a multi-window rate limit atomic
//! when many callers share one remote store. Four interchangeable consistency
//! strategies (optimistic compare-and-swap, pessimistic transactions,
//! server-side scripts, and distributed mutexes) sit behind one coordinator,
//! and a benchmark harness measures their correctness and latency under load.

pub mod bench;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
