//! Benchmark harness: drive concurrent load through a coordinator and check
//! the final state against what was accepted.

mod harness;
mod stats;

pub use harness::{run_benchmark, run_benchmark_until, BenchmarkConfig, BenchmarkReport};
pub use stats::{percentile, LatencySummary};
