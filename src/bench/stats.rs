//! Latency statistics.

use std::time::Duration;

use serde::Serialize;

/// Summary of per-call latencies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LatencySummary {
    pub count: usize,
    pub mean: Duration,
    pub min: Duration,
    pub max: Duration,
    pub p95: Duration,
}

impl LatencySummary {
    /// Summarize `samples`. An empty input yields an all-zero summary.
    pub fn from_samples(mut samples: Vec<Duration>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        samples.sort_unstable();

        let count = samples.len();
        let total: Duration = samples.iter().sum();
        Self {
            count,
            mean: total / count as u32,
            min: samples[0],
            max: samples[count - 1],
            p95: percentile(&samples, 0.95),
        }
    }
}

/// Nearest-rank percentile over ascending `sorted` samples: the element at
/// `floor(p * len)`, clamped to the last index.
pub fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let index = ((sorted.len() as f64) * p).floor() as usize;
    sorted[index.min(sorted.len() - 1)]
}
