//! Concurrent load against a single resource key.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::stats::LatencySummary;
use crate::error::{Result, TallyguardError};
use crate::ratelimit::{
    ConsumeRequest, ConsumeResult, LimiterState, RateLimitCoordinator, RequestContext, WindowSpec,
};

/// Shape of one benchmark run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    /// Key every worker consumes from
    #[serde(default = "default_resource_key")]
    pub resource_key: String,

    /// Number of concurrent worker tasks
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Sequential calls made by each worker
    #[serde(default = "default_calls_per_worker")]
    pub calls_per_worker: usize,

    /// Amount consumed per call
    #[serde(default = "default_amount")]
    pub amount: u64,

    /// Windows the key is reset to before the run
    #[serde(default = "default_windows")]
    pub windows: Vec<WindowSpec>,

    /// Interval between progress log lines, in milliseconds. 0 disables them.
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            resource_key: default_resource_key(),
            workers: default_workers(),
            calls_per_worker: default_calls_per_worker(),
            amount: default_amount(),
            windows: default_windows(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

fn default_resource_key() -> String {
    "ratelimit:test_user:test_endpoint".to_string()
}

fn default_workers() -> usize {
    10
}

fn default_calls_per_worker() -> usize {
    100
}

fn default_amount() -> u64 {
    1
}

fn default_windows() -> Vec<WindowSpec> {
    vec![WindowSpec::sliding(500), WindowSpec::fixed(500)]
}

fn default_progress_interval_ms() -> u64 {
    200
}

impl BenchmarkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.resource_key.is_empty() {
            return Err(TallyguardError::Config(
                "benchmark resource_key must not be empty".to_string(),
            ));
        }
        if self.workers == 0 || self.calls_per_worker == 0 {
            return Err(TallyguardError::Config(
                "benchmark needs at least one worker and one call".to_string(),
            ));
        }
        if self.amount == 0 {
            return Err(TallyguardError::Config(
                "benchmark amount must be greater than zero".to_string(),
            ));
        }
        LimiterState::from_specs(&self.windows).map(|_| ())
    }

    pub fn total_calls(&self) -> usize {
        self.workers * self.calls_per_worker
    }
}

/// What one benchmark run observed.
#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    pub strategy: String,
    pub resource_key: String,
    pub attempted: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub failed: u64,
    /// Failed calls grouped by cause label
    pub failures_by_cause: BTreeMap<String, u64>,
    pub accepted_amount: u64,
    pub elapsed: Duration,
    /// Non-failed calls per second of wall time
    pub ops_per_sec: f64,
    /// Latency over non-failed calls
    pub latency: LatencySummary,
    pub final_counts: Vec<u64>,
    pub limits: Vec<u64>,
    pub expected_counts: Vec<u64>,
    /// Final counts match the expected counts and no window is over its limit
    pub verified: bool,
}

impl BenchmarkReport {
    /// Emit the report through `tracing`.
    pub fn log(&self) {
        info!(
            strategy = %self.strategy,
            attempted = self.attempted,
            accepted = self.accepted,
            rejected = self.rejected,
            failed = self.failed,
            accepted_amount = self.accepted_amount,
            "Benchmark finished"
        );
        for (cause, count) in &self.failures_by_cause {
            info!(strategy = %self.strategy, cause = %cause, count, "Failures");
        }
        info!(
            strategy = %self.strategy,
            elapsed = ?self.elapsed,
            ops_per_sec = self.ops_per_sec,
            mean = ?self.latency.mean,
            min = ?self.latency.min,
            max = ?self.latency.max,
            p95 = ?self.latency.p95,
            "Latency"
        );

        let state = format!(
            "final={:?} expected={:?} limits={:?}",
            self.final_counts, self.expected_counts, self.limits
        );
        if self.verified {
            info!(strategy = %self.strategy, %state, "Final state verified");
        } else {
            warn!(strategy = %self.strategy, %state, "Final state does not match");
        }
    }
}

/// Per-worker results, merged after all workers finish.
#[derive(Debug, Default)]
struct WorkerTally {
    accepted: u64,
    rejected: u64,
    accepted_amount: u64,
    failures: BTreeMap<String, u64>,
    latencies: Vec<Duration>,
}

impl WorkerTally {
    fn merge(&mut self, other: WorkerTally) {
        self.accepted += other.accepted;
        self.rejected += other.rejected;
        self.accepted_amount += other.accepted_amount;
        for (cause, count) in other.failures {
            *self.failures.entry(cause).or_default() += count;
        }
        self.latencies.extend(other.latencies);
    }

    fn failed(&self) -> u64 {
        self.failures.values().sum()
    }
}

/// Run `config` against `coordinator` to completion.
pub async fn run_benchmark(
    coordinator: Arc<RateLimitCoordinator>,
    config: &BenchmarkConfig,
) -> Result<BenchmarkReport> {
    run_benchmark_until(coordinator, config, CancellationToken::new()).await
}

/// Run `config` against `coordinator`, cancelling in-flight calls once
/// `shutdown` fires. Calls cancelled this way are reported as failures.
pub async fn run_benchmark_until(
    coordinator: Arc<RateLimitCoordinator>,
    config: &BenchmarkConfig,
    shutdown: CancellationToken,
) -> Result<BenchmarkReport> {
    config.validate()?;
    let key = config.resource_key.clone();
    let initial = coordinator.reset(&key, &config.windows).await?;

    info!(
        strategy = coordinator.strategy_name(),
        key = %key,
        workers = config.workers,
        calls_per_worker = config.calls_per_worker,
        "Starting benchmark"
    );

    let monitor_stop = CancellationToken::new();
    let monitor = (config.progress_interval_ms > 0).then(|| {
        tokio::spawn(progress_monitor(
            coordinator.clone(),
            key.clone(),
            Duration::from_millis(config.progress_interval_ms),
            monitor_stop.clone(),
        ))
    });

    let start = Instant::now();
    let handles = (0..config.workers).map(|worker| {
        let coordinator = coordinator.clone();
        let request = ConsumeRequest::new(key.clone(), config.amount);
        let ctx = RequestContext::with_token(shutdown.child_token());
        let calls = config.calls_per_worker;
        tokio::spawn(async move { run_worker(worker, &coordinator, &ctx, &request, calls).await })
    });
    let results = join_all(handles).await;
    let elapsed = start.elapsed();

    monitor_stop.cancel();
    if let Some(monitor) = monitor {
        monitor.await?;
    }

    let mut tally = WorkerTally::default();
    for result in results {
        tally.merge(result?);
    }

    let final_state = coordinator.snapshot(&key).await?;
    let report = build_report(
        coordinator.strategy_name(),
        config,
        &initial,
        final_state.as_ref(),
        tally,
        elapsed,
    );
    debug!(verified = report.verified, "Benchmark report assembled");
    Ok(report)
}

async fn run_worker(
    worker: usize,
    coordinator: &RateLimitCoordinator,
    ctx: &RequestContext,
    request: &ConsumeRequest,
    calls: usize,
) -> WorkerTally {
    let mut tally = WorkerTally {
        latencies: Vec::with_capacity(calls),
        ..WorkerTally::default()
    };

    for call in 0..calls {
        let started = Instant::now();
        let result = coordinator.try_consume(ctx, request).await;
        let latency = started.elapsed();

        match result {
            ConsumeResult::Accepted { .. } => {
                tally.accepted += 1;
                tally.accepted_amount += request.amount;
                tally.latencies.push(latency);
            }
            ConsumeResult::Rejected { .. } => {
                tally.rejected += 1;
                tally.latencies.push(latency);
            }
            ConsumeResult::Failed { cause } => {
                warn!(worker, call, %cause, "Call failed");
                *tally.failures.entry(cause.label().to_string()).or_default() += 1;
            }
        }
    }

    tally
}

/// Log the live counters until `stop` fires.
async fn progress_monitor(
    coordinator: Arc<RateLimitCoordinator>,
    key: String,
    period: Duration,
    stop: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => match coordinator.snapshot(&key).await {
                Ok(Some(state)) => {
                    info!(key = %key, counts = ?state.counts(), limits = ?state.limits(), "Current counters");
                }
                Ok(None) => debug!(key = %key, "No state yet"),
                Err(err) => warn!(key = %key, error = %err, "Failed to read counters"),
            },
        }
    }
}

/// Expected final count per window: `min(limit, initial + accepted_amount)`.
fn expected_counts(initial: &LimiterState, accepted_amount: u64) -> Vec<u64> {
    initial
        .windows
        .iter()
        .map(|w| w.count.saturating_add(accepted_amount).min(w.limit))
        .collect()
}

fn build_report(
    strategy: &str,
    config: &BenchmarkConfig,
    initial: &LimiterState,
    final_state: Option<&LimiterState>,
    tally: WorkerTally,
    elapsed: Duration,
) -> BenchmarkReport {
    let expected = expected_counts(initial, tally.accepted_amount);
    let (final_counts, limits) = match final_state {
        Some(state) => (state.counts(), state.limits()),
        None => (Vec::new(), initial.limits()),
    };
    let within_limits = final_state.is_some_and(|state| {
        state.windows.iter().all(|w| w.count <= w.limit)
    });
    let verified = within_limits && final_counts == expected;

    let completed = tally.accepted + tally.rejected;
    let secs = elapsed.as_secs_f64();
    let ops_per_sec = if secs > 0.0 { completed as f64 / secs } else { 0.0 };

    BenchmarkReport {
        strategy: strategy.to_string(),
        resource_key: config.resource_key.clone(),
        attempted: config.total_calls() as u64,
        accepted: tally.accepted,
        rejected: tally.rejected,
        failed: tally.failed(),
        accepted_amount: tally.accepted_amount,
        elapsed,
        ops_per_sec,
        latency: LatencySummary::from_samples(tally.latencies),
        final_counts,
        limits,
        expected_counts: expected,
        verified,
        failures_by_cause: tally.failures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{build_strategy, CoordinatorConfig, StrategyConfig, StrategyKind};
    use crate::store::MemoryStore;

    fn coordinator(kind: StrategyKind) -> Arc<RateLimitCoordinator> {
        let config = StrategyConfig {
            kind,
            ..StrategyConfig::default()
        };
        let strategy = build_strategy(MemoryStore::new(), &config).unwrap();
        Arc::new(RateLimitCoordinator::new(strategy, &CoordinatorConfig::default()))
    }

    #[test]
    fn test_expected_counts_cap_at_limit() {
        let initial =
            LimiterState::from_specs(&[WindowSpec::sliding(5), WindowSpec::fixed(3)]).unwrap();
        assert_eq!(expected_counts(&initial, 3), vec![3, 3]);
        assert_eq!(expected_counts(&initial, 10), vec![5, 3]);
    }

    #[test]
    fn test_config_validation() {
        assert!(BenchmarkConfig::default().validate().is_ok());
        let bad = BenchmarkConfig {
            workers: 0,
            ..BenchmarkConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = BenchmarkConfig {
            windows: vec![WindowSpec::fixed(0)],
            ..BenchmarkConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_unverified_when_state_missing() {
        let config = BenchmarkConfig::default();
        let initial = LimiterState::from_specs(&config.windows).unwrap();
        let report = build_report(
            "script",
            &config,
            &initial,
            None,
            WorkerTally::default(),
            Duration::from_millis(1),
        );
        assert!(!report.verified);
        assert_eq!(report.ops_per_sec, 0.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_default_scenario() {
        let config = BenchmarkConfig {
            progress_interval_ms: 5,
            ..BenchmarkConfig::default()
        };
        let report = run_benchmark(coordinator(StrategyKind::Script), &config)
            .await
            .unwrap();

        assert_eq!(report.attempted, 1000);
        assert_eq!(report.accepted, 500);
        assert_eq!(report.rejected, 500);
        assert_eq!(report.failed, 0);
        assert_eq!(report.final_counts, vec![500, 500]);
        assert_eq!(report.latency.count, 1000);
        assert!(report.verified);
    }

    #[tokio::test]
    async fn test_shutdown_reports_cancelled_calls() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let config = BenchmarkConfig {
            workers: 2,
            calls_per_worker: 5,
            progress_interval_ms: 0,
            ..BenchmarkConfig::default()
        };

        let report = run_benchmark_until(coordinator(StrategyKind::Mutex), &config, shutdown)
            .await
            .unwrap();
        assert_eq!(report.failed, 10);
        assert_eq!(report.failures_by_cause.get("cancelled"), Some(&10));
        assert_eq!(report.final_counts, vec![0, 0]);
        assert!(report.verified);
        assert_eq!(report.latency.count, 0);
    }
}
