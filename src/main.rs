use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tallyguard::bench::run_benchmark_until;
use tallyguard::config::TallyguardConfig;
use tallyguard::ratelimit::{build_strategy, RateLimitCoordinator, StrategyConfig, StrategyKind};
use tallyguard::store::MemoryStore;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Strategy to benchmark: optimistic, pessimistic, script, mutex, or all
    #[arg(long)]
    strategy: Option<String>,

    /// Number of concurrent workers
    #[arg(long)]
    workers: Option<usize>,

    /// Calls made by each worker
    #[arg(long)]
    calls: Option<usize>,

    /// Limit applied to every benchmark window
    #[arg(long)]
    limit: Option<u64>,

    /// Amount consumed per call
    #[arg(long)]
    amount: Option<u64>,

    /// Artificial latency added to every store operation, in milliseconds
    #[arg(long)]
    latency_ms: Option<u64>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    info!("Starting Tallyguard benchmark");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = TallyguardConfig::load(args.config.as_deref())
        .context("failed to load configuration")?;
    apply_overrides(&mut config, &args);
    config.validate()?;

    let kinds = match args.strategy.as_deref() {
        Some(s) if s.eq_ignore_ascii_case("all") => StrategyKind::ALL.to_vec(),
        Some(s) => vec![s.parse::<StrategyKind>()?],
        None => vec![config.strategy.kind],
    };
    info!(
        strategies = ?kinds,
        workers = config.benchmark.workers,
        calls_per_worker = config.benchmark.calls_per_worker,
        latency_ms = config.store.latency_ms,
        "Configuration loaded"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let mut unverified = Vec::new();
    for kind in kinds {
        if shutdown.is_cancelled() {
            break;
        }

        // Each strategy gets a fresh store so runs do not see each other's state
        let store = MemoryStore::with_config(&config.store);
        let strategy_config = StrategyConfig {
            kind,
            ..config.strategy.clone()
        };
        let strategy = build_strategy(store, &strategy_config)?;
        let coordinator = Arc::new(RateLimitCoordinator::new(strategy, &config.coordinator));

        let report = run_benchmark_until(coordinator, &config.benchmark, shutdown.clone()).await?;
        report.log();
        if !report.verified {
            unverified.push(kind);
        }
    }

    if !unverified.is_empty() {
        bail!("final state verification failed for {:?}", unverified);
    }

    info!("Tallyguard benchmark finished");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }
}

fn apply_overrides(config: &mut TallyguardConfig, args: &Args) {
    if let Some(workers) = args.workers {
        config.benchmark.workers = workers;
    }
    if let Some(calls) = args.calls {
        config.benchmark.calls_per_worker = calls;
    }
    if let Some(amount) = args.amount {
        config.benchmark.amount = amount;
    }
    if let Some(limit) = args.limit {
        for window in &mut config.benchmark.windows {
            window.limit = limit;
        }
    }
    if let Some(latency_ms) = args.latency_ms {
        config.store.latency_ms = latency_ms;
    }
}

/// Cancel `token` on Ctrl+C or SIGTERM.
async fn cancel_on_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, cancelling in-flight calls");
        }
        _ = terminate => {
            info!("Received SIGTERM, cancelling in-flight calls");
        }
    }
    token.cancel();
}
