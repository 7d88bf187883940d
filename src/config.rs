//! Configuration management for Tallyguard.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::bench::BenchmarkConfig;
use crate::error::{Result, TallyguardError};
use crate::ratelimit::{CoordinatorConfig, StrategyConfig};
use crate::store::MemoryStoreConfig;

/// Prefix of environment variables that override file settings.
pub const ENV_PREFIX: &str = "TALLYGUARD";

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TallyguardConfig {
    /// Consistency strategy and its tunables
    #[serde(default)]
    pub strategy: StrategyConfig,

    /// Retry and deadline policy around each call
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Load shape for the benchmark
    #[serde(default)]
    pub benchmark: BenchmarkConfig,

    /// Embedded store settings
    #[serde(default)]
    pub store: MemoryStoreConfig,
}

impl TallyguardConfig {
    /// Load configuration from an optional file, then apply environment
    /// overrides such as `TALLYGUARD__BENCHMARK__WORKERS=20`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: TallyguardConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from YAML text.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TallyguardConfig =
            serde_yaml::from_str(yaml).map_err(|e| TallyguardError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.strategy.validate()?;
        self.coordinator.validate()?;
        self.benchmark.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{StrategyKind, WindowSpec};

    #[test]
    fn test_defaults() {
        let config = TallyguardConfig::default();
        assert_eq!(config.strategy.kind, StrategyKind::Optimistic);
        assert_eq!(config.strategy.optimistic_max_attempts, 64);
        assert_eq!(config.strategy.pessimistic_max_attempts, 3);
        assert_eq!(config.coordinator.max_transient_retries, 5);
        assert_eq!(config.benchmark.workers, 10);
        assert_eq!(config.benchmark.calls_per_worker, 100);
        assert_eq!(config.store.latency_ms, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
strategy:
  kind: pessimistic
  lock_ttl_ms: 2000
  default_windows:
    - kind: sliding
      limit: 100
coordinator:
  request_timeout_ms: 250
benchmark:
  workers: 4
  windows:
    - kind: fixed
      limit: 50
store:
  latency_ms: 1
"#;
        let config = TallyguardConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.strategy.kind, StrategyKind::Pessimistic);
        assert_eq!(config.strategy.lock_ttl_ms, 2000);
        assert_eq!(config.strategy.default_windows, vec![WindowSpec::sliding(100)]);
        assert_eq!(config.coordinator.request_timeout_ms, Some(250));
        assert_eq!(config.benchmark.workers, 4);
        assert_eq!(config.benchmark.calls_per_worker, 100);
        assert_eq!(config.benchmark.windows, vec![WindowSpec::fixed(50)]);
        assert_eq!(config.store.latency_ms, 1);
    }

    #[test]
    fn test_from_yaml_rejects_invalid_values() {
        assert!(TallyguardConfig::from_yaml("strategy:\n  kind: leaky\n").is_err());
        assert!(TallyguardConfig::from_yaml("benchmark:\n  amount: 0\n").is_err());
    }

    #[test]
    fn test_load_file_with_env_override() {
        let path = std::env::temp_dir().join(format!("tallyguard-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "strategy:\n  kind: script\nbenchmark:\n  workers: 2\n  calls_per_worker: 7\n",
        )
        .unwrap();

        std::env::set_var("TALLYGUARD__BENCHMARK__CALLS_PER_WORKER", "9");
        let loaded = TallyguardConfig::load(Some(&path));
        std::env::remove_var("TALLYGUARD__BENCHMARK__CALLS_PER_WORKER");
        std::fs::remove_file(&path).unwrap();

        let config = loaded.unwrap();
        assert_eq!(config.strategy.kind, StrategyKind::Script);
        assert_eq!(config.benchmark.workers, 2);
        assert_eq!(config.benchmark.calls_per_worker, 9);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let missing = std::env::temp_dir().join("tallyguard-does-not-exist.yaml");
        assert!(TallyguardConfig::load(Some(&missing)).is_err());
    }
}
