//! Atomic script: the store evaluates read, check, conditional apply, and TTL
//! refresh as one indivisible step.
//!
//! There is no gap between read and write, so the strategy has no retry loop of
//! its own. Transient store errors are left to the coordinator.
//!
//! Script arguments: `[amount, ttl_ms, n, kind_0, limit_0, .., kind_n-1, limit_n-1]`
//! where the trailing pairs describe the default windows (`0` = sliding,
//! `1` = fixed). Result: `[flag, n, count_0.., limit_0..]` with `flag = 1` when
//! the amount was applied.

use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use super::context::RequestContext;
use super::outcome::{Admission, ConsumeError};
use super::strategy::{decode_or_default, ConsistencyStrategy, StrategyConfig};
use super::window::{LimiterState, WindowKind, WindowSpec};
use crate::store::{KvStore, Script, ScriptContext, ScriptStore, StoreError};

const SCRIPT_NAME: &str = "check_and_increment";

/// Single server-side check-and-increment per call.
pub struct ScriptStrategy<S> {
    store: S,
    config: StrategyConfig,
    script: Script,
}

impl<S: ScriptStore + KvStore> ScriptStrategy<S> {
    pub fn new(store: S, config: &StrategyConfig) -> Self {
        Self {
            store,
            config: config.clone(),
            script: check_and_increment_script(),
        }
    }

    fn args(&self, amount: u64) -> Result<Vec<i64>, ConsumeError> {
        let mut args = Vec::with_capacity(3 + 2 * self.config.default_windows.len());
        args.push(to_arg(amount)?);
        args.push(to_arg(self.config.state_ttl_ms)?);
        args.push(to_arg(self.config.default_windows.len() as u64)?);
        for spec in &self.config.default_windows {
            args.push(match spec.kind {
                WindowKind::Sliding => 0,
                WindowKind::Fixed => 1,
            });
            args.push(to_arg(spec.limit)?);
        }
        Ok(args)
    }
}

fn to_arg(value: u64) -> Result<i64, ConsumeError> {
    i64::try_from(value).map_err(|_| ConsumeError::Fatal(format!("argument {} out of range", value)))
}

fn script_error(reason: impl Into<String>) -> StoreError {
    StoreError::Script {
        name: SCRIPT_NAME.to_string(),
        reason: reason.into(),
    }
}

fn default_windows(args: &[i64]) -> Result<Vec<WindowSpec>, StoreError> {
    let n = usize::try_from(args[2]).map_err(|_| script_error("bad window count"))?;
    let pairs = &args[3..];
    if pairs.len() != 2 * n {
        return Err(script_error("window arguments do not match count"));
    }
    pairs
        .chunks_exact(2)
        .map(|pair| {
            let kind = match pair[0] {
                0 => WindowKind::Sliding,
                1 => WindowKind::Fixed,
                other => return Err(script_error(format!("unknown window kind {}", other))),
            };
            let limit = u64::try_from(pair[1]).map_err(|_| script_error("negative limit"))?;
            Ok(WindowSpec { kind, limit })
        })
        .collect()
}

fn to_reply(flag: i64, state: &LimiterState) -> Result<Vec<i64>, StoreError> {
    let mut reply = Vec::with_capacity(2 + 2 * state.windows.len());
    reply.push(flag);
    reply.push(state.windows.len() as i64);
    for value in state.counts().into_iter().chain(state.limits()) {
        reply.push(i64::try_from(value).map_err(|_| script_error("counter out of range"))?);
    }
    Ok(reply)
}

fn check_and_increment(
    ctx: &mut dyn ScriptContext,
    keys: &[String],
    args: &[i64],
) -> Result<Vec<i64>, StoreError> {
    let key = keys.first().ok_or_else(|| script_error("missing state key"))?;
    if args.len() < 3 {
        return Err(script_error("missing arguments"));
    }
    let amount = u64::try_from(args[0]).map_err(|_| script_error("negative amount"))?;
    let ttl_ms = u64::try_from(args[1]).map_err(|_| script_error("negative ttl"))?;

    let state = match ctx.get(key) {
        Some(raw) => LimiterState::decode(&raw).map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?,
        None => LimiterState::from_specs(&default_windows(args)?)
            .map_err(|e| script_error(e.to_string()))?,
    };

    let Some(next) = state.try_consume(amount) else {
        return to_reply(0, &state);
    };

    let encoded = next.encode().map_err(|e| script_error(e.to_string()))?;
    ctx.set(key, encoded);
    if ttl_ms > 0 {
        ctx.expire(key, Duration::from_millis(ttl_ms));
    }
    to_reply(1, &next)
}

/// The server-side check-and-increment program.
pub fn check_and_increment_script() -> Script {
    Script::new(SCRIPT_NAME, check_and_increment)
}

fn parse_reply(reply: &[i64]) -> Result<Admission, ConsumeError> {
    let malformed = || ConsumeError::Fatal(format!("malformed script reply: {:?}", reply));
    let (&flag, rest) = reply.split_first().ok_or_else(malformed)?;
    let (&n, values) = rest.split_first().ok_or_else(malformed)?;
    let n = usize::try_from(n).map_err(|_| malformed())?;
    if values.len() != 2 * n {
        return Err(malformed());
    }

    let as_u64 = |v: &i64| u64::try_from(*v).map_err(|_| malformed());
    let counts = values[..n].iter().map(as_u64).collect::<Result<Vec<_>, _>>()?;
    let limits = values[n..].iter().map(as_u64).collect::<Result<Vec<_>, _>>()?;

    match flag {
        1 => Ok(Admission::Admitted { new_counts: counts }),
        0 => Ok(Admission::Denied {
            current_counts: counts,
            limits,
        }),
        _ => Err(malformed()),
    }
}

#[async_trait]
impl<S: ScriptStore + KvStore> ConsistencyStrategy for ScriptStrategy<S> {
    fn name(&self) -> &'static str {
        "script"
    }

    async fn try_consume(
        &self,
        ctx: &RequestContext,
        key: &str,
        amount: u64,
    ) -> Result<Admission, ConsumeError> {
        let keys = [key.to_string()];
        let args = self.args(amount)?;
        let reply = ctx
            .run(self.store.eval(&self.script, &keys, &args))
            .await??;
        trace!(key, ?reply, "Script evaluated");
        parse_reply(&reply)
    }

    async fn reset(&self, key: &str, state: &LimiterState) -> Result<(), ConsumeError> {
        self.store
            .put(key, state.encode()?, self.config.state_ttl())
            .await?;
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<LimiterState>, ConsumeError> {
        let raw = self.store.get(key).await?;
        raw.map(|bytes| decode_or_default(Some(&bytes), &self.config))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn config() -> StrategyConfig {
        StrategyConfig {
            default_windows: vec![WindowSpec::sliding(5), WindowSpec::fixed(3)],
            ..StrategyConfig::default()
        }
    }

    #[tokio::test]
    async fn test_applies_defaults_and_enforces_tightest_window() {
        let store = MemoryStore::new();
        let strategy = ScriptStrategy::new(store.clone(), &config());
        let ctx = RequestContext::new();

        assert_eq!(
            strategy.try_consume(&ctx, "k", 2).await.unwrap(),
            Admission::Admitted {
                new_counts: vec![2, 2]
            }
        );
        assert_eq!(
            strategy.try_consume(&ctx, "k", 2).await.unwrap(),
            Admission::Denied {
                current_counts: vec![2, 2],
                limits: vec![5, 3]
            }
        );
        assert_eq!(store.operation_count(), 2);
    }

    #[tokio::test]
    async fn test_transient_error_surfaces() {
        let store = MemoryStore::new();
        let strategy = ScriptStrategy::new(store.clone(), &config());
        store.fail_next_unavailable(1);

        let err = strategy
            .try_consume(&RequestContext::new(), "k", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumeError::TransientUnavailable(_)));
    }

    #[tokio::test]
    async fn test_corrupt_state_is_fatal() {
        let store = MemoryStore::new();
        store.put("k", b"{oops".to_vec(), None).await.unwrap();
        let strategy = ScriptStrategy::new(store, &config());

        let err = strategy
            .try_consume(&RequestContext::new(), "k", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumeError::Fatal(_)));
    }

    #[test]
    fn test_parse_reply() {
        assert_eq!(
            parse_reply(&[1, 2, 4, 4, 10, 5]).unwrap(),
            Admission::Admitted {
                new_counts: vec![4, 4]
            }
        );
        assert_eq!(
            parse_reply(&[0, 0]).unwrap(),
            Admission::Denied {
                current_counts: vec![],
                limits: vec![]
            }
        );
        assert!(parse_reply(&[1, 2, 4]).is_err());
        assert!(parse_reply(&[]).is_err());
        assert!(parse_reply(&[7, 0]).is_err());
    }

    #[test]
    fn test_default_window_arguments() {
        let strategy = ScriptStrategy::new(MemoryStore::new(), &config());
        let args = strategy.args(1).unwrap();
        assert_eq!(args[..3], [1, 86_400_000, 2]);
        assert_eq!(
            default_windows(&args).unwrap(),
            vec![WindowSpec::sliding(5), WindowSpec::fixed(3)]
        );
        assert!(default_windows(&[1, 0, 2, 0, 5]).is_err());
    }
}
