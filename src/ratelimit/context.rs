//! Per-request cancellation and deadline.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::outcome::ConsumeError;

/// Carries a caller's cancellation signal and optional deadline.
///
/// Every wait inside a strategy or the coordinator goes through [`RequestContext::run`]
/// or [`RequestContext::sleep`], so a fired context aborts it promptly.
#[derive(Debug, Clone)]
pub struct RequestContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestContext {
    /// A context that never expires on its own.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A context bound to an existing cancellation token.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// A context that expires at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// A context that expires `timeout` from now.
    pub fn with_timeout_from_now(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// Derive a child context whose deadline is at most `timeout` from now.
    ///
    /// Cancelling the parent cancels the child.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) => parent.min(candidate),
            None => candidate,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, if there is one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Whether the context has been cancelled or its deadline has passed.
    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once the context is cancelled or expires.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// Race `fut` against the context.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, ConsumeError>
    where
        F: Future<Output = T>,
    {
        if self.is_done() {
            return Err(ConsumeError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.done() => Err(ConsumeError::Cancelled),
            value = fut => Ok(value),
        }
    }

    /// Sleep for `delay` unless the context fires first.
    pub async fn sleep(&self, delay: Duration) -> Result<(), ConsumeError> {
        self.run(tokio::time::sleep(delay)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_completes_when_not_cancelled() {
        let ctx = RequestContext::new();
        assert_eq!(ctx.run(async { 7 }).await, Ok(7));
        assert_eq!(ctx.remaining(), None);
    }

    #[tokio::test]
    async fn test_expired_deadline_short_circuits() {
        let ctx = RequestContext::with_deadline(Instant::now());
        assert!(ctx.is_done());
        assert_eq!(
            ctx.run(std::future::pending::<()>()).await,
            Err::<(), _>(ConsumeError::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_cancel_aborts_sleep_promptly() {
        let ctx = RequestContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        assert_eq!(
            ctx.sleep(Duration::from_secs(10)).await,
            Err(ConsumeError::Cancelled)
        );
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_child_inherits_cancellation_and_tighter_deadline() {
        let parent = RequestContext::with_timeout_from_now(Duration::from_millis(50));
        let child = parent.child_with_timeout(Duration::from_secs(60));
        assert!(child.remaining().unwrap() <= Duration::from_millis(50));

        parent.cancel();
        assert!(child.is_done());
    }

    #[tokio::test]
    async fn test_deadline_fires() {
        let ctx = RequestContext::with_timeout_from_now(Duration::from_millis(20));
        assert_eq!(
            ctx.sleep(Duration::from_secs(10)).await,
            Err(ConsumeError::Cancelled)
        );
    }
}
