//! Retry policy: retryability gate plus backoff/jitter delay computation.

use crate::error::is_retryable_message;
use crate::{Backoff, Context, Jitter, NotifyError, Sleeper, TokioSleeper};
use std::sync::Arc;
use std::time::Duration;

/// Decides whether and when a failed attempt is retried.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
    jitter: Jitter,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::new().build()
    }
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether `error` on the given attempt (1-indexed) warrants a retry.
    ///
    /// Returns false for cancelled contexts, non-retryable kinds, and
    /// exhausted attempts.
    pub fn should_retry(&self, ctx: &Context, error: &NotifyError, attempt: u32) -> bool {
        if ctx.is_cancelled() {
            return false;
        }
        error.is_retryable() && attempt < self.max_attempts
    }

    /// String-level variant for errors carried in per-target results.
    pub fn should_retry_message(&self, ctx: &Context, error: &str, attempt: u32) -> bool {
        if ctx.is_cancelled() {
            return false;
        }
        is_retryable_message(error) && attempt < self.max_attempts
    }

    /// Compute the jittered delay before the given attempt (1-indexed),
    /// floored at the backoff base.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.jitter.apply(self.backoff.delay(attempt)).max(self.backoff.floor())
    }

    /// Sleep out the delay for `attempt`, aborting early on cancellation.
    pub async fn wait(&self, ctx: &Context, attempt: u32) -> Result<(), NotifyError> {
        let delay = self.delay(attempt);
        tokio::select! {
            _ = self.sleeper.sleep(delay) => Ok(()),
            _ = ctx.done() => Err(NotifyError::SystemTimeout(format!(
                "retry delay of {delay:?} interrupted"
            ))),
        }
    }
}

/// Builder for [`RetryPolicy`]. Defaults: exponential 1 s × 2 capped at
/// 60 s, 10 % symmetric jitter, 3 attempts.
pub struct RetryPolicyBuilder {
    max_attempts: u32,
    backoff: Backoff,
    jitter: Jitter,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
            jitter: Jitter::default(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            sleeper: self.sleeper,
        }
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TrackingSleeper;

    fn policy_without_jitter() -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(3)
            .backoff(Backoff::exponential(Duration::from_millis(10)))
            .jitter(Jitter::None)
            .build()
    }

    #[test]
    fn retryable_error_under_budget_is_retried() {
        let policy = policy_without_jitter();
        let ctx = Context::background();
        let err = NotifyError::NetworkTimeout("dns".into());
        assert!(policy.should_retry(&ctx, &err, 1));
        assert!(policy.should_retry(&ctx, &err, 2));
        assert!(!policy.should_retry(&ctx, &err, 3));
    }

    #[test]
    fn non_retryable_error_short_circuits() {
        let policy = policy_without_jitter();
        let ctx = Context::background();
        let err = NotifyError::Auth { platform: "sms".into(), reason: "expired".into() };
        assert!(!policy.should_retry(&ctx, &err, 1));
    }

    #[test]
    fn cancelled_context_stops_retries() {
        let policy = policy_without_jitter();
        let (ctx, handle) = Context::cancellable();
        let err = NotifyError::NetworkTimeout("dns".into());
        assert!(policy.should_retry(&ctx, &err, 1));
        handle.cancel();
        assert!(!policy.should_retry(&ctx, &err, 1));
    }

    #[test]
    fn message_level_gate() {
        let policy = policy_without_jitter();
        let ctx = Context::background();
        assert!(policy.should_retry_message(&ctx, "platform sms timed out", 1));
        assert!(!policy.should_retry_message(&ctx, "authentication rejected", 1));
    }

    #[test]
    fn delay_follows_backoff_without_jitter() {
        let policy = policy_without_jitter();
        assert_eq!(policy.delay(1), Duration::from_millis(10));
        assert_eq!(policy.delay(2), Duration::from_millis(20));
        assert_eq!(policy.delay(3), Duration::from_millis(40));
    }

    #[test]
    fn jittered_exponential_delay_never_dips_under_base() {
        let policy = RetryPolicy::builder()
            .backoff(Backoff::exponential(Duration::from_millis(100)))
            .jitter(Jitter::fraction(0.5))
            .build();
        for attempt in 1..5 {
            for _ in 0..50 {
                assert!(policy.delay(attempt) >= Duration::from_millis(100));
            }
        }
    }

    #[test]
    fn delay_jitter_band() {
        let policy = RetryPolicy::builder()
            .backoff(Backoff::fixed(Duration::from_millis(1000)))
            .jitter(Jitter::fraction(0.1))
            .build();
        for _ in 0..100 {
            let d = policy.delay(1);
            assert!(d >= Duration::from_millis(900) && d <= Duration::from_millis(1100));
        }
    }

    #[tokio::test]
    async fn wait_uses_sleeper() {
        let sleeper = TrackingSleeper::new();
        let policy = RetryPolicy::builder()
            .backoff(Backoff::exponential(Duration::from_millis(100)))
            .jitter(Jitter::None)
            .sleeper(sleeper.clone())
            .build();

        policy.wait(&Context::background(), 1).await.unwrap();
        policy.wait(&Context::background(), 2).await.unwrap();
        assert_eq!(
            sleeper.calls(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[tokio::test]
    async fn wait_aborts_on_cancellation() {
        let policy = RetryPolicy::builder()
            .backoff(Backoff::fixed(Duration::from_secs(60)))
            .jitter(Jitter::None)
            .build();

        let (ctx, handle) = Context::cancellable();
        let waiter = tokio::spawn(async move { policy.wait(&ctx, 1).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(NotifyError::SystemTimeout(_))));
    }
}
