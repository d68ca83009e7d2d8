//! Whole-chain retry with per-platform circuit breaking and statistics.

use super::{Middleware, Next};
use crate::{
    BreakerRegistry, Context, Message, NotifyError, Receipt, ReceiptStatus, RetryPolicy, Target,
};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Accumulated retry behaviour for one platform.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlatformRetryStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub exhaustions: u64,
    pub total_delay_ms: u64,
}

impl PlatformRetryStats {
    pub fn failure_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        self.failures as f64 / self.attempts as f64
    }
}

/// Per-platform retry statistics with simple tuning recommendations.
#[derive(Debug, Default)]
pub struct RetryStats {
    platforms: Mutex<HashMap<String, PlatformRetryStats>>,
}

impl RetryStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_attempt(&self, platform: &str, delay: Option<Duration>) {
        let mut platforms = self.platforms.lock().unwrap_or_else(|p| p.into_inner());
        let entry = platforms.entry(platform.to_string()).or_default();
        entry.attempts += 1;
        if let Some(delay) = delay {
            entry.total_delay_ms += delay.as_millis() as u64;
        }
    }

    fn record_outcome(&self, platform: &str, success: bool, exhausted: bool) {
        let mut platforms = self.platforms.lock().unwrap_or_else(|p| p.into_inner());
        let entry = platforms.entry(platform.to_string()).or_default();
        if success {
            entry.successes += 1;
        } else {
            entry.failures += 1;
        }
        if exhausted {
            entry.exhaustions += 1;
        }
    }

    pub fn snapshot(&self) -> HashMap<String, PlatformRetryStats> {
        self.platforms.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Config-change suggestions derived from observed behaviour.
    pub fn recommendations(&self) -> Vec<String> {
        let platforms = self.platforms.lock().unwrap_or_else(|p| p.into_inner());
        let mut out = Vec::new();
        for (platform, stats) in platforms.iter() {
            if stats.attempts < 10 {
                continue;
            }
            if stats.failure_rate() > 0.5 {
                out.push(format!(
                    "platform {platform}: failure rate {:.0}% over {} attempts; consider a longer max backoff or lower traffic",
                    stats.failure_rate() * 100.0,
                    stats.attempts
                ));
            }
            if stats.exhaustions > stats.successes {
                out.push(format!(
                    "platform {platform}: retries exhaust more often than they succeed; consider raising max_attempts"
                ));
            }
        }
        out.sort();
        out
    }
}

/// Retries the rest of the chain under the standard retry taxonomy.
///
/// The circuit breaker is keyed on the first target's platform (or its
/// detected platform when unset).
pub struct RetryMiddleware {
    policy: RetryPolicy,
    breakers: BreakerRegistry,
    stats: Arc<RetryStats>,
}

impl RetryMiddleware {
    pub fn new(policy: RetryPolicy, breakers: BreakerRegistry) -> Self {
        Self { policy, breakers, stats: Arc::new(RetryStats::new()) }
    }

    pub fn stats(&self) -> Arc<RetryStats> {
        self.stats.clone()
    }

    fn platform_key(targets: &[Target]) -> String {
        match targets.first() {
            Some(target) if !target.platform.is_empty() && target.platform != "auto" => {
                target.platform.clone()
            }
            Some(target) => crate::Target::detect(&target.value).platform,
            None => "unknown".to_string(),
        }
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    async fn handle(
        &self,
        ctx: &Context,
        message: &Message,
        targets: &[Target],
        next: Next<'_>,
    ) -> Result<Receipt, NotifyError> {
        let platform = Self::platform_key(targets);
        let breaker = self.breakers.get(&platform);
        let mut last_err = None;

        for attempt in 1..=self.policy.max_attempts() {
            breaker.try_acquire()?;

            match next.run(ctx, message, targets).await {
                Ok(receipt) => {
                    let ok = receipt.status != ReceiptStatus::Failed;
                    if ok {
                        breaker.record_success();
                    } else {
                        breaker.record_failure();
                    }
                    self.stats.record_attempt(&platform, None);
                    self.stats.record_outcome(&platform, ok, false);
                    return Ok(receipt);
                }
                Err(err) => {
                    breaker.record_failure();
                    tracing::debug!(
                        message_id = %message.id,
                        platform = %platform,
                        attempt,
                        %err,
                        "chain attempt failed"
                    );
                    if !self.policy.should_retry(ctx, &err, attempt) {
                        let exhausted =
                            err.is_retryable() && attempt >= self.policy.max_attempts();
                        self.stats.record_attempt(&platform, None);
                        self.stats.record_outcome(&platform, false, exhausted);
                        return Err(err);
                    }
                    let delay = self.policy.delay(attempt);
                    self.stats.record_attempt(&platform, Some(delay));
                    self.policy.wait(ctx, attempt).await?;
                    last_err = Some(err);
                }
            }
        }

        // Unreachable in practice: the last attempt returns inside the loop.
        Err(last_err.unwrap_or_else(|| {
            NotifyError::SystemTimeout("retry budget exhausted with no error".into())
        }))
    }
}
