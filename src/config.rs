//! Grouped configuration with the documented defaults.
//!
//! Component-specific types (`SchedulerConfig`, `BreakerConfig`,
//! `AggregateConfig`, `ReceiptConfig`, `ScalingConfig`) live next to their
//! components; this module adds the remaining groups and the aggregate
//! [`NotifyConfig`] handed to the hub builder.

use crate::worker::ScalingConfig;
use crate::{AggregateConfig, Backoff, BreakerConfig, Jitter, ReceiptConfig, RetryPolicy, SchedulerConfig};
use std::time::Duration;

/// Queue tuning.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Bounded buffer capacity.
    pub buffer_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { buffer_size: 1000 }
    }
}

/// Retry tuning, expanded into a [`RetryPolicy`] at build time.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: 0.1,
            max_attempts: 3,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(self.max_attempts)
            .backoff(
                Backoff::exponential(self.base_delay)
                    .with_multiplier(self.multiplier)
                    .with_max(self.max_delay),
            )
            .jitter(if self.jitter > 0.0 { Jitter::fraction(self.jitter) } else { Jitter::None })
            .build()
    }
}

/// Token-bucket settings for the hub-level rate limiter.
///
/// When present on [`NotifyConfig`], the hub builder installs a global
/// token-bucket [`RateLimitMiddleware`](crate::RateLimitMiddleware)
/// outermost in the chain.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_tokens: f64,
    /// Tokens replenished per second.
    pub refill: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { max_tokens: 100.0, refill: 10.0 }
    }
}

/// Everything the hub builder consumes.
#[derive(Debug, Clone, Default)]
pub struct NotifyConfig {
    pub queue: QueueConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub workers: ScalingConfig,
    pub receipts: ReceiptConfig,
    pub aggregate: AggregateConfig,
    /// Enables hub-level token-bucket rate limiting when set.
    pub ratelimit: Option<RateLimitConfig>,
}
