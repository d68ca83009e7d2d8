//! Rate limiting primitives.
//!
//! - [`RateLimiter`]: the core trait for rate limiting logic.
//! - [`Decision`]: the result of a check (allowed/denied).
//! - `strategies`: token bucket and sliding window implementations.
//! - `keys`: key extractors for partitioning limits per message attribute.
//!
//! The middleware layer asks a `RateLimiter` for permits and maps denials
//! to `PlatformRateLimit`; it does not know how the math works.

use crate::NotifyError;
use std::collections::HashMap;
use std::time::Duration;

pub mod keys;
pub mod strategies;

pub use keys::KeyExtractor;
pub use strategies::{SlidingWindow, TokenBucket};

/// The decision returned by a rate limiter.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The request may proceed.
    Allowed {
        /// Permits remaining after this acquisition.
        remaining: u32,
        /// Optional metadata (e.g. reset time).
        metadata: HashMap<String, String>,
    },
    /// The request is denied.
    Denied {
        /// How long the caller should wait before retrying.
        wait: Duration,
        /// Reason for denial (e.g. "token_bucket_empty").
        reason: String,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

/// Core interface for rate limiting logic.
#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    /// Attempt to acquire the given number of permits.
    async fn acquire(&self, permits: u32) -> Result<Decision, NotifyError>;
}
