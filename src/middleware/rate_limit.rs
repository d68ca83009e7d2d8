//! Rate limiting in front of the send chain.

use super::{Middleware, Next};
use crate::rate_limit::{Decision, KeyExtractor, RateLimiter};
use crate::{Context, Message, NotifyError, Receipt, Target};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type LimiterFactory = Box<dyn Fn() -> Arc<dyn RateLimiter> + Send + Sync>;

/// Fails fast with `PlatformRateLimit` when the limiter for the extracted
/// key denies the request.
pub struct RateLimitMiddleware {
    extractor: KeyExtractor,
    factory: LimiterFactory,
    limiters: Mutex<HashMap<String, Arc<dyn RateLimiter>>>,
}

impl RateLimitMiddleware {
    /// `factory` builds one limiter per distinct key.
    pub fn new<F>(extractor: KeyExtractor, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn RateLimiter> + Send + Sync + 'static,
    {
        Self { extractor, factory: Box::new(factory), limiters: Mutex::new(HashMap::new()) }
    }

    fn limiter_for(&self, key: &str) -> Arc<dyn RateLimiter> {
        let mut limiters = self.limiters.lock().unwrap_or_else(|p| p.into_inner());
        limiters.entry(key.to_string()).or_insert_with(|| (self.factory)()).clone()
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    async fn handle(
        &self,
        ctx: &Context,
        message: &Message,
        targets: &[Target],
        next: Next<'_>,
    ) -> Result<Receipt, NotifyError> {
        let key = self.extractor.extract(message, targets);
        let limiter = self.limiter_for(&key);

        match limiter.acquire(1).await? {
            Decision::Allowed { remaining, .. } => {
                tracing::debug!(key = %key, remaining, "rate limit permit acquired");
                next.run(ctx, message, targets).await
            }
            Decision::Denied { wait, reason } => {
                tracing::warn!(key = %key, %reason, wait_ms = wait.as_millis() as u64, "rate limited");
                Err(NotifyError::PlatformRateLimit {
                    platform: key,
                    detail: format!("{reason}; usage=at-limit; reset={}ms", wait.as_millis()),
                })
            }
        }
    }
}
