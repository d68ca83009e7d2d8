//! Message processor: per-platform fan-out through the sender port.
//!
//! Sends to distinct platforms run in parallel, bounded by the configured
//! fan-out. Every outcome feeds back into router health and the platform's
//! circuit breaker; an open breaker short-circuits the whole group without
//! touching the sender.

use crate::{
    BreakerRegistry, Context, Message, NotifyError, PlatformResult, PlatformSender, Router, Target,
};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Hard cap on concurrent platform sends per message.
const MAX_FANOUT: usize = 8;

/// Invokes platform senders and folds outcomes back into health state.
pub struct Processor {
    senders: HashMap<String, Arc<dyn PlatformSender>>,
    router: Arc<Router>,
    breakers: BreakerRegistry,
    fanout: usize,
}

impl Processor {
    pub fn new(
        senders: HashMap<String, Arc<dyn PlatformSender>>,
        router: Arc<Router>,
        breakers: BreakerRegistry,
    ) -> Self {
        Self { senders, router, breakers, fanout: MAX_FANOUT }
    }

    /// Lower the per-message fan-out bound (values above the hard cap are
    /// clamped).
    pub fn with_fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout.clamp(1, MAX_FANOUT);
        self
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Group targets by routed platform. Targets with no routable platform
    /// come back as failed results instead of groups.
    pub fn route(&self, targets: &[Target]) -> (HashMap<String, Vec<Target>>, Vec<PlatformResult>) {
        let mut groups: HashMap<String, Vec<Target>> = HashMap::new();
        let mut failures = Vec::new();
        for target in targets {
            match self.router.select(target) {
                Ok(platform) => groups.entry(platform).or_default().push(target.clone()),
                Err(err) => {
                    tracing::debug!(target = %target.value, %err, "routing failed");
                    failures.push(PlatformResult::err(
                        "",
                        &target.value,
                        err.to_string(),
                        std::time::Duration::ZERO,
                    ));
                }
            }
        }
        (groups, failures)
    }

    /// Route and deliver the message, returning one result per target.
    pub async fn process(&self, ctx: &Context, message: &Message) -> Vec<PlatformResult> {
        let (groups, mut results) = self.route(&message.targets);
        if groups.is_empty() {
            return results;
        }

        let concurrency = self.fanout.min(groups.len());
        let mut delivered: Vec<Vec<PlatformResult>> = stream::iter(groups)
            .map(|(platform, targets)| self.send_group(ctx, message, platform, targets))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for group in delivered.drain(..) {
            results.extend(group);
        }
        results
    }

    async fn send_group(
        &self,
        ctx: &Context,
        message: &Message,
        platform: String,
        targets: Vec<Target>,
    ) -> Vec<PlatformResult> {
        let Some(sender) = self.senders.get(&platform) else {
            let err = NotifyError::Config(format!("unknown platform {platform}"));
            return fail_all(&platform, &targets, &err.to_string());
        };

        let breaker = self.breakers.get(&platform);
        if let Err(err) = breaker.try_acquire() {
            tracing::debug!(platform = %platform, "circuit open, send suppressed");
            return fail_all(&platform, &targets, &err.to_string());
        }

        let started = Instant::now();
        let results = sender.send(ctx, message, &targets).await;
        let elapsed = started.elapsed();

        let group_ok = !results.is_empty() && results.iter().all(|r| r.success);
        if group_ok {
            self.router.mark_success(&platform, elapsed);
            breaker.record_success();
        } else {
            self.router.mark_failure(&platform);
            breaker.record_failure();
        }

        tracing::debug!(
            platform = %platform,
            targets = targets.len(),
            ok = group_ok,
            elapsed_ms = elapsed.as_millis() as u64,
            "platform send finished"
        );
        results
    }
}

fn fail_all(platform: &str, targets: &[Target], error: &str) -> Vec<PlatformResult> {
    targets
        .iter()
        .map(|t| PlatformResult::err(platform, &t.value, error, std::time::Duration::ZERO))
        .collect()
}
