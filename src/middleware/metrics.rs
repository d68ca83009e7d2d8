//! Metrics collection around the send chain.
//!
//! Series names live in the `notifyhub_` namespace; labels cover format,
//! priority, target type, platform, and status.

use super::{Middleware, Next};
use crate::metrics::MetricsRegistry;
use crate::{Context, Message, NotifyError, Receipt, Target};
use async_trait::async_trait;
use std::time::Instant;

/// Records counters, histograms, and gauges for every send.
#[derive(Debug, Clone, Default)]
pub struct MetricsMiddleware {
    metrics: MetricsRegistry,
}

impl MetricsMiddleware {
    pub fn new(metrics: MetricsRegistry) -> Self {
        Self { metrics }
    }

    pub fn registry(&self) -> &MetricsRegistry {
        &self.metrics
    }
}

fn format_label(message: &Message) -> &'static str {
    match message.format {
        crate::MessageFormat::Text => "text",
        crate::MessageFormat::Markdown => "markdown",
        crate::MessageFormat::Html => "html",
    }
}

fn priority_label(message: &Message) -> &'static str {
    match message.priority {
        crate::Priority::Low => "low",
        crate::Priority::Normal => "normal",
        crate::Priority::High => "high",
        crate::Priority::Urgent => "urgent",
    }
}

#[async_trait]
impl Middleware for MetricsMiddleware {
    async fn handle(
        &self,
        ctx: &Context,
        message: &Message,
        targets: &[Target],
        next: Next<'_>,
    ) -> Result<Receipt, NotifyError> {
        let format = format_label(message);
        let priority = priority_label(message);
        self.metrics.inc_counter(
            "notifyhub_requests_total",
            &[("format", format), ("priority", priority)],
        );
        self.metrics.add_counter("notifyhub_targets_total", &[], targets.len() as u64);
        for target in targets {
            let kind = target.kind.to_string();
            self.metrics
                .inc_counter("notifyhub_targets_by_type", &[("target_type", kind.as_str())]);
        }
        self.metrics.add_gauge("notifyhub_active_requests", &[], 1.0);

        let started = Instant::now();
        let result = next.run(ctx, message, targets).await;
        let elapsed = started.elapsed();

        self.metrics.add_gauge("notifyhub_active_requests", &[], -1.0);
        self.metrics.observe("notifyhub_request_duration_seconds", &[], elapsed.as_secs_f64());

        match &result {
            Ok(receipt) => {
                let status = receipt.status.to_string();
                self.metrics.inc_counter(
                    "notifyhub_requests_by_status",
                    &[("status", status.as_str())],
                );
                for platform_result in &receipt.results {
                    let outcome = if platform_result.success { "success" } else { "failure" };
                    self.metrics.inc_counter(
                        "notifyhub_platform_results_total",
                        &[("platform", platform_result.platform.as_str()), ("status", outcome)],
                    );
                    self.metrics.observe(
                        "notifyhub_platform_duration_seconds",
                        &[("platform", platform_result.platform.as_str())],
                        platform_result.duration.as_secs_f64(),
                    );
                }
                self.metrics.set_gauge(
                    "notifyhub_success_rate_percent",
                    &[],
                    receipt.success_rate() * 100.0,
                );
            }
            Err(_) => {
                self.metrics.inc_counter("notifyhub_errors_total", &[("format", format)]);
            }
        }
        result
    }
}
