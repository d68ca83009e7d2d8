//! Receipt aggregation: folds per-platform outcomes into a status.
//!
//! Status derivation is a pure function of the counts, the required
//! platform set, and the configured thresholds.

use crate::{PlatformResult, Receipt, ReceiptStatus};
use serde::Serialize;
use std::collections::HashMap;

/// Aggregation thresholds.
#[derive(Debug, Clone)]
pub struct AggregateConfig {
    /// Success rate at or above which a mixed outcome is `partial_failed`
    /// instead of `failed`.
    pub partial_failure_threshold: f64,
    /// Absolute number of failures still counted as `completed`.
    pub failure_tolerance: usize,
    /// Platforms that must have an all-success result.
    pub required_platforms: Vec<String>,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            partial_failure_threshold: 0.5,
            failure_tolerance: 0,
            required_platforms: Vec::new(),
        }
    }
}

/// Folds results into receipt counts and status.
#[derive(Debug, Clone, Default)]
pub struct Aggregator {
    config: AggregateConfig,
}

impl Aggregator {
    pub fn new(config: AggregateConfig) -> Self {
        Self { config }
    }

    /// Recompute counts from `results` and derive the status.
    pub fn finalize(&self, receipt: &mut Receipt) {
        receipt.total = receipt.results.len();
        receipt.successful = receipt.results.iter().filter(|r| r.success).count();
        receipt.failed = receipt.total - receipt.successful;
        receipt.status = self.derive_status(receipt);
        if receipt.status == ReceiptStatus::Failed && receipt.error.is_none() {
            receipt.error = receipt
                .results
                .iter()
                .find(|r| !r.success)
                .map(|r| r.error.clone())
                .or_else(|| Some("no delivery results".into()));
        }
    }

    fn derive_status(&self, receipt: &Receipt) -> ReceiptStatus {
        let (successful, failed, total) = (receipt.successful, receipt.failed, receipt.total);
        if total == 0 {
            return ReceiptStatus::Failed;
        }
        if failed == 0 {
            return ReceiptStatus::Completed;
        }
        if successful == 0 {
            return ReceiptStatus::Failed;
        }
        if failed <= self.config.failure_tolerance {
            return ReceiptStatus::Completed;
        }
        for platform in &self.config.required_platforms {
            let mut saw_platform = false;
            let mut all_ok = true;
            for result in receipt.results.iter().filter(|r| &r.platform == platform) {
                saw_platform = true;
                all_ok &= result.success;
            }
            if !saw_platform || !all_ok {
                return ReceiptStatus::Failed;
            }
        }
        if receipt.success_rate() >= self.config.partial_failure_threshold {
            ReceiptStatus::PartialFailed
        } else {
            ReceiptStatus::Failed
        }
    }
}

/// Categorised failure counts over a batch of receipts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FailurePatterns {
    pub total_receipts: usize,
    pub total_failures: usize,
    pub failures_by_platform: HashMap<String, usize>,
    pub timeout_errors: usize,
    pub network_errors: usize,
    pub authentication_errors: usize,
    pub rate_limit_errors: usize,
    pub validation_errors: usize,
    pub service_unavailable_errors: usize,
    pub other_errors: usize,
}

/// Bucket an error string by case-insensitive substring. First match wins.
fn bucket(patterns: &mut FailurePatterns, error: &str) {
    let lower = error.to_ascii_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        patterns.timeout_errors += 1;
    } else if lower.contains("rate limit") || lower.contains("429") {
        patterns.rate_limit_errors += 1;
    } else if lower.contains("auth") || lower.contains("401") || lower.contains("403") {
        patterns.authentication_errors += 1;
    } else if lower.contains("unavailable") || lower.contains("503") {
        patterns.service_unavailable_errors += 1;
    } else if lower.contains("network") || lower.contains("connection") {
        patterns.network_errors += 1;
    } else if lower.contains("validation") || lower.contains("invalid") {
        patterns.validation_errors += 1;
    } else {
        patterns.other_errors += 1;
    }
}

/// Failure-pattern analysis over a batch of receipts.
pub fn analyze_batch(receipts: &[Receipt]) -> FailurePatterns {
    let mut patterns = FailurePatterns { total_receipts: receipts.len(), ..Default::default() };
    for receipt in receipts {
        for result in receipt.results.iter().filter(|r| !r.success) {
            patterns.total_failures += 1;
            *patterns.failures_by_platform.entry(result.platform.clone()).or_insert(0) += 1;
            bucket(&mut patterns, &result.error);
        }
    }
    patterns
}

/// Same analysis over loose results (used by the analyzer rules).
pub fn analyze_results(results: &[PlatformResult]) -> FailurePatterns {
    let mut patterns = FailurePatterns::default();
    for result in results.iter().filter(|r| !r.success) {
        patterns.total_failures += 1;
        *patterns.failures_by_platform.entry(result.platform.clone()).or_insert(0) += 1;
        bucket(&mut patterns, &result.error);
    }
    patterns
}
