//! Failure analysis over delivery results.
//!
//! Pluggable [`Rule`]s inspect a batch of per-platform results and emit
//! findings; the pattern detector adds findings for clustered error
//! categories. A [`Report`] bundles findings with a metrics snapshot.

use crate::aggregate::analyze_results;
use crate::metrics::{MetricsRegistry, MetricsSnapshot};
use crate::{PlatformResult, Receipt};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// How bad a finding is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// One detected problem.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finding {
    pub rule: String,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub metadata: HashMap<String, String>,
}

/// Analysis rule over a batch of results.
pub trait Rule: Send + Sync {
    fn name(&self) -> &str;
    fn analyze(&self, results: &[PlatformResult]) -> Option<Finding>;
}

/// Flags batches whose overall failure rate crosses a threshold.
#[derive(Debug, Clone)]
pub struct HighFailureRate {
    pub threshold: f64,
}

impl Default for HighFailureRate {
    fn default() -> Self {
        Self { threshold: 0.5 }
    }
}

impl Rule for HighFailureRate {
    fn name(&self) -> &str {
        "high_failure_rate"
    }

    fn analyze(&self, results: &[PlatformResult]) -> Option<Finding> {
        if results.is_empty() {
            return None;
        }
        let failed = results.iter().filter(|r| !r.success).count();
        let rate = failed as f64 / results.len() as f64;
        if rate < self.threshold {
            return None;
        }
        let severity = if rate >= 0.9 { Severity::Critical } else { Severity::Error };
        Some(Finding {
            rule: self.name().to_string(),
            severity,
            title: "high failure rate".to_string(),
            description: format!(
                "{failed} of {} deliveries failed ({:.0}%)",
                results.len(),
                rate * 100.0
            ),
            metadata: HashMap::from([
                ("failed".to_string(), failed.to_string()),
                ("total".to_string(), results.len().to_string()),
            ]),
        })
    }
}

/// Flags platforms whose entire batch failed.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlatformFailure;

impl Rule for PlatformFailure {
    fn name(&self) -> &str {
        "platform_failure"
    }

    fn analyze(&self, results: &[PlatformResult]) -> Option<Finding> {
        let mut per_platform: HashMap<&str, (usize, usize)> = HashMap::new();
        for result in results {
            let entry = per_platform.entry(result.platform.as_str()).or_default();
            entry.0 += 1;
            if !result.success {
                entry.1 += 1;
            }
        }
        let dead: Vec<&str> = per_platform
            .iter()
            .filter(|(_, (total, failed))| *total > 0 && total == failed)
            .map(|(platform, _)| *platform)
            .collect();
        if dead.is_empty() {
            return None;
        }
        let mut sorted = dead;
        sorted.sort_unstable();
        Some(Finding {
            rule: self.name().to_string(),
            severity: Severity::Error,
            title: "platform fully failing".to_string(),
            description: format!("every delivery failed on: {}", sorted.join(", ")),
            metadata: HashMap::from([("platforms".to_string(), sorted.join(","))]),
        })
    }
}

/// Scans for clustered error categories.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternDetector;

impl PatternDetector {
    /// A category clusters when it accounts for at least this share of
    /// failures.
    const CLUSTER_SHARE: f64 = 0.5;

    pub fn detect(&self, results: &[PlatformResult]) -> Vec<Finding> {
        let patterns = analyze_results(results);
        if patterns.total_failures == 0 {
            return Vec::new();
        }
        let total = patterns.total_failures as f64;
        let categories = [
            ("timeout", patterns.timeout_errors),
            ("rate_limit", patterns.rate_limit_errors),
            ("auth", patterns.authentication_errors),
            ("network", patterns.network_errors),
        ];

        let mut findings = Vec::new();
        for (category, count) in categories {
            if count == 0 || (count as f64) / total < Self::CLUSTER_SHARE {
                continue;
            }
            findings.push(Finding {
                rule: "pattern_detector".to_string(),
                severity: Severity::Warning,
                title: format!("{category} error cluster"),
                description: format!(
                    "{count} of {} failures look like {category} errors",
                    patterns.total_failures
                ),
                metadata: HashMap::from([
                    ("category".to_string(), category.to_string()),
                    ("count".to_string(), count.to_string()),
                ]),
            });
        }
        findings
    }
}

/// Findings plus the metrics state they were derived against.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub findings: Vec<Finding>,
    pub metrics: MetricsSnapshot,
    pub generated_at: DateTime<Utc>,
}

impl Report {
    pub fn worst_severity(&self) -> Option<Severity> {
        self.findings.iter().map(|f| f.severity).max()
    }
}

/// Runs rules and the pattern detector over result batches.
pub struct Analyzer {
    rules: Vec<Box<dyn Rule>>,
    detector: PatternDetector,
    metrics: MetricsRegistry,
}

impl Analyzer {
    /// Analyzer with the built-in rules.
    pub fn new(metrics: MetricsRegistry) -> Self {
        Self {
            rules: vec![Box::new(HighFailureRate::default()), Box::new(PlatformFailure)],
            detector: PatternDetector,
            metrics,
        }
    }

    pub fn with_rule(mut self, rule: Box<dyn Rule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn analyze(&self, results: &[PlatformResult]) -> Report {
        let mut findings: Vec<Finding> =
            self.rules.iter().filter_map(|rule| rule.analyze(results)).collect();
        findings.extend(self.detector.detect(results));
        findings.sort_by(|a, b| b.severity.cmp(&a.severity));
        Report { findings, metrics: self.metrics.snapshot(), generated_at: Utc::now() }
    }

    /// Convenience over stored receipts.
    pub fn analyze_receipts(&self, receipts: &[Receipt]) -> Report {
        let results: Vec<PlatformResult> =
            receipts.iter().flat_map(|r| r.results.iter().cloned()).collect();
        self.analyze(&results)
    }
}
