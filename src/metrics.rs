//! In-process metrics registry.
//!
//! Counters are atomics; histograms are append-only series with a length
//! cap (oldest 10 % trimmed past 10 000 entries). The registry is shared
//! by the metrics middleware and the analyzer; exporters are out of scope.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

const HISTOGRAM_CAP: usize = 10_000;

/// Label set rendered into the series key, `name{k="v",...}`.
pub type Labels<'a> = &'a [(&'a str, &'a str)];

fn series_key(name: &str, labels: Labels<'_>) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let rendered: Vec<String> =
        labels.iter().map(|(k, v)| format!("{k}=\"{v}\"")).collect();
    format!("{}{{{}}}", name, rendered.join(","))
}

/// Shared metrics registry, cheap to clone.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    counters: RwLock<HashMap<String, Arc<AtomicU64>>>,
    gauges: RwLock<HashMap<String, f64>>,
    histograms: RwLock<HashMap<String, Vec<f64>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_counter(&self, name: &str, labels: Labels<'_>) {
        self.add_counter(name, labels, 1);
    }

    pub fn add_counter(&self, name: &str, labels: Labels<'_>, by: u64) {
        let key = series_key(name, labels);
        if let Some(counter) =
            self.inner.counters.read().unwrap_or_else(|p| p.into_inner()).get(&key)
        {
            counter.fetch_add(by, Ordering::Relaxed);
            return;
        }
        let mut counters = self.inner.counters.write().unwrap_or_else(|p| p.into_inner());
        counters.entry(key).or_insert_with(|| Arc::new(AtomicU64::new(0))).fetch_add(by, Ordering::Relaxed);
    }

    pub fn set_gauge(&self, name: &str, labels: Labels<'_>, value: f64) {
        let key = series_key(name, labels);
        self.inner.gauges.write().unwrap_or_else(|p| p.into_inner()).insert(key, value);
    }

    pub fn add_gauge(&self, name: &str, labels: Labels<'_>, delta: f64) {
        let key = series_key(name, labels);
        let mut gauges = self.inner.gauges.write().unwrap_or_else(|p| p.into_inner());
        *gauges.entry(key).or_insert(0.0) += delta;
    }

    /// Record one histogram observation, trimming the oldest 10 % when the
    /// series exceeds its cap.
    pub fn observe(&self, name: &str, labels: Labels<'_>, value: f64) {
        let key = series_key(name, labels);
        let mut histograms = self.inner.histograms.write().unwrap_or_else(|p| p.into_inner());
        let series = histograms.entry(key).or_default();
        series.push(value);
        if series.len() > HISTOGRAM_CAP {
            let trim = HISTOGRAM_CAP / 10;
            series.drain(0..trim);
        }
    }

    pub fn counter_value(&self, name: &str, labels: Labels<'_>) -> u64 {
        let key = series_key(name, labels);
        self.inner
            .counters
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &str, labels: Labels<'_>) -> Option<f64> {
        let key = series_key(name, labels);
        self.inner.gauges.read().unwrap_or_else(|p| p.into_inner()).get(&key).copied()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .inner
            .counters
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();
        let gauges = self.inner.gauges.read().unwrap_or_else(|p| p.into_inner()).clone();
        let histograms = self
            .inner
            .histograms
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(k, series)| (k.clone(), HistogramSummary::of(series)))
            .collect();
        MetricsSnapshot { counters, gauges, histograms }
    }
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry").finish_non_exhaustive()
    }
}

/// Aggregate view of one histogram series.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistogramSummary {
    pub count: usize,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl HistogramSummary {
    fn of(series: &[f64]) -> Self {
        if series.is_empty() {
            return Self::default();
        }
        let sum: f64 = series.iter().sum();
        let min = series.iter().copied().fold(f64::INFINITY, f64::min);
        let max = series.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Self { count: series.len(), sum, min, max, mean: sum / series.len() as f64 }
    }
}

/// Point-in-time copy of every series.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, f64>,
    pub histograms: HashMap<String, HistogramSummary>,
}
