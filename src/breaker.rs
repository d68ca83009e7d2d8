//! Per-platform circuit breaker.
//!
//! Lock-free state machine over atomics: Closed → Open after a run of
//! consecutive failures, Open → HalfOpen once the cool-down elapses,
//! HalfOpen admits exactly one probe which decides Open vs Closed.

use crate::{Clock, MonotonicClock, NotifyError};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: usize,
    /// How long the circuit stays open before admitting a probe.
    pub cool_down: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, cool_down: Duration::from_secs(30) }
    }
}

struct BreakerState {
    state: AtomicU8,
    failure_count: AtomicUsize,
    opened_at_millis: AtomicU64,
    probe_in_flight: AtomicBool,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            failure_count: AtomicUsize::new(0),
            opened_at_millis: AtomicU64::new(0),
            probe_in_flight: AtomicBool::new(false),
        }
    }
}

/// Failure gate for a single platform.
#[derive(Clone)]
pub struct PlatformBreaker {
    platform: String,
    state: Arc<BreakerState>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PlatformBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformBreaker")
            .field("platform", &self.platform)
            .field("state", &self.state())
            .field("failures", &self.state.failure_count.load(Ordering::Acquire))
            .finish()
    }
}

impl PlatformBreaker {
    pub fn new(platform: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            platform: platform.into(),
            state: Arc::new(BreakerState::new()),
            config,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn state(&self) -> CircuitState {
        match self.state.state.load(Ordering::Acquire) {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    /// Ask permission to attempt a send.
    ///
    /// Rejected while the circuit is open or a half-open probe is already
    /// in flight; the caller must report the outcome via
    /// [`record_success`](Self::record_success) /
    /// [`record_failure`](Self::record_failure) after an admitted attempt.
    pub fn try_acquire(&self) -> Result<(), NotifyError> {
        loop {
            match self.state.state.load(Ordering::Acquire) {
                STATE_CLOSED => return Ok(()),
                STATE_OPEN => {
                    let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                    let elapsed = self.clock.now_millis().saturating_sub(opened_at);
                    if elapsed < self.config.cool_down.as_millis() as u64 {
                        return Err(self.rejection(elapsed));
                    }
                    // Cool-down elapsed: race to become the half-open probe.
                    match self.state.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            self.state.probe_in_flight.store(true, Ordering::Release);
                            tracing::info!(platform = %self.platform, "circuit breaker half-open");
                            return Ok(());
                        }
                        Err(_) => continue,
                    }
                }
                STATE_HALF_OPEN => {
                    if self
                        .state
                        .probe_in_flight
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return Ok(());
                    }
                    return Err(self.rejection(0));
                }
                _ => unreachable!("invalid circuit breaker state"),
            }
        }
    }

    pub fn record_success(&self) {
        self.state.probe_in_flight.store(false, Ordering::Release);
        match self.state.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_CLOSED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.state.failure_count.store(0, Ordering::Release);
                    self.state.opened_at_millis.store(0, Ordering::Release);
                    tracing::info!(platform = %self.platform, "circuit breaker closed");
                }
            }
            _ => {
                self.state.failure_count.store(0, Ordering::Release);
            }
        }
    }

    pub fn record_failure(&self) {
        self.state.probe_in_flight.store(false, Ordering::Release);
        let failures = self.state.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        match self.state.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.state.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                    tracing::warn!(platform = %self.platform, "probe failed, circuit breaker open");
                }
            }
            STATE_CLOSED if failures >= self.config.failure_threshold => {
                if self
                    .state
                    .state
                    .compare_exchange(
                        STATE_CLOSED,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.state.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                    tracing::error!(
                        platform = %self.platform,
                        failures,
                        threshold = self.config.failure_threshold,
                        "circuit breaker open"
                    );
                }
            }
            _ => {}
        }
    }

    /// Reset to Closed, clearing the failure count.
    pub fn reset(&self) {
        self.state.state.store(STATE_CLOSED, Ordering::Release);
        self.state.failure_count.store(0, Ordering::Release);
        self.state.opened_at_millis.store(0, Ordering::Release);
        self.state.probe_in_flight.store(false, Ordering::Release);
    }

    fn rejection(&self, elapsed_millis: u64) -> NotifyError {
        NotifyError::PlatformUnavailable {
            platform: self.platform.clone(),
            reason: format!(
                "circuit open ({} failures, open for {:?})",
                self.state.failure_count.load(Ordering::Acquire),
                Duration::from_millis(elapsed_millis),
            ),
        }
    }
}

/// Registry of breakers keyed by platform.
///
/// The map takes a coarse lock only on first insert; recorded outcomes go
/// through the per-entry atomics.
#[derive(Clone, Default)]
pub struct BreakerRegistry {
    inner: Arc<Mutex<HashMap<String, PlatformBreaker>>>,
    config: BreakerConfig,
    clock: Option<Arc<dyn Clock>>,
}

impl std::fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerRegistry").field("snapshot", &self.snapshot()).finish()
    }
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self { inner: Arc::default(), config, clock: None }
    }

    /// Share one clock across all breakers (deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Breaker for `platform`, created on first observation.
    pub fn get(&self, platform: &str) -> PlatformBreaker {
        let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        map.entry(platform.to_string())
            .or_insert_with(|| {
                let breaker = PlatformBreaker::new(platform, self.config.clone());
                match &self.clock {
                    Some(clock) => PlatformBreaker { clock: clock.clone(), ..breaker },
                    None => breaker,
                }
            })
            .clone()
    }

    /// Reset one breaker; error when the platform was never observed.
    pub fn reset(&self, platform: &str) -> Result<(), NotifyError> {
        let map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match map.get(platform) {
            Some(breaker) => {
                breaker.reset();
                Ok(())
            }
            None => Err(NotifyError::Config(format!("no breaker for platform {platform}"))),
        }
    }

    /// Sorted snapshot of all breaker states.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut entries: Vec<(String, CircuitState)> =
            map.iter().map(|(k, v)| (k.clone(), v.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
