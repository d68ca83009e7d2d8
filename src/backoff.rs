//! Backoff strategies for retry delays.

use std::time::Duration;

/// Upper bound applied when a strategy has no explicit cap.
pub const MAX_BACKOFF: Duration = Duration::from_secs(3600);

/// Delay computation between retry attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// Fixed delay between retries.
    Fixed { delay: Duration },
    /// Linearly increasing delay: `base + (attempt - 1) × increment`, capped.
    Linear { base: Duration, increment: Duration, max: Duration },
    /// Exponentially increasing delay: `base × multiplier^(attempt - 1)`, capped.
    Exponential { base: Duration, multiplier: f64, max: Duration },
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Backoff::Fixed { delay }
    }

    pub fn linear(base: Duration, increment: Duration) -> Self {
        Backoff::Linear { base, increment, max: MAX_BACKOFF }
    }

    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential { base, multiplier: 2.0, max: MAX_BACKOFF }
    }

    pub fn with_multiplier(mut self, m: f64) -> Self {
        if let Backoff::Exponential { ref mut multiplier, .. } = self {
            *multiplier = m.max(1.0);
        }
        self
    }

    /// Cap the computed delay. Affects linear and exponential strategies.
    pub fn with_max(mut self, cap: Duration) -> Self {
        match self {
            Backoff::Linear { ref mut max, .. } => *max = cap,
            Backoff::Exponential { ref mut max, .. } => *max = cap,
            Backoff::Fixed { .. } => {}
        }
        self
    }

    /// Lower bound a jittered delay must not dip under.
    pub fn floor(&self) -> Duration {
        match self {
            Backoff::Fixed { .. } => Duration::ZERO,
            Backoff::Linear { base, .. } => *base,
            Backoff::Exponential { base, .. } => *base,
        }
    }

    /// Calculate the delay for a given attempt number (1-indexed).
    ///
    /// Non-decreasing in `attempt`, floored at the base, capped at the max.
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            Backoff::Fixed { delay } => *delay,
            Backoff::Linear { base, increment, max } => {
                let scaled = increment
                    .checked_mul(attempt - 1)
                    .and_then(|extra| base.checked_add(extra))
                    .unwrap_or(*max);
                scaled.max(*base).min(*max)
            }
            Backoff::Exponential { base, multiplier, max } => {
                let factor = multiplier.powi((attempt - 1) as i32);
                let secs = base.as_secs_f64() * factor;
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    return *max;
                }
                Duration::from_secs_f64(secs).max(*base).min(*max)
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::exponential(Duration::from_secs(1)).with_max(Duration::from_secs(60))
    }
}
