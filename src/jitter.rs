//! Jitter to de-synchronize retry storms across messages.

use rand::Rng;
use std::time::Duration;

/// Jitter strategy applied on top of a computed backoff delay.
#[derive(Debug, Clone, PartialEq)]
pub enum Jitter {
    /// No jitter; use the exact backoff delay.
    None,
    /// Symmetric jitter: uniform in `[delay × (1 - f), delay × (1 + f)]`.
    Symmetric { fraction: f64 },
}

impl Jitter {
    /// Symmetric jitter with the given fraction, clamped to `[0, 1]`.
    pub fn fraction(fraction: f64) -> Self {
        Jitter::Symmetric { fraction: fraction.clamp(0.0, 1.0) }
    }

    /// Apply jitter to a delay.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    /// Apply jitter with a caller-supplied RNG (deterministic in tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Symmetric { fraction } => {
                let millis = delay.as_millis() as u64;
                let spread = (millis as f64 * fraction) as u64;
                if spread == 0 {
                    return delay;
                }
                let low = millis.saturating_sub(spread);
                let high = millis.saturating_add(spread);
                Duration::from_millis(rng.random_range(low..=high))
            }
        }
    }
}

impl Default for Jitter {
    fn default() -> Self {
        Jitter::fraction(0.1)
    }
}
