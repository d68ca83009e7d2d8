//! In-memory rate limiting strategies.

use super::{Decision, RateLimiter};
use crate::NotifyError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Token bucket: replenishes at `rate` tokens per second up to `capacity`.
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A bucket that starts full.
    pub fn new(rate: f64, capacity: f64) -> Self {
        let capacity = capacity.max(1.0);
        Self {
            rate: rate.max(f64::MIN_POSITIVE),
            capacity,
            state: Mutex::new(BucketState { tokens: capacity, last_refill: Instant::now() }),
        }
    }
}

#[async_trait]
impl RateLimiter for TokenBucket {
    async fn acquire(&self, permits: u32) -> Result<Decision, NotifyError> {
        let cost = permits as f64;
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());

        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
        state.last_refill = Instant::now();

        if state.tokens >= cost {
            state.tokens -= cost;
            let mut metadata = HashMap::new();
            metadata.insert("limit".to_string(), format!("{}", self.capacity as u64));
            Ok(Decision::Allowed { remaining: state.tokens as u32, metadata })
        } else {
            let missing = cost - state.tokens;
            Ok(Decision::Denied {
                wait: Duration::from_secs_f64(missing / self.rate),
                reason: "token_bucket_empty".into(),
            })
        }
    }
}

/// Sliding window: at most `limit` acquisitions within any trailing window.
pub struct SlidingWindow {
    limit: usize,
    window: Duration,
    hits: Mutex<VecDeque<Instant>>,
}

impl SlidingWindow {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self { limit: limit.max(1), window, hits: Mutex::new(VecDeque::new()) }
    }
}

#[async_trait]
impl RateLimiter for SlidingWindow {
    async fn acquire(&self, permits: u32) -> Result<Decision, NotifyError> {
        let now = Instant::now();
        let mut hits = self.hits.lock().unwrap_or_else(|p| p.into_inner());
        while let Some(front) = hits.front() {
            if now.duration_since(*front) > self.window {
                hits.pop_front();
            } else {
                break;
            }
        }

        let requested = permits.max(1) as usize;
        if hits.len() + requested <= self.limit {
            for _ in 0..requested {
                hits.push_back(now);
            }
            let mut metadata = HashMap::new();
            metadata.insert("limit".to_string(), self.limit.to_string());
            Ok(Decision::Allowed { remaining: (self.limit - hits.len()) as u32, metadata })
        } else {
            let wait = hits
                .front()
                .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(self.window);
            Ok(Decision::Denied { wait, reason: "sliding_window_full".into() })
        }
    }
}
