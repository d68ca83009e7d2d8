//! Target router: maps targets to platforms with load balancing and
//! health awareness.
//!
//! Read-mostly: selection takes the read lock, health updates and rule
//! changes take the write lock briefly. Round-robin cursors live behind
//! their own mutex so selection does not need the write lock.

use crate::{NotifyError, Target, TargetKind};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};

/// Router-observed health of one platform.
#[derive(Debug, Clone)]
pub struct PlatformHealth {
    pub healthy: bool,
    pub last_checked: Instant,
    pub response_time: Duration,
    pub error_count: u64,
    /// Positive weight for weighted selection.
    pub weight: u32,
}

impl Default for PlatformHealth {
    fn default() -> Self {
        Self {
            healthy: true,
            last_checked: Instant::now(),
            response_time: Duration::ZERO,
            error_count: 0,
            weight: 1,
        }
    }
}

/// Load-balancing strategy over a healthy platform set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalance {
    /// Monotonic cursor per distinct platform set.
    #[default]
    RoundRobin,
    /// Uniform random.
    Random,
    /// Cumulative-weight random using each platform's health weight.
    Weighted,
}

/// Ordered platform lists for one target kind.
#[derive(Debug, Clone, Default)]
pub struct RoutingRule {
    pub primary_platforms: Vec<String>,
    pub fallback_platforms: Vec<String>,
}

impl RoutingRule {
    pub fn primary(platforms: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            primary_platforms: platforms.into_iter().map(Into::into).collect(),
            fallback_platforms: Vec::new(),
        }
    }

    pub fn with_fallback(
        mut self,
        platforms: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.fallback_platforms = platforms.into_iter().map(Into::into).collect();
        self
    }
}

struct RouterState {
    rules: HashMap<TargetKind, RoutingRule>,
    health: HashMap<String, PlatformHealth>,
}

/// Maps targets to platforms.
pub struct Router {
    state: RwLock<RouterState>,
    cursors: StdMutex<HashMap<String, usize>>,
    strategy: LoadBalance,
}

fn default_rules() -> HashMap<TargetKind, RoutingRule> {
    let mut rules = HashMap::new();
    rules.insert(TargetKind::Email, RoutingRule::primary(["email"]));
    rules.insert(TargetKind::Phone, RoutingRule::primary(["sms"]));
    rules.insert(TargetKind::Webhook, RoutingRule::primary(["webhook"]));
    rules.insert(TargetKind::User, RoutingRule::primary(["feishu"]));
    rules.insert(TargetKind::Group, RoutingRule::primary(["feishu"]));
    rules.insert(TargetKind::Channel, RoutingRule::primary(["feishu"]));
    rules
}

impl Default for Router {
    fn default() -> Self {
        Self::new(LoadBalance::default())
    }
}

impl Router {
    pub fn new(strategy: LoadBalance) -> Self {
        Self {
            state: RwLock::new(RouterState { rules: default_rules(), health: HashMap::new() }),
            cursors: StdMutex::new(HashMap::new()),
            strategy,
        }
    }

    /// Replace the rule for one target kind.
    pub fn set_rule(&self, kind: TargetKind, rule: RoutingRule) {
        self.state.write().unwrap_or_else(|p| p.into_inner()).rules.insert(kind, rule);
    }

    /// Pick a platform for the target.
    ///
    /// An explicit, healthy platform on the target wins. Otherwise the
    /// kind's rule is consulted: healthy primaries first, then healthy
    /// fallbacks. Unknown platforms count as healthy. When every candidate
    /// is unhealthy, selection degrades to the full primary list so the
    /// circuit breaker stays the last-resort gate; `NoPlatform` is only
    /// returned when the rule offers no candidates at all.
    pub fn select(&self, target: &Target) -> Result<String, NotifyError> {
        let state = self.state.read().unwrap_or_else(|p| p.into_inner());

        if !target.platform.is_empty() && target.platform != "auto" {
            if is_healthy(&state.health, &target.platform) {
                return Ok(target.platform.clone());
            }
            tracing::debug!(
                platform = %target.platform,
                target = %target.value,
                "explicit platform unhealthy, consulting routing rule"
            );
        }

        // Auto platform: re-detect the kind from the value so bare values
        // route the same way detection would have classified them.
        let kind = if target.platform.is_empty() || target.platform == "auto" {
            Target::detect(&target.value).kind
        } else {
            target.kind
        };

        let rule = state.rules.get(&kind).ok_or_else(|| NotifyError::NoPlatform {
            target: target.value.clone(),
        })?;

        for list in [&rule.primary_platforms, &rule.fallback_platforms] {
            let healthy: Vec<&String> =
                list.iter().filter(|p| is_healthy(&state.health, p)).collect();
            if !healthy.is_empty() {
                return Ok(self.pick(&state, &healthy));
            }
        }

        // Every candidate unhealthy: degrade to the primary list rather
        // than blackholing the target.
        let degraded: Vec<&String> = rule.primary_platforms.iter().collect();
        if !degraded.is_empty() {
            tracing::debug!(
                target = %target.value,
                "no healthy platform, degrading to configured primaries"
            );
            return Ok(self.pick(&state, &degraded));
        }
        Err(NotifyError::NoPlatform { target: target.value.clone() })
    }

    fn pick(&self, state: &RouterState, healthy: &[&String]) -> String {
        if healthy.len() == 1 {
            return healthy[0].clone();
        }
        match self.strategy {
            LoadBalance::RoundRobin => {
                let key = healthy.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(",");
                let mut cursors = self.cursors.lock().unwrap_or_else(|p| p.into_inner());
                let cursor = cursors.entry(key).or_insert(0);
                let chosen = healthy[*cursor % healthy.len()].clone();
                *cursor = cursor.wrapping_add(1);
                chosen
            }
            LoadBalance::Random => {
                healthy[rand::rng().random_range(0..healthy.len())].clone()
            }
            LoadBalance::Weighted => {
                let weights: Vec<u64> = healthy
                    .iter()
                    .map(|p| state.health.get(*p).map(|h| h.weight.max(1) as u64).unwrap_or(1))
                    .collect();
                let total: u64 = weights.iter().sum();
                let mut roll = rand::rng().random_range(0..total);
                for (platform, weight) in healthy.iter().zip(weights) {
                    if roll < weight {
                        return (*platform).clone();
                    }
                    roll -= weight;
                }
                healthy[healthy.len() - 1].clone()
            }
        }
    }

    /// Record a successful send outcome for the platform.
    pub fn mark_success(&self, platform: &str, response_time: Duration) {
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        let entry = state.health.entry(platform.to_string()).or_default();
        entry.healthy = true;
        entry.last_checked = Instant::now();
        entry.response_time = response_time;
    }

    /// Record a failed send outcome for the platform.
    pub fn mark_failure(&self, platform: &str) {
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        let entry = state.health.entry(platform.to_string()).or_default();
        entry.healthy = false;
        entry.last_checked = Instant::now();
        entry.error_count += 1;
    }

    pub fn set_weight(&self, platform: &str, weight: u32) {
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        state.health.entry(platform.to_string()).or_default().weight = weight.max(1);
    }

    pub fn health_of(&self, platform: &str) -> Option<PlatformHealth> {
        self.state.read().unwrap_or_else(|p| p.into_inner()).health.get(platform).cloned()
    }

    /// Mark entries with no update within `max_age` as unhealthy.
    /// Returns how many entries went stale.
    pub fn sweep_stale(&self, max_age: Duration) -> usize {
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        let mut stale = 0;
        for (platform, entry) in state.health.iter_mut() {
            if entry.healthy && now.duration_since(entry.last_checked) > max_age {
                entry.healthy = false;
                stale += 1;
                tracing::warn!(platform = %platform, "platform health entry stale");
            }
        }
        stale
    }
}

fn is_healthy(health: &HashMap<String, PlatformHealth>, platform: &str) -> bool {
    health.get(platform).map(|h| h.healthy).unwrap_or(true)
}
