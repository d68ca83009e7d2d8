//! Platform sender port.
//!
//! Concrete adapters (SMTP, SMS gateways, chat vendors, webhook POST) live
//! outside this crate; the pipeline only sees this trait. [`MockSender`]
//! is provided for tests and examples, in the same spirit as the tracking
//! sleeper.

use crate::{Context, Message, PlatformResult, Target};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A delivery backend for one platform.
#[async_trait]
pub trait PlatformSender: Send + Sync {
    /// Platform name this sender serves (e.g. "email", "sms").
    fn name(&self) -> &str;

    /// Deliver `message` to `targets`, returning one result per target.
    ///
    /// Implementations must not panic; per-target failures are reported in
    /// the result's `error` field. Cancellation of `ctx` should abort
    /// in-flight I/O where the backend allows it.
    async fn send(
        &self,
        ctx: &Context,
        message: &Message,
        targets: &[Target],
    ) -> Vec<PlatformResult>;
}

/// Scripted outcome for one [`MockSender`] call.
#[derive(Debug, Clone)]
enum MockScript {
    AlwaysSucceed,
    AlwaysFail(String),
    /// Fail the first `n` calls with the error, then succeed.
    FailTimes(usize, String),
}

/// Test sender with scripted outcomes and call accounting.
pub struct MockSender {
    name: String,
    script: Mutex<MockScript>,
    latency: Mutex<Duration>,
    calls: AtomicUsize,
    seen_targets: Mutex<Vec<String>>,
    per_target_failures: Mutex<HashMap<String, (usize, String)>>,
}

impl MockSender {
    pub fn succeeding(name: impl Into<String>) -> Arc<Self> {
        Self::with_script(name, MockScript::AlwaysSucceed)
    }

    pub fn failing(name: impl Into<String>, error: impl Into<String>) -> Arc<Self> {
        Self::with_script(name, MockScript::AlwaysFail(error.into()))
    }

    /// Fail the first `times` calls, then succeed.
    pub fn flaky(
        name: impl Into<String>,
        times: usize,
        error: impl Into<String>,
    ) -> Arc<Self> {
        Self::with_script(name, MockScript::FailTimes(times, error.into()))
    }

    fn with_script(name: impl Into<String>, script: MockScript) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            script: Mutex::new(script),
            latency: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
            seen_targets: Mutex::new(Vec::new()),
            per_target_failures: Mutex::new(HashMap::new()),
        })
    }

    /// Simulated per-call latency.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    /// Fail the first `times` sends to one specific target value.
    pub fn fail_target(&self, target: impl Into<String>, times: usize, error: impl Into<String>) {
        self.per_target_failures
            .lock()
            .unwrap()
            .insert(target.into(), (times, error.into()));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen_targets(&self) -> Vec<String> {
        self.seen_targets.lock().unwrap().clone()
    }

    fn outcome_for(&self, target: &Target) -> Result<(), String> {
        let mut per_target = self.per_target_failures.lock().unwrap();
        if let Some((remaining, error)) = per_target.get_mut(&target.value) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(error.clone());
            }
        }
        drop(per_target);

        let mut script = self.script.lock().unwrap();
        match &mut *script {
            MockScript::AlwaysSucceed => Ok(()),
            MockScript::AlwaysFail(error) => Err(error.clone()),
            MockScript::FailTimes(remaining, error) => {
                if *remaining > 0 {
                    *remaining -= 1;
                    Err(error.clone())
                } else {
                    Ok(())
                }
            }
        }
    }
}

#[async_trait]
impl PlatformSender for MockSender {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(
        &self,
        ctx: &Context,
        _message: &Message,
        targets: &[Target],
    ) -> Vec<PlatformResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            self.seen_targets.lock().unwrap().push(target.value.clone());
            let started = Instant::now();
            if ctx.is_cancelled() {
                results.push(PlatformResult::err(
                    &self.name,
                    &target.value,
                    "operation cancelled",
                    started.elapsed(),
                ));
                continue;
            }
            let elapsed = started.elapsed().max(latency);
            match self.outcome_for(target) {
                Ok(()) => results.push(PlatformResult::ok(
                    &self.name,
                    &target.value,
                    format!("{}-msg-{}", self.name, self.calls()),
                    elapsed,
                )),
                Err(error) => {
                    results.push(PlatformResult::err(&self.name, &target.value, error, elapsed))
                }
            }
        }
        results
    }
}
