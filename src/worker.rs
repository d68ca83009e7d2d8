//! Worker pool: pulls from the queue, processes, and settles each message
//! with exactly one ack or nack.
//!
//! Scaling is supervised: a poller watches the fraction of busy workers
//! and grows or shrinks the pool between the configured bounds. Shutdown
//! is cooperative first (finish the current message), then forced after a
//! grace period; a worker interrupted mid-message nacks it immediately to
//! preserve at-least-once delivery.

use crate::error::is_retryable_message;
use crate::{
    Aggregator, CallbackEvent, CallbackExecutor, CallbackPayload, CallbackRegistry, CancelHandle,
    Context, NotifyError, Processor, Queue, QueuedMessage, Receipt, ReceiptStore,
    RetryPolicy,
};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const STATE_IDLE: u8 = 0;
const STATE_PROCESSING: u8 = 1;
const STATE_SHUTTING_DOWN: u8 = 2;
const STATE_STOPPED: u8 = 3;

/// Observable worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Processing,
    ShuttingDown,
    Stopped,
}

impl WorkerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            STATE_PROCESSING => Self::Processing,
            STATE_SHUTTING_DOWN => Self::ShuttingDown,
            STATE_STOPPED => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

/// Pool sizing and shutdown tuning.
#[derive(Debug, Clone)]
pub struct ScalingConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Busy fraction the supervisor steers toward.
    pub target_load: f64,
    pub scale_up_delay: Duration,
    pub scale_down_delay: Duration,
    /// Idle workers above the minimum are stopped past this age.
    pub max_idle_time: Duration,
    /// Per-iteration dequeue wait.
    pub dequeue_timeout: Duration,
    /// Grace between cooperative stop and forced cancellation.
    pub shutdown_grace: Duration,
    /// Supervisor poll interval.
    pub supervise_interval: Duration,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        Self {
            min_workers: 2,
            max_workers: (cpus * 2).max(2),
            target_load: 0.7,
            scale_up_delay: Duration::from_secs(5),
            scale_down_delay: Duration::from_secs(30),
            max_idle_time: Duration::from_secs(60),
            dequeue_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(30),
            supervise_interval: Duration::from_secs(1),
        }
    }
}

/// Everything a worker needs to settle one message.
pub struct WorkerDeps {
    pub queue: Arc<dyn Queue>,
    pub processor: Arc<Processor>,
    pub aggregator: Aggregator,
    pub retry: RetryPolicy,
    pub callbacks: Arc<CallbackExecutor>,
    pub callback_registry: Arc<CallbackRegistry>,
    pub store: Arc<ReceiptStore>,
}

struct WorkerStats {
    state: AtomicU8,
    processed: AtomicU64,
    errors: AtomicU64,
    idle_since: StdMutex<Instant>,
    current: StdMutex<Option<String>>,
}

impl WorkerStats {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_IDLE),
            processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            idle_since: StdMutex::new(Instant::now()),
            current: StdMutex::new(None),
        }
    }

    fn set_state(&self, state: u8) {
        self.state.store(state, Ordering::Release);
        if state == STATE_IDLE {
            *self.idle_since.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
        }
    }

    fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn idle_for(&self) -> Duration {
        self.idle_since.lock().unwrap_or_else(|p| p.into_inner()).elapsed()
    }
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub id: usize,
    pub state: WorkerState,
    pub processed: u64,
    pub errors: u64,
    pub current_message: Option<String>,
}

struct WorkerHandle {
    id: usize,
    stop: watch::Sender<bool>,
    stats: Arc<WorkerStats>,
    task: JoinHandle<()>,
}

struct PoolShared {
    deps: WorkerDeps,
    config: ScalingConfig,
    workers: StdMutex<Vec<WorkerHandle>>,
    next_id: AtomicUsize,
    /// Hard-cancel context handed to every worker.
    ctx: Context,
    /// Cooperative global stop; workers finish their current message.
    shutdown_rx: watch::Receiver<bool>,
}

/// The worker pool. All workers pull from the same queue; load balancing
/// across them is implicit.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    shutdown_tx: watch::Sender<bool>,
    hard_cancel: CancelHandle,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn the minimum worker set and the scaling supervisor.
    pub fn start(deps: WorkerDeps, config: ScalingConfig) -> Self {
        let (ctx, hard_cancel) = Context::cancellable();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(PoolShared {
            deps,
            config: config.clone(),
            workers: StdMutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            ctx,
            shutdown_rx: shutdown_rx.clone(),
        });

        for _ in 0..config.min_workers.max(1) {
            spawn_worker(&shared);
        }
        let supervisor = tokio::spawn(supervise(shared.clone(), shutdown_rx));

        Self {
            shared,
            shutdown_tx,
            hard_cancel,
            supervisor: StdMutex::new(Some(supervisor)),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.shared.workers.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        self.shared
            .workers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|w| WorkerSnapshot {
                id: w.id,
                state: w.stats.state(),
                processed: w.stats.processed.load(Ordering::Relaxed),
                errors: w.stats.errors.load(Ordering::Relaxed),
                current_message: w
                    .stats
                    .current
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .clone(),
            })
            .collect()
    }

    /// Cooperative stop, then forced cancellation after the grace period.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        {
            let workers = self.shared.workers.lock().unwrap_or_else(|p| p.into_inner());
            for worker in workers.iter() {
                let _ = worker.stop.send(true);
            }
        }

        let deadline = Instant::now() + self.shared.config.shutdown_grace;
        loop {
            let all_done = self
                .shared
                .workers
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .iter()
                .all(|w| w.task.is_finished());
            if all_done {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!("worker shutdown grace expired, forcing cancellation");
                self.hard_cancel.cancel();
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let workers: Vec<WorkerHandle> =
            self.shared.workers.lock().unwrap_or_else(|p| p.into_inner()).drain(..).collect();
        for worker in workers {
            let _ = worker.task.await;
        }
        let supervisor = self.supervisor.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(supervisor) = supervisor {
            let _ = supervisor.await;
        }
    }
}

fn spawn_worker(shared: &Arc<PoolShared>) {
    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    let (stop_tx, stop_rx) = watch::channel(false);
    let stats = Arc::new(WorkerStats::new());
    let task = tokio::spawn(worker_loop(shared.clone(), id, stop_rx, stats.clone()));
    shared
        .workers
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .push(WorkerHandle { id, stop: stop_tx, stats, task });
    tracing::info!(worker = id, "worker started");
}

async fn worker_loop(
    shared: Arc<PoolShared>,
    id: usize,
    mut stop: watch::Receiver<bool>,
    stats: Arc<WorkerStats>,
) {
    let ctx = shared.ctx.clone();
    let mut global = shared.shutdown_rx.clone();

    loop {
        if *stop.borrow() || *global.borrow() || ctx.is_cancelled() {
            break;
        }
        stats.set_state(STATE_IDLE);

        let dequeued = tokio::select! {
            result = tokio::time::timeout(
                shared.config.dequeue_timeout,
                shared.deps.queue.dequeue(&ctx),
            ) => result,
            _ = stop.changed() => continue,
            _ = global.changed() => continue,
        };

        match dequeued {
            Err(_elapsed) => continue,
            Ok(Err(NotifyError::QueueClosed)) => {
                tracing::info!(worker = id, "queue closed, worker exiting");
                break;
            }
            Ok(Err(err)) => {
                // Cancellation during dequeue; nothing in flight to settle.
                tracing::debug!(worker = id, %err, "dequeue interrupted");
                break;
            }
            Ok(Ok(msg)) => {
                stats.set_state(STATE_PROCESSING);
                *stats.current.lock().unwrap_or_else(|p| p.into_inner()) =
                    Some(msg.id().to_string());
                process_one(&shared.deps, &ctx, msg, &stats).await;
                *stats.current.lock().unwrap_or_else(|p| p.into_inner()) = None;
            }
        }
    }

    stats.set_state(STATE_STOPPED);
    tracing::info!(worker = id, "worker stopped");
}

/// Settle one dequeued message: exactly one of ack/nack.
async fn process_one(deps: &WorkerDeps, ctx: &Context, msg: QueuedMessage, stats: &WorkerStats) {
    let id = msg.id().to_string();
    let started = Instant::now();
    let results = deps.processor.process(ctx, &msg.message).await;
    let duration = started.elapsed();

    if ctx.is_cancelled() {
        // Interrupted mid-send: immediate redelivery keeps at-least-once.
        if let Err(err) = deps.queue.nack(msg, Utc::now()).await {
            tracing::warn!(message_id = %id, %err, "shutdown nack failed");
        }
        return;
    }

    let all_ok = !results.is_empty() && results.iter().all(|r| r.success);
    let mut receipt = Receipt::new(&id);
    receipt.results = results.clone();
    deps.aggregator.finalize(&mut receipt);

    let options = deps.callback_registry.options_for(&id);
    let fire = |event: CallbackEvent, attempts: u32, error: Option<String>| {
        if let Some(options) = &options {
            deps.callbacks.fire(
                options,
                CallbackPayload {
                    message_id: id.clone(),
                    event,
                    attempts,
                    executed_at: Utc::now(),
                    duration,
                    results: results.clone(),
                    error,
                },
            );
        }
    };

    if all_ok {
        if let Err(err) = deps.queue.ack(&id).await {
            tracing::warn!(message_id = %id, %err, "ack failed");
        }
        deps.store.process(receipt).await;
        fire(CallbackEvent::Sent, msg.attempts, None);
        deps.callback_registry.remove(&id);
        stats.processed.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let first_error = results
        .iter()
        .find(|r| !r.success)
        .map(|r| r.error.clone())
        .unwrap_or_else(|| "no delivery results".to_string());
    let retryable = results.iter().any(|r| !r.success && is_retryable_message(&r.error));

    if retryable && msg.attempts < deps.retry.max_attempts() {
        let attempt = msg.attempts + 1;
        let delay = deps.retry.delay(attempt);
        let next_retry_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let mut retry_msg = msg.clone();
        retry_msg.last_error = Some(first_error.clone());
        retry_msg.last_results = results.clone();
        match deps.queue.nack(retry_msg, next_retry_at).await {
            Ok(()) => {
                tracing::info!(
                    message_id = %id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling retry"
                );
                fire(CallbackEvent::Retry, attempt, Some(first_error));
                stats.errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(err) => {
                tracing::warn!(message_id = %id, %err, "nack failed, finalizing");
            }
        }
    }

    if let Err(err) = deps.queue.ack(&id).await {
        tracing::warn!(message_id = %id, %err, "ack failed");
    }
    deps.store.process(receipt).await;
    let event =
        if retryable { CallbackEvent::MaxRetries } else { CallbackEvent::Failed };
    fire(event, msg.attempts, Some(first_error));
    deps.callback_registry.remove(&id);
    stats.errors.fetch_add(1, Ordering::Relaxed);
}

async fn supervise(shared: Arc<PoolShared>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(shared.config.supervise_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut high_since: Option<Instant> = None;
    let mut low_since: Option<Instant> = None;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {}
        }

        let (count, processing) = {
            let mut workers = shared.workers.lock().unwrap_or_else(|p| p.into_inner());
            workers.retain(|w| !w.task.is_finished());
            let processing =
                workers.iter().filter(|w| w.stats.state() == WorkerState::Processing).count();
            (workers.len(), processing)
        };

        if count < shared.config.min_workers {
            for _ in count..shared.config.min_workers {
                spawn_worker(&shared);
            }
            continue;
        }

        let load = processing as f64 / count.max(1) as f64;
        if load > shared.config.target_load {
            high_since.get_or_insert_with(Instant::now);
            low_since = None;
        } else if load < shared.config.target_load * 0.5 {
            low_since.get_or_insert_with(Instant::now);
            high_since = None;
        } else {
            high_since = None;
            low_since = None;
        }

        let sustained_high =
            high_since.is_some_and(|t| t.elapsed() >= shared.config.scale_up_delay);
        if sustained_high && count < shared.config.max_workers {
            tracing::info!(load, workers = count, "scaling up");
            spawn_worker(&shared);
            high_since = None;
            continue;
        }

        let sustained_low =
            low_since.is_some_and(|t| t.elapsed() >= shared.config.scale_down_delay);
        if count > shared.config.min_workers {
            let workers = shared.workers.lock().unwrap_or_else(|p| p.into_inner());
            let victim = workers.iter().find(|w| {
                w.stats.state() == WorkerState::Idle
                    && (sustained_low || w.stats.idle_for() >= shared.config.max_idle_time)
            });
            if let Some(victim) = victim {
                tracing::info!(worker = victim.id, load, "scaling down");
                victim.stats.set_state(STATE_SHUTTING_DOWN);
                let _ = victim.stop.send(true);
                low_since = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Backoff, BreakerConfig, BreakerRegistry, CallbackOptions, Jitter, MemoryQueue, Message,
        MockSender, PlatformSender, ReceiptConfig, ReceiptStatus, Router,
    };
    use std::collections::HashMap;

    struct Fixture {
        queue: Arc<MemoryQueue>,
        store: Arc<ReceiptStore>,
        registry: Arc<CallbackRegistry>,
        deps: Option<WorkerDeps>,
    }

    fn fixture(senders: Vec<Arc<MockSender>>, retry: RetryPolicy) -> Fixture {
        let queue = Arc::new(MemoryQueue::new(100));
        let store = Arc::new(ReceiptStore::new(ReceiptConfig::default()));
        let registry = Arc::new(CallbackRegistry::new());
        let map: HashMap<String, Arc<dyn PlatformSender>> = senders
            .into_iter()
            .map(|s| (s.name().to_string(), s as Arc<dyn PlatformSender>))
            .collect();
        let deps = WorkerDeps {
            queue: queue.clone(),
            processor: Arc::new(Processor::new(
                map,
                Arc::new(Router::default()),
                BreakerRegistry::new(BreakerConfig::default()),
            )),
            aggregator: Aggregator::default(),
            retry,
            callbacks: Arc::new(CallbackExecutor::new()),
            callback_registry: registry.clone(),
            store: store.clone(),
        };
        Fixture { queue, store, registry, deps: Some(deps) }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(max_attempts)
            .backoff(Backoff::fixed(Duration::from_millis(10)))
            .jitter(Jitter::None)
            .build()
    }

    fn small_pool_config() -> ScalingConfig {
        ScalingConfig {
            min_workers: 1,
            max_workers: 2,
            dequeue_timeout: Duration::from_millis(50),
            supervise_interval: Duration::from_millis(20),
            shutdown_grace: Duration::from_millis(500),
            ..Default::default()
        }
    }

    fn msg(id: &str, to: &str) -> QueuedMessage {
        QueuedMessage::new(Message::builder().id(id).title("t").to(to).build().unwrap())
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn happy_path_acks_and_stores_completed_receipt() {
        let email = MockSender::succeeding("email");
        let mut fx = fixture(vec![email.clone()], fast_retry(3));
        let pool = WorkerPool::start(fx.deps.take().unwrap(), small_pool_config());

        fx.queue.enqueue(msg("m1", "a@x.com")).await.unwrap();
        let store = fx.store.clone();
        wait_for("completed receipt", || {
            store.get("m1").map(|r| r.status == ReceiptStatus::Completed).unwrap_or(false)
        })
        .await;

        let receipt = fx.store.get("m1").unwrap();
        assert_eq!((receipt.successful, receipt.failed, receipt.total), (1, 0, 1));
        assert_eq!(fx.queue.len(), 0);
        assert_eq!(fx.queue.in_flight_len(), 0);
        assert_eq!(email.calls(), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn transient_failure_retries_until_success() {
        let sms = MockSender::flaky("sms", 2, "platform sms timed out");
        let mut fx = fixture(vec![sms.clone()], fast_retry(3));
        let retry_events = Arc::new(AtomicU64::new(0));
        let counter = retry_events.clone();
        fx.registry.register(
            "m1",
            CallbackOptions::new().on_retry(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );
        let pool = WorkerPool::start(fx.deps.take().unwrap(), small_pool_config());

        fx.queue.enqueue(msg("m1", "+15550001111")).await.unwrap();
        let store = fx.store.clone();
        wait_for("completed receipt", || {
            store.get("m1").map(|r| r.status == ReceiptStatus::Completed).unwrap_or(false)
        })
        .await;

        assert_eq!(sms.calls(), 3, "two failures then success");
        assert_eq!(retry_events.load(Ordering::SeqCst), 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn non_retryable_failure_finalizes_immediately() {
        let email = MockSender::failing("email", "authentication rejected by email");
        let mut fx = fixture(vec![email.clone()], fast_retry(3));
        let pool = WorkerPool::start(fx.deps.take().unwrap(), small_pool_config());

        fx.queue.enqueue(msg("m1", "a@x.com")).await.unwrap();
        let store = fx.store.clone();
        wait_for("failed receipt", || {
            store.get("m1").map(|r| r.status == ReceiptStatus::Failed).unwrap_or(false)
        })
        .await;

        assert_eq!(email.calls(), 1, "non-retryable errors are not retried");
        let receipt = fx.store.get("m1").unwrap();
        assert!(receipt.error.as_deref().unwrap().contains("authentication"));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_fires_max_retries() {
        let sms = MockSender::failing("sms", "platform sms timed out");
        let mut fx = fixture(vec![sms.clone()], fast_retry(1));
        let max_retries_fired = Arc::new(AtomicU64::new(0));
        let counter = max_retries_fired.clone();
        fx.registry.register(
            "m1",
            CallbackOptions::new().on_max_retries(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );
        let pool = WorkerPool::start(fx.deps.take().unwrap(), small_pool_config());

        fx.queue.enqueue(msg("m1", "+15550001111")).await.unwrap();
        let store = fx.store.clone();
        wait_for("failed receipt", || {
            store.get("m1").map(|r| r.status == ReceiptStatus::Failed).unwrap_or(false)
        })
        .await;

        assert_eq!(sms.calls(), 2, "initial attempt plus one retry");
        wait_for("max_retries callback", || max_retries_fired.load(Ordering::SeqCst) == 1).await;
        assert_eq!(fx.queue.in_flight_len(), 0, "exactly one terminal ack");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn partial_failure_retries_whole_message() {
        let email = MockSender::succeeding("email");
        let sms = MockSender::flaky("sms", 1, "platform sms timed out");
        let mut fx = fixture(vec![email.clone(), sms.clone()], fast_retry(3));
        let pool = WorkerPool::start(fx.deps.take().unwrap(), small_pool_config());

        let message = Message::builder()
            .id("m1")
            .title("t")
            .to("a@x.com")
            .to("+15550001111")
            .build()
            .unwrap();
        fx.queue.enqueue(QueuedMessage::new(message)).await.unwrap();

        let store = fx.store.clone();
        wait_for("completed receipt", || {
            store.get("m1").map(|r| r.status == ReceiptStatus::Completed).unwrap_or(false)
        })
        .await;

        assert_eq!(sms.calls(), 2);
        assert_eq!(email.calls(), 2, "whole message is redelivered on retry");
        let receipt = fx.store.get("m1").unwrap();
        assert_eq!(receipt.total, 2);
        assert_eq!(receipt.failed, 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_all_workers() {
        let email = MockSender::succeeding("email");
        let mut fx = fixture(vec![email], fast_retry(3));
        let pool = WorkerPool::start(
            fx.deps.take().unwrap(),
            ScalingConfig { min_workers: 3, ..small_pool_config() },
        );
        assert_eq!(pool.worker_count(), 3);

        pool.shutdown().await;
        assert_eq!(pool.worker_count(), 0);
    }

    #[tokio::test]
    async fn supervisor_scales_up_under_sustained_load() {
        let email = MockSender::succeeding("email");
        email.set_latency(Duration::from_millis(200));
        let mut fx = fixture(vec![email], fast_retry(3));
        let pool = WorkerPool::start(
            fx.deps.take().unwrap(),
            ScalingConfig {
                min_workers: 1,
                max_workers: 2,
                scale_up_delay: Duration::from_millis(40),
                supervise_interval: Duration::from_millis(20),
                dequeue_timeout: Duration::from_millis(50),
                shutdown_grace: Duration::from_millis(2000),
                ..Default::default()
            },
        );

        for i in 0..20 {
            fx.queue.enqueue(msg(&format!("m{i}"), "a@x.com")).await.unwrap();
        }
        wait_for("scale up", || pool.worker_count() >= 2).await;
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn forced_shutdown_nacks_in_flight_message() {
        let email = MockSender::succeeding("email");
        email.set_latency(Duration::from_millis(300));
        let mut fx = fixture(vec![email], fast_retry(3));
        let pool = WorkerPool::start(
            fx.deps.take().unwrap(),
            ScalingConfig {
                min_workers: 1,
                max_workers: 1,
                dequeue_timeout: Duration::from_millis(50),
                supervise_interval: Duration::from_millis(20),
                // Grace shorter than the send, forcing cancellation while
                // the message is in flight.
                shutdown_grace: Duration::from_millis(50),
                ..Default::default()
            },
        );

        fx.queue.enqueue(msg("m1", "a@x.com")).await.unwrap();
        wait_for("worker picks up the message", || fx.queue.in_flight_len() == 1).await;

        pool.shutdown().await;

        // The interrupted message was nacked with immediate redelivery, so
        // it must come back to the buffer instead of being lost.
        wait_for("redelivery", || fx.queue.len() == 1).await;
        assert_eq!(fx.queue.in_flight_len(), 0, "exactly one ack or nack per dequeue");
        assert!(fx.store.get("m1").is_none(), "no terminal receipt for an unsettled message");
    }

    #[tokio::test]
    async fn worker_snapshot_reports_activity() {
        let email = MockSender::succeeding("email");
        let mut fx = fixture(vec![email], fast_retry(3));
        let pool = WorkerPool::start(fx.deps.take().unwrap(), small_pool_config());

        fx.queue.enqueue(msg("m1", "a@x.com")).await.unwrap();
        let store = fx.store.clone();
        wait_for("receipt", || store.get("m1").is_some()).await;

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.iter().map(|w| w.processed).sum::<u64>(), 1);
        pool.shutdown().await;
    }
}
