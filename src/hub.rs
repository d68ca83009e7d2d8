//! The assembled dispatch system.
//!
//! [`NotifyHub`] wires the queue, scheduler, router, processor, worker
//! pool, receipt store, and callback executor behind a small façade. All
//! collaborators are passed into constructors; there are no globals.

use crate::analyzer::{Analyzer, Report};
use crate::middleware::{Middleware, MiddlewareChain, RateLimitMiddleware, SendHandler};
use crate::rate_limit::{KeyExtractor, RateLimiter, TokenBucket};
use crate::store::{PersistenceStore, ReceiptFilter, Subscriber};
use crate::worker::{WorkerDeps, WorkerPool};
use crate::{
    Aggregator, AsyncReceipt, BreakerRegistry, CallbackExecutor, CallbackOptions,
    CallbackRegistry, Context, DelayScheduler, LoadBalance, MemoryQueue, Message,
    MetricsRegistry, NotifyConfig, NotifyError, PlatformSender, Processor, Queue, QueuedMessage,
    Receipt, ReceiptStore, Router, RoutingRule, SchedulerHandle, Severity, Target, TargetKind,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};

const HEALTH_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const ANALYZE_INTERVAL: Duration = Duration::from_secs(60);

/// Builder for [`NotifyHub`].
pub struct NotifyHubBuilder {
    config: NotifyConfig,
    senders: HashMap<String, Arc<dyn PlatformSender>>,
    middlewares: Vec<Arc<dyn Middleware>>,
    rules: Vec<(TargetKind, RoutingRule)>,
    strategy: LoadBalance,
    persistence: Option<Arc<dyn PersistenceStore>>,
    metrics: Option<MetricsRegistry>,
}

impl Default for NotifyHubBuilder {
    fn default() -> Self {
        Self {
            config: NotifyConfig::default(),
            senders: HashMap::new(),
            middlewares: Vec::new(),
            rules: Vec::new(),
            strategy: LoadBalance::default(),
            persistence: None,
            metrics: None,
        }
    }
}

impl NotifyHubBuilder {
    pub fn config(mut self, config: NotifyConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a platform sender under its own name.
    pub fn sender(mut self, sender: Arc<dyn PlatformSender>) -> Self {
        self.senders.insert(sender.name().to_string(), sender);
        self
    }

    /// Append a middleware; the first added runs outermost.
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn routing_rule(mut self, kind: TargetKind, rule: RoutingRule) -> Self {
        self.rules.push((kind, rule));
        self
    }

    pub fn load_balance(mut self, strategy: LoadBalance) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn PersistenceStore>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Share a metrics registry (e.g. the one behind a metrics
    /// middleware) instead of the hub creating its own.
    pub fn metrics_registry(mut self, metrics: MetricsRegistry) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> NotifyHub {
        let config = self.config;

        let queue = Arc::new(MemoryQueue::new(config.queue.buffer_size));
        let scheduler = DelayScheduler::start(queue.clone(), config.scheduler.clone());
        let scheduler_handle = scheduler.handle();
        queue.bind_redelivery(Arc::new(scheduler_handle.clone()));

        let router = Arc::new(Router::new(self.strategy));
        for (kind, rule) in self.rules {
            router.set_rule(kind, rule);
        }

        let breakers = BreakerRegistry::new(config.breaker.clone());
        let processor =
            Arc::new(Processor::new(self.senders, router.clone(), breakers.clone()));

        let mut store = ReceiptStore::new(config.receipts.clone());
        if let Some(persistence) = self.persistence {
            store = store.with_persistence(persistence);
        }
        let store = Arc::new(store);

        let callback_registry = Arc::new(CallbackRegistry::new());
        let callback_executor = Arc::new(CallbackExecutor::new());
        let retry = config.retry.policy();

        let pool = WorkerPool::start(
            WorkerDeps {
                queue: queue.clone(),
                processor: processor.clone(),
                aggregator: Aggregator::new(config.aggregate.clone()),
                retry,
                callbacks: callback_executor.clone(),
                callback_registry: callback_registry.clone(),
                store: store.clone(),
            },
            config.workers.clone(),
        );

        let metrics = self.metrics.unwrap_or_default();
        let latest_report = Arc::new(StdMutex::new(None));

        let (background_tx, background_rx) = watch::channel(false);
        let gc_task = tokio::spawn(store.clone().run_cleaner(background_rx.clone()));

        let sweep_router = router.clone();
        let mut sweep_rx = background_rx.clone();
        let sweep_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEALTH_SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = sweep_rx.changed() => {
                        if changed.is_err() || *sweep_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        sweep_router.sweep_stale(3 * HEALTH_SWEEP_INTERVAL);
                    }
                }
            }
        });

        let analyzer = Analyzer::new(metrics.clone());
        let analyze_store = store.clone();
        let analyze_report = latest_report.clone();
        let mut analyze_rx = background_rx;
        let analyze_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ANALYZE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = analyze_rx.changed() => {
                        if changed.is_err() || *analyze_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let window = ReceiptFilter {
                            start_time: Some(
                                chrono::Utc::now()
                                    - chrono::Duration::from_std(ANALYZE_INTERVAL * 2)
                                        .unwrap_or_else(|_| chrono::Duration::minutes(2)),
                            ),
                            ..Default::default()
                        };
                        let receipts = analyze_store.query(&window);
                        let report = analyzer.analyze_receipts(&receipts);
                        for finding in &report.findings {
                            match finding.severity {
                                Severity::Critical | Severity::Error => tracing::error!(
                                    rule = %finding.rule,
                                    %finding.title,
                                    %finding.description,
                                    "analyzer finding"
                                ),
                                Severity::Warning => tracing::warn!(
                                    rule = %finding.rule,
                                    %finding.title,
                                    "analyzer finding"
                                ),
                                Severity::Info => tracing::info!(
                                    rule = %finding.rule,
                                    %finding.title,
                                    "analyzer finding"
                                ),
                            }
                        }
                        *analyze_report.lock().unwrap_or_else(|p| p.into_inner()) = Some(report);
                    }
                }
            }
        });

        // The configured rate limiter sits outermost so throttled sends
        // are rejected before any caller-supplied middleware runs.
        let mut chain = MiddlewareChain::new();
        if let Some(ratelimit) = &config.ratelimit {
            let (rate, capacity) = (ratelimit.refill, ratelimit.max_tokens);
            chain.push(Arc::new(RateLimitMiddleware::new(KeyExtractor::Global, move || {
                Arc::new(TokenBucket::new(rate, capacity)) as Arc<dyn RateLimiter>
            })));
        }
        for middleware in self.middlewares {
            chain.push(middleware);
        }

        NotifyHub {
            queue,
            scheduler,
            scheduler_handle,
            pool,
            store,
            router,
            breakers,
            metrics,
            chain,
            callback_registry,
            latest_report,
            background_tx,
            background_tasks: StdMutex::new(vec![gc_task, sweep_task, analyze_task]),
            closed: AtomicBool::new(false),
        }
    }
}

/// Multi-platform notification dispatch system.
pub struct NotifyHub {
    queue: Arc<MemoryQueue>,
    scheduler: DelayScheduler,
    scheduler_handle: SchedulerHandle,
    pool: WorkerPool,
    store: Arc<ReceiptStore>,
    router: Arc<Router>,
    breakers: BreakerRegistry,
    metrics: MetricsRegistry,
    chain: MiddlewareChain,
    callback_registry: Arc<CallbackRegistry>,
    latest_report: Arc<StdMutex<Option<Report>>>,
    background_tx: watch::Sender<bool>,
    background_tasks: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Terminal chain handler: enqueue (or schedule) and wait for the
/// terminal receipt.
struct DispatchHandler<'hub> {
    hub: &'hub NotifyHub,
}

struct TerminalWaiter(StdMutex<Option<oneshot::Sender<Receipt>>>);

#[async_trait]
impl Subscriber for TerminalWaiter {
    async fn on_receipt(&self, receipt: Receipt) {
        if receipt.status.is_terminal() {
            if let Some(tx) = self.0.lock().unwrap_or_else(|p| p.into_inner()).take() {
                let _ = tx.send(receipt);
            }
        }
    }
}

#[async_trait]
impl SendHandler for DispatchHandler<'_> {
    async fn handle(
        &self,
        ctx: &Context,
        message: &Message,
        _targets: &[Target],
    ) -> Result<Receipt, NotifyError> {
        let id = message.id.clone();
        let (tx, rx) = oneshot::channel();
        self.hub.store.subscribe(&id, Arc::new(TerminalWaiter(StdMutex::new(Some(tx)))));
        self.hub.store.track(&id, message.targets.len());

        if let Err(err) = self.hub.submit(message.clone()).await {
            self.hub.store.unsubscribe(&id);
            return Err(err);
        }

        let outcome = tokio::select! {
            received = rx => received.map_err(|_| {
                NotifyError::SystemTimeout("receipt channel dropped".into())
            }),
            err = ctx.done() => Err(err),
        };
        self.hub.store.unsubscribe(&id);
        outcome
    }
}

impl NotifyHub {
    pub fn builder() -> NotifyHubBuilder {
        NotifyHubBuilder::default()
    }

    /// Enqueue immediately or hand to the scheduler when the message has a
    /// future due time.
    async fn submit(&self, message: Message) -> Result<(), NotifyError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NotifyError::QueueClosed);
        }
        let queued = QueuedMessage::new(message);
        match queued.message.due_delay(chrono::Utc::now()) {
            Some(delay) if delay > Duration::ZERO => {
                tracing::debug!(
                    message_id = %queued.id(),
                    delay_ms = delay.as_millis() as u64,
                    "scheduling delayed message"
                );
                self.scheduler_handle.schedule_in(queued, delay);
                Ok(())
            }
            _ => self.queue.enqueue(queued).await.map(|_| ()),
        }
    }

    /// Send through the middleware chain and wait for the terminal receipt.
    pub async fn send(&self, ctx: &Context, message: Message) -> Result<Receipt, NotifyError> {
        message.validate()?;
        let targets = message.targets.clone();
        self.chain.execute(ctx, &message, &targets, &DispatchHandler { hub: self }).await
    }

    /// Like [`send`](Self::send), with per-message callbacks.
    pub async fn send_with_callbacks(
        &self,
        ctx: &Context,
        message: Message,
        options: CallbackOptions,
    ) -> Result<Receipt, NotifyError> {
        self.callback_registry.register(&message.id, options);
        self.send(ctx, message).await
    }

    /// Fire-and-track: enqueue (or schedule) and return immediately.
    pub async fn send_async(
        &self,
        _ctx: &Context,
        message: Message,
    ) -> Result<AsyncReceipt, NotifyError> {
        message.validate()?;
        let receipt = self.store.track(&message.id, message.targets.len());
        self.submit(message).await?;
        Ok(receipt)
    }

    /// Fire-and-track with per-message callbacks.
    pub async fn send_async_with_callbacks(
        &self,
        ctx: &Context,
        message: Message,
        options: CallbackOptions,
    ) -> Result<AsyncReceipt, NotifyError> {
        self.callback_registry.register(&message.id, options);
        self.send_async(ctx, message).await
    }

    pub fn receipts(&self) -> &Arc<ReceiptStore> {
        &self.store
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// The most recent periodic analyzer report, if one has run yet.
    pub fn latest_report(&self) -> Option<Report> {
        self.latest_report.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn worker_count(&self) -> usize {
        self.pool.worker_count()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Drain the scheduler, stop the workers, close the queue, and stop
    /// background tasks. Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("notifyhub shutting down");
        self.scheduler.stop().await;
        self.pool.shutdown().await;
        self.queue.close();
        let _ = self.background_tx.send(true);
        let tasks: Vec<_> =
            self.background_tasks.lock().unwrap_or_else(|p| p.into_inner()).drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}
