#![forbid(unsafe_code)]

//! # NotifyHub
//!
//! Multi-platform notification dispatch for async Rust: a caller submits a
//! logical message (title, body, format, priority, per-platform extras)
//! with a set of delivery targets; the hub routes targets to platform
//! senders, fans out, retries transient failures with backoff and
//! per-platform circuit breaking, and folds per-target outcomes into a
//! consolidated receipt.
//!
//! ## Features
//!
//! - **Bounded queue** with ack/nack and at-least-once delivery
//! - **Scheduler** for delayed and scheduled messages
//! - **Retry policies** (fixed, linear, exponential) with symmetric jitter
//! - **Circuit breakers** per platform with half-open probing
//! - **Target router** with round-robin / random / weighted selection
//! - **Worker pool** with load-driven dynamic scaling
//! - **Receipt store** with filters, pub/sub, retention GC, export/import
//! - **Middleware chain**: logging, metrics, rate limiting, whole-chain retry
//! - **Signed webhooks** (`X-NotifyHub-Signature`) for lifecycle events
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use notifyhub::{Context, Message, MockSender, NotifyHub};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), notifyhub::NotifyError> {
//!     let hub = NotifyHub::builder()
//!         .sender(MockSender::succeeding("email"))
//!         .build();
//!
//!     let message = Message::builder()
//!         .title("Deploy finished")
//!         .body("v1.42 is live")
//!         .to("ops@example.com")
//!         .build()?;
//!
//!     let receipt = hub.send(&Context::background(), message).await?;
//!     println!("delivered to {} targets", receipt.successful);
//!
//!     hub.shutdown().await;
//!     Ok(())
//! }
//! ```

mod aggregate;
mod analyzer;
mod backoff;
mod breaker;
mod callback;
mod clock;
mod config;
mod context;
mod error;
mod hub;
mod jitter;
mod message;
mod metrics;
mod middleware;
mod processor;
mod queue;
mod rate_limit;
mod receipt;
mod retry;
mod router;
mod scheduler;
mod sender;
mod sleeper;
mod store;
mod worker;

// Re-exports
pub use aggregate::{analyze_batch, AggregateConfig, Aggregator, FailurePatterns};
pub use analyzer::{
    Analyzer, Finding, HighFailureRate, PatternDetector, PlatformFailure, Report, Rule, Severity,
};
pub use backoff::{Backoff, MAX_BACKOFF};
pub use breaker::{BreakerConfig, BreakerRegistry, CircuitState, PlatformBreaker};
pub use callback::{
    sign_payload, verify_signature, Callback, CallbackEvent, CallbackExecutor, CallbackOptions,
    CallbackPayload, CallbackRegistry, WebhookConfig,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{NotifyConfig, QueueConfig, RateLimitConfig, RetryConfig};
pub use context::{CancelHandle, Context};
pub use error::NotifyError;
pub use hub::{NotifyHub, NotifyHubBuilder};
pub use jitter::Jitter;
pub use message::{Message, MessageBuilder, MessageFormat, Priority, Target, TargetKind};
pub use metrics::{HistogramSummary, MetricsRegistry, MetricsSnapshot};
pub use middleware::{
    LoggingMiddleware, MetricsMiddleware, Middleware, MiddlewareChain, Next, PlatformRetryStats,
    RateLimitMiddleware, RetryMiddleware, RetryStats, SendHandler,
};
pub use processor::Processor;
pub use queue::{MemoryQueue, Queue, QueuedMessage, Redeliver};
pub use rate_limit::{Decision, KeyExtractor, RateLimiter, SlidingWindow, TokenBucket};
pub use receipt::{AsyncReceipt, PlatformResult, Progress, Receipt, ReceiptStatus};
pub use retry::{RetryPolicy, RetryPolicyBuilder};
pub use router::{LoadBalance, PlatformHealth, Router, RoutingRule};
pub use scheduler::{DelayScheduler, SchedulerConfig, SchedulerHandle};
pub use sender::{MockSender, PlatformSender};
pub use sleeper::{Sleeper, TokioSleeper, TrackingSleeper};
pub use store::{
    PersistenceStore, ReceiptConfig, ReceiptFilter, ReceiptStore, Subscriber,
};
pub use worker::{ScalingConfig, WorkerDeps, WorkerPool, WorkerSnapshot, WorkerState};

pub mod prelude;
