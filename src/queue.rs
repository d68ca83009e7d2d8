//! Queue port and bounded in-memory implementation.
//!
//! Delivery to workers is at-least-once: a dequeued message stays in the
//! in-flight set until exactly one of `ack` / `nack` is called for it.

use crate::{Context, Message, NotifyError, PlatformResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

/// A message wrapped with delivery bookkeeping.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message: Message,
    /// Number of nacks so far; strictly monotonic over the lifetime.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_results: Vec<PlatformResult>,
    /// Opaque handle from a durable backend, when one is attached.
    pub stream_id: Option<String>,
}

impl QueuedMessage {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            attempts: 0,
            created_at: Utc::now(),
            next_retry_at: None,
            last_error: None,
            last_results: Vec::new(),
            stream_id: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.message.id
    }
}

/// Re-enqueue sink for nacked messages, implemented by the scheduler.
pub trait Redeliver: Send + Sync {
    fn redeliver(&self, msg: QueuedMessage, at: DateTime<Utc>);
}

/// FIFO-like channel with ack/nack and delayed re-enqueue.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Append a message. Fails fast with `QueueFull` when the bounded
    /// buffer is saturated, `QueueClosed` after `close`.
    async fn enqueue(&self, msg: QueuedMessage) -> Result<String, NotifyError>;

    /// Block until a message is available or the context ends.
    async fn dequeue(&self, ctx: &Context) -> Result<QueuedMessage, NotifyError>;

    /// Permanently remove a dequeued message from the in-flight set.
    async fn ack(&self, id: &str) -> Result<(), NotifyError>;

    /// Mark a dequeued message for retry: increment its attempts and
    /// schedule re-enqueue at `next_retry_at`. The caller passes back its
    /// copy of the message so recorded outcomes (`last_error`,
    /// `last_results`) survive redelivery.
    async fn nack(
        &self,
        msg: QueuedMessage,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), NotifyError>;

    /// Number of buffered (not in-flight) messages.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn health(&self, ctx: &Context) -> Result<(), NotifyError>;

    fn close(&self);
}

/// Bounded in-memory queue.
///
/// One mutex guards the in-flight map; the mpsc channel is the only
/// synchronisation point for consumers. FIFO on the immediate-enqueue
/// path; no ordering guarantee between retries and new messages.
pub struct MemoryQueue {
    capacity: usize,
    tx: StdMutex<Option<mpsc::Sender<QueuedMessage>>>,
    rx: AsyncMutex<mpsc::Receiver<QueuedMessage>>,
    in_flight: StdMutex<HashMap<String, QueuedMessage>>,
    buffered: std::sync::Arc<AtomicUsize>,
    closed: AtomicBool,
    redeliver: StdMutex<Option<std::sync::Arc<dyn Redeliver>>>,
}

impl MemoryQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            capacity,
            tx: StdMutex::new(Some(tx)),
            rx: AsyncMutex::new(rx),
            in_flight: StdMutex::new(HashMap::new()),
            buffered: std::sync::Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
            redeliver: StdMutex::new(None),
        }
    }

    /// Route nacked messages through the given sink (normally the
    /// scheduler). Without one, nacks fall back to a detached timer task.
    pub fn bind_redelivery(&self, sink: std::sync::Arc<dyn Redeliver>) {
        *self.redeliver.lock().unwrap_or_else(|p| p.into_inner()) = Some(sink);
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn sender(&self) -> Result<mpsc::Sender<QueuedMessage>, NotifyError> {
        self.tx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or(NotifyError::QueueClosed)
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn enqueue(&self, msg: QueuedMessage) -> Result<String, NotifyError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NotifyError::QueueClosed);
        }
        let id = msg.id().to_string();
        match self.sender()?.try_send(msg) {
            Ok(()) => {
                self.buffered.fetch_add(1, Ordering::AcqRel);
                Ok(id)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(NotifyError::QueueFull { capacity: self.capacity })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(NotifyError::QueueClosed),
        }
    }

    async fn dequeue(&self, ctx: &Context) -> Result<QueuedMessage, NotifyError> {
        ctx.err()?;
        let mut rx = tokio::select! {
            guard = self.rx.lock() => guard,
            err = ctx.done() => return Err(err),
        };
        tokio::select! {
            received = rx.recv() => match received {
                Some(msg) => {
                    self.buffered.fetch_sub(1, Ordering::AcqRel);
                    self.in_flight
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .insert(msg.id().to_string(), msg.clone());
                    Ok(msg)
                }
                None => Err(NotifyError::QueueClosed),
            },
            err = ctx.done() => Err(err),
        }
    }

    async fn ack(&self, id: &str) -> Result<(), NotifyError> {
        let removed = self.in_flight.lock().unwrap_or_else(|p| p.into_inner()).remove(id);
        if removed.is_none() {
            tracing::debug!(message_id = id, "ack for unknown in-flight message");
        }
        Ok(())
    }

    async fn nack(
        &self,
        mut msg: QueuedMessage,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), NotifyError> {
        let tracked = self
            .in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(msg.id());
        if tracked.is_none() {
            return Err(NotifyError::Config(format!("nack for unknown message {}", msg.id())));
        }

        msg.attempts += 1;
        msg.next_retry_at = Some(next_retry_at);

        let sink = self.redeliver.lock().unwrap_or_else(|p| p.into_inner()).clone();
        match sink {
            Some(sink) => sink.redeliver(msg, next_retry_at),
            None => {
                // Fallback: detached timer preserves at-least-once without a
                // scheduler bound.
                let tx = self.sender()?;
                let buffered = self.buffered.clone();
                let delay = next_retry_at
                    .signed_duration_since(Utc::now())
                    .to_std()
                    .unwrap_or_default();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    buffered.fetch_add(1, Ordering::AcqRel);
                    if tx.send(msg).await.is_err() {
                        buffered.fetch_sub(1, Ordering::AcqRel);
                        tracing::warn!("redelivery dropped: queue closed");
                    }
                });
            }
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    async fn health(&self, _ctx: &Context) -> Result<(), NotifyError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NotifyError::QueueClosed);
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Dropping the sender wakes blocked consumers with QueueClosed.
        self.tx.lock().unwrap_or_else(|p| p.into_inner()).take();
    }
}
