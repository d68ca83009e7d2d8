//! Delayed-message scheduler.
//!
//! A min-heap keyed by due time plus a single promoter task. Due entries
//! are moved into the queue in heap order; promotion happens within one
//! tick of the due time, never before it.

use crate::{Queue, QueuedMessage};
use chrono::{DateTime, Utc};
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Promotion check interval; also the worst-case promotion jitter.
    pub tick: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { tick: Duration::from_secs(1) }
    }
}

struct DueEntry {
    due_at: Instant,
    seq: u64,
    msg: QueuedMessage,
}

impl PartialEq for DueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due_at == other.due_at && self.seq == other.seq
    }
}

impl Eq for DueEntry {}

impl PartialOrd for DueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for DueEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.due_at.cmp(&other.due_at).then(self.seq.cmp(&other.seq))
    }
}

struct Shared {
    queue: Arc<dyn Queue>,
    heap: StdMutex<BinaryHeap<Reverse<DueEntry>>>,
    seq: AtomicU64,
    wake: Notify,
    tick: Duration,
}

impl Shared {
    fn push(&self, msg: QueuedMessage, due_at: Instant) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let earlier = {
            let mut heap = self.heap.lock().unwrap_or_else(|p| p.into_inner());
            let earlier = heap.peek().map(|Reverse(e)| due_at < e.due_at).unwrap_or(true);
            heap.push(Reverse(DueEntry { due_at, seq, msg }));
            earlier
        };
        if earlier {
            self.wake.notify_one();
        }
    }

    /// Move every due entry to the queue. Returns true when the queue
    /// pushed back and promotion should pause for a full tick.
    async fn promote_due(&self) -> bool {
        loop {
            let entry = {
                let mut heap = self.heap.lock().unwrap_or_else(|p| p.into_inner());
                let due = heap
                    .peek()
                    .map(|Reverse(e)| e.due_at <= Instant::now())
                    .unwrap_or(false);
                if !due {
                    return false;
                }
                heap.pop().map(|Reverse(e)| e)
            };
            let Some(entry) = entry else { return false };

            let id = entry.msg.id().to_string();
            let fallback = entry.msg.clone();
            match self.queue.enqueue(entry.msg).await {
                Ok(_) => {
                    tracing::debug!(message_id = %id, "promoted scheduled message");
                }
                Err(err) if err.is_queue_full() => {
                    tracing::debug!(message_id = %id, "queue full, promotion deferred");
                    // Back onto the heap, due now; retried after the next
                    // tick. No wake here, or the promoter would spin.
                    let seq = self.seq.fetch_add(1, Ordering::Relaxed);
                    self.heap
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .push(Reverse(DueEntry { due_at: Instant::now(), seq, msg: fallback }));
                    return true;
                }
                Err(err) => {
                    tracing::warn!(message_id = %id, %err, "dropping scheduled message");
                }
            }
        }
    }
}

/// Cheap handle for pushing work into the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    pub fn schedule_in(&self, msg: QueuedMessage, delay: Duration) {
        self.shared.push(msg, Instant::now() + delay);
    }

    pub fn schedule_at(&self, msg: QueuedMessage, at: DateTime<Utc>) {
        let delay = at.signed_duration_since(Utc::now()).to_std().unwrap_or(Duration::ZERO);
        self.schedule_in(msg, delay);
    }

    /// Number of entries waiting for their due time.
    pub fn pending(&self) -> usize {
        self.shared.heap.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl crate::queue::Redeliver for SchedulerHandle {
    fn redeliver(&self, msg: QueuedMessage, at: DateTime<Utc>) {
        self.schedule_at(msg, at);
    }
}

/// Min-heap scheduler with a timer-driven promoter task.
pub struct DelayScheduler {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl DelayScheduler {
    /// Create the scheduler and start its promoter task.
    pub fn start(queue: Arc<dyn Queue>, config: SchedulerConfig) -> Self {
        let shared = Arc::new(Shared {
            queue,
            heap: StdMutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            wake: Notify::new(),
            tick: config.tick,
        });
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let loop_shared = shared.clone();
        let task = tokio::spawn(async move {
            let mut backpressure = false;
            loop {
                let sleep_for = if backpressure {
                    loop_shared.tick
                } else {
                    let next_due = {
                        let heap = loop_shared.heap.lock().unwrap_or_else(|p| p.into_inner());
                        heap.peek().map(|Reverse(e)| e.due_at)
                    };
                    match next_due {
                        Some(due) => due.saturating_duration_since(Instant::now()).min(loop_shared.tick),
                        None => loop_shared.tick,
                    }
                };
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = loop_shared.wake.notified() => {}
                    _ = tokio::time::sleep(sleep_for) => {}
                }
                backpressure = loop_shared.promote_due().await;
            }
            drain(&loop_shared).await;
        });

        Self { shared, shutdown: shutdown_tx, task: StdMutex::new(Some(task)) }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle { shared: self.shared.clone() }
    }

    /// Stop the promoter: flush due-or-past entries to the queue, discard
    /// the rest.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn drain(shared: &Shared) {
    let now = Instant::now();
    let (due, discarded): (Vec<DueEntry>, Vec<DueEntry>) = {
        let mut heap = shared.heap.lock().unwrap_or_else(|p| p.into_inner());
        std::mem::take(&mut *heap)
            .into_sorted_vec()
            .into_iter()
            .rev()
            .map(|Reverse(e)| e)
            .partition(|e| e.due_at <= now)
    };
    for entry in due {
        let id = entry.msg.id().to_string();
        if let Err(err) = shared.queue.enqueue(entry.msg).await {
            tracing::warn!(message_id = %id, %err, "failed to flush due message on shutdown");
        }
    }
    if !discarded.is_empty() {
        tracing::warn!(count = discarded.len(), "discarding undue scheduled messages on shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Context, MemoryQueue, Message};

    fn msg(id: &str) -> QueuedMessage {
        QueuedMessage::new(
            Message::builder().id(id).title("t").to("a@x.com").build().unwrap(),
        )
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig { tick: Duration::from_millis(20) }
    }

    #[tokio::test]
    async fn promotes_at_due_time_not_before() {
        let queue = Arc::new(MemoryQueue::new(10));
        let scheduler = DelayScheduler::start(queue.clone(), fast_config());
        let handle = scheduler.handle();

        handle.schedule_in(msg("a"), Duration::from_millis(120));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(queue.len(), 0, "promoted before due time");

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(queue.len(), 1);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn promotes_in_due_order() {
        let queue = Arc::new(MemoryQueue::new(10));
        let scheduler = DelayScheduler::start(queue.clone(), fast_config());
        let handle = scheduler.handle();

        handle.schedule_in(msg("late"), Duration::from_millis(80));
        handle.schedule_in(msg("early"), Duration::from_millis(30));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let ctx = Context::background();
        assert_eq!(queue.dequeue(&ctx).await.unwrap().id(), "early");
        assert_eq!(queue.dequeue(&ctx).await.unwrap().id(), "late");
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn earlier_push_wakes_promoter() {
        let queue = Arc::new(MemoryQueue::new(10));
        let scheduler = DelayScheduler::start(queue.clone(), SchedulerConfig {
            tick: Duration::from_secs(10),
        });
        let handle = scheduler.handle();

        // With a 10 s tick, only the wake-on-earlier-push path can promote
        // this in time.
        handle.schedule_in(msg("far"), Duration::from_secs(60));
        handle.schedule_in(msg("near"), Duration::from_millis(30));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(queue.len(), 1);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn queue_full_defers_promotion_to_next_tick() {
        let queue = Arc::new(MemoryQueue::new(1));
        let scheduler = DelayScheduler::start(queue.clone(), fast_config());
        let handle = scheduler.handle();

        handle.schedule_in(msg("a"), Duration::from_millis(10));
        handle.schedule_in(msg("b"), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(queue.len(), 1);
        assert_eq!(handle.pending(), 1, "second message should wait on the heap");

        // Free a slot; the deferred message lands within a tick or two.
        let ctx = Context::background();
        let first = queue.dequeue(&ctx).await.unwrap();
        queue.ack(first.id()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(queue.len(), 1);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn stop_flushes_due_and_discards_undue() {
        let queue = Arc::new(MemoryQueue::new(10));
        let scheduler = DelayScheduler::start(queue.clone(), SchedulerConfig {
            tick: Duration::from_secs(10),
        });
        let handle = scheduler.handle();

        handle.schedule_in(msg("due"), Duration::ZERO);
        handle.schedule_in(msg("undue"), Duration::from_secs(120));
        // The 10 s tick means the due entry is still on the heap unless a
        // wake fired; stop() must flush it either way.
        scheduler.stop().await;

        assert!(queue.len() <= 1);
        let ctx = Context::background().with_timeout(Duration::from_millis(100));
        let flushed = queue.dequeue(&ctx).await.unwrap();
        assert_eq!(flushed.id(), "due");
        assert_eq!(handle.pending(), 0);
    }

    #[tokio::test]
    async fn redeliver_trait_schedules() {
        use crate::queue::Redeliver;
        let queue = Arc::new(MemoryQueue::new(10));
        let scheduler = DelayScheduler::start(queue.clone(), fast_config());
        let handle = scheduler.handle();

        handle.redeliver(msg("r"), Utc::now() + chrono::Duration::milliseconds(30));
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(queue.len(), 1);
        scheduler.stop().await;
    }
}
