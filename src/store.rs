//! Receipt store: in-memory map with filter queries, pub/sub, retention
//! GC, and JSON export/import.
//!
//! One RW lock guards all state. Reads hand out deep copies; subscribers
//! are invoked in detached tasks after the lock is released.

use crate::aggregate::{analyze_batch, FailurePatterns};
use crate::{AsyncReceipt, NotifyError, Receipt, ReceiptStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;

/// Observer registered on a message id.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn on_receipt(&self, receipt: Receipt);
}

/// Optional durable backend mirrored by the store.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn persist(&self, receipt: &Receipt) -> Result<(), NotifyError>;
    async fn remove(&self, message_id: &str) -> Result<(), NotifyError>;
}

/// Retention tuning.
#[derive(Debug, Clone)]
pub struct ReceiptConfig {
    pub max_retention: Duration,
    pub cleanup_interval: Duration,
}

impl Default for ReceiptConfig {
    fn default() -> Self {
        Self {
            max_retention: Duration::from_secs(24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Query filter over stored receipts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReceiptFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: Vec<ReceiptStatus>,
    #[serde(default)]
    pub platforms: Vec<String>,
    #[serde(default)]
    pub message_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl ReceiptFilter {
    pub fn statuses(statuses: impl IntoIterator<Item = ReceiptStatus>) -> Self {
        Self { status: statuses.into_iter().collect(), ..Default::default() }
    }

    fn matches(&self, receipt: &Receipt) -> bool {
        if let Some(start) = self.start_time {
            if receipt.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if receipt.timestamp > end {
                return false;
            }
        }
        if !self.status.is_empty() && !self.status.contains(&receipt.status) {
            return false;
        }
        if !self.message_ids.is_empty() && !self.message_ids.contains(&receipt.message_id) {
            return false;
        }
        if !self.platforms.is_empty()
            && !receipt.results.iter().any(|r| self.platforms.contains(&r.platform))
        {
            return false;
        }
        true
    }
}

struct StoreState {
    receipts: HashMap<String, Receipt>,
    order: Vec<String>,
    trackers: HashMap<String, AsyncReceipt>,
    subscribers: HashMap<String, Vec<Arc<dyn Subscriber>>>,
}

/// In-memory receipt store.
pub struct ReceiptStore {
    state: RwLock<StoreState>,
    persistence: Option<Arc<dyn PersistenceStore>>,
    config: ReceiptConfig,
}

impl ReceiptStore {
    pub fn new(config: ReceiptConfig) -> Self {
        Self {
            state: RwLock::new(StoreState {
                receipts: HashMap::new(),
                order: Vec::new(),
                trackers: HashMap::new(),
                subscribers: HashMap::new(),
            }),
            persistence: None,
            config,
        }
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn PersistenceStore>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Register an async tracker for a freshly submitted message.
    pub fn track(&self, message_id: &str, total_targets: usize) -> AsyncReceipt {
        let tracker = AsyncReceipt::queued(message_id, total_targets);
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        state.trackers.insert(message_id.to_string(), tracker.clone());
        tracker
    }

    /// Store (insert or update) a receipt and notify its subscribers.
    pub async fn process(&self, receipt: Receipt) {
        let (stored, subscribers) = {
            let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
            let id = receipt.message_id.clone();
            if !state.receipts.contains_key(&id) {
                state.order.push(id.clone());
            }
            if let Some(tracker) = state.trackers.get_mut(&id) {
                tracker.status = receipt.status;
                let queued_at = tracker.queued_at;
                if let Some(progress) = tracker.progress.as_mut() {
                    progress.record(receipt.successful, receipt.failed);
                    progress.estimated_completion = if receipt.status.is_terminal()
                        || progress.processed_targets == 0
                    {
                        None
                    } else {
                        let elapsed = Utc::now().signed_duration_since(queued_at);
                        let remaining = progress.total_targets - progress.processed_targets;
                        let per_target = elapsed / progress.processed_targets as i32;
                        Some(Utc::now() + per_target * remaining as i32)
                    };
                }
            }
            state.receipts.insert(id.clone(), receipt.clone());
            let subscribers = state.subscribers.get(&id).cloned().unwrap_or_default();
            (receipt, subscribers)
        };

        if let Some(persistence) = &self.persistence {
            if let Err(err) = persistence.persist(&stored).await {
                tracing::warn!(message_id = %stored.message_id, %err, "receipt persistence failed");
            }
        }

        // Subscribers run outside the lock, one task per call; a panicking
        // subscriber only poisons its own task.
        for subscriber in subscribers {
            let copy = stored.clone();
            tokio::spawn(async move {
                subscriber.on_receipt(copy).await;
            });
        }
    }

    pub async fn batch_process(&self, receipts: Vec<Receipt>) {
        for receipt in receipts {
            self.process(receipt).await;
        }
    }

    pub fn get(&self, message_id: &str) -> Option<Receipt> {
        self.state.read().unwrap_or_else(|p| p.into_inner()).receipts.get(message_id).cloned()
    }

    pub fn get_async(&self, message_id: &str) -> Option<AsyncReceipt> {
        self.state.read().unwrap_or_else(|p| p.into_inner()).trackers.get(message_id).cloned()
    }

    /// Matching receipts in insertion order, after offset/limit.
    pub fn query(&self, filter: &ReceiptFilter) -> Vec<Receipt> {
        let state = self.state.read().unwrap_or_else(|p| p.into_inner());
        let iter = state
            .order
            .iter()
            .filter_map(|id| state.receipts.get(id))
            .filter(|r| filter.matches(r))
            .skip(filter.offset);
        match filter.limit {
            Some(limit) => iter.take(limit).cloned().collect(),
            None => iter.cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.state.read().unwrap_or_else(|p| p.into_inner()).receipts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self, message_id: &str, subscriber: Arc<dyn Subscriber>) {
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        state.subscribers.entry(message_id.to_string()).or_default().push(subscriber);
    }

    /// Drop every subscriber registered for the message id.
    pub fn unsubscribe(&self, message_id: &str) {
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        state.subscribers.remove(message_id);
    }

    /// Write matching receipts as a pretty-printed JSON array.
    pub fn export<W: std::io::Write>(
        &self,
        writer: W,
        filter: &ReceiptFilter,
    ) -> Result<usize, NotifyError> {
        let receipts = self.query(filter);
        serde_json::to_writer_pretty(writer, &receipts)
            .map_err(|err| NotifyError::Validation(format!("export failed: {err}")))?;
        Ok(receipts.len())
    }

    /// Read a JSON array of receipts (the `export` shape) into the store.
    pub fn import<R: std::io::Read>(&self, reader: R) -> Result<usize, NotifyError> {
        let receipts: Vec<Receipt> = serde_json::from_reader(reader)
            .map_err(|err| NotifyError::Validation(format!("import failed: {err}")))?;
        let count = receipts.len();
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        for receipt in receipts {
            let id = receipt.message_id.clone();
            if !state.receipts.contains_key(&id) {
                state.order.push(id.clone());
            }
            state.receipts.insert(id, receipt);
        }
        Ok(count)
    }

    /// Failure-pattern analysis over the receipts matching `filter`.
    pub fn analyse(&self, filter: &ReceiptFilter) -> FailurePatterns {
        analyze_batch(&self.query(filter))
    }

    /// Remove receipts older than the retention horizon. Returns how many
    /// were removed.
    pub async fn cleanup(&self, now: DateTime<Utc>) -> usize {
        let horizon = now
            - chrono::Duration::from_std(self.config.max_retention)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        let removed: Vec<String> = {
            let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
            let expired: Vec<String> = state
                .receipts
                .iter()
                .filter(|(_, r)| r.timestamp < horizon)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &expired {
                state.receipts.remove(id);
                state.trackers.remove(id);
                state.subscribers.remove(id);
            }
            state.order.retain(|id| !expired.contains(id));
            expired
        };

        if let Some(persistence) = &self.persistence {
            for id in &removed {
                if let Err(err) = persistence.remove(id).await {
                    tracing::warn!(message_id = %id, %err, "persistence removal failed");
                }
            }
        }
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "receipt retention sweep");
        }
        removed.len()
    }

    /// Retention loop, run by the hub until `shutdown` flips.
    pub async fn run_cleaner(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.cleanup_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.cleanup(Utc::now()).await;
                }
            }
        }
    }
}
