//! Consolidated outcome records.
//!
//! The JSON shape here is stable: it is what `export`/`import` exchange and
//! what callback webhooks carry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Terminal and transient states of a receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    PartialFailed,
    Cancelled,
}

impl ReceiptStatus {
    /// Whether no further transitions will happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::PartialFailed | Self::Cancelled)
    }
}

impl std::fmt::Display for ReceiptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::PartialFailed => "partial_failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

pub(crate) mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(v: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(v.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(d)?))
    }
}

/// Outcome of one send to one target on one platform.
///
/// Invariant: `success` iff `error` is empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformResult {
    pub platform: String,
    pub target: String,
    pub success: bool,
    #[serde(rename = "message_id", default)]
    pub platform_message_id: String,
    #[serde(default)]
    pub error: String,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
}

impl PlatformResult {
    pub fn ok(
        platform: impl Into<String>,
        target: impl Into<String>,
        platform_message_id: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            platform: platform.into(),
            target: target.into(),
            success: true,
            platform_message_id: platform_message_id.into(),
            error: String::new(),
            timestamp: Utc::now(),
            duration,
        }
    }

    pub fn err(
        platform: impl Into<String>,
        target: impl Into<String>,
        error: impl Into<String>,
        duration: Duration,
    ) -> Self {
        let error = error.into();
        Self {
            platform: platform.into(),
            target: target.into(),
            success: false,
            platform_message_id: String::new(),
            error,
            timestamp: Utc::now(),
            duration,
        }
    }
}

/// Consolidated outcome record for one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub message_id: String,
    pub status: ReceiptStatus,
    #[serde(default)]
    pub results: Vec<PlatformResult>,
    pub successful: usize,
    pub failed: usize,
    pub total: usize,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Receipt {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            status: ReceiptStatus::Pending,
            results: Vec::new(),
            successful: 0,
            failed: 0,
            total: 0,
            timestamp: Utc::now(),
            error: None,
        }
    }

    /// Fraction of successful results; zero when empty.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.successful as f64 / self.total as f64
    }
}

/// Delivery progress of an asynchronously submitted message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub total_targets: usize,
    pub processed_targets: usize,
    pub successful_targets: usize,
    pub failed_targets: usize,
    pub progress_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_completion: Option<DateTime<Utc>>,
}

impl Progress {
    pub fn new(total: usize) -> Self {
        Self {
            total_targets: total,
            processed_targets: 0,
            successful_targets: 0,
            failed_targets: 0,
            progress_percent: 0.0,
            estimated_completion: None,
        }
    }

    /// Record processed counts, keeping the derived fields consistent.
    pub fn record(&mut self, successful: usize, failed: usize) {
        self.successful_targets = successful;
        self.failed_targets = failed;
        self.processed_targets = (successful + failed).min(self.total_targets);
        self.progress_percent = if self.total_targets == 0 {
            100.0
        } else {
            (self.processed_targets as f64 / self.total_targets as f64 * 100.0).clamp(0.0, 100.0)
        };
    }
}

/// Receipt handed back immediately for asynchronous submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncReceipt {
    pub message_id: String,
    pub status: ReceiptStatus,
    pub queued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
}

impl AsyncReceipt {
    pub fn queued(message_id: impl Into<String>, total_targets: usize) -> Self {
        Self {
            message_id: message_id.into(),
            status: ReceiptStatus::Pending,
            queued_at: Utc::now(),
            progress: Some(Progress::new(total_targets)),
        }
    }
}
