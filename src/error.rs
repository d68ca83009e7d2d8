//! Error taxonomy for the dispatch pipeline.
//!
//! Every error carries enough context to decide whether a retry is worth
//! attempting. Retryability is a property of the kind, not the call site.

use std::time::Duration;

/// Unified error type for all dispatch operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    /// Malformed target, empty value, unsupported type.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Missing secret, unknown platform, invalid option.
    #[error("configuration error: {0}")]
    Config(String),

    /// Platform-reported authentication or authorization failure.
    #[error("authentication rejected by {platform}: {reason}")]
    Auth { platform: String, reason: String },

    /// The platform did not answer within its deadline.
    #[error("platform {platform} timed out after {elapsed:?}")]
    PlatformTimeout { platform: String, elapsed: Duration },

    /// The platform is down or its circuit breaker is open.
    #[error("platform {platform} unavailable: {reason}")]
    PlatformUnavailable { platform: String, reason: String },

    /// The platform asked us to slow down.
    #[error("platform {platform} rate limited: {detail}")]
    PlatformRateLimit { platform: String, detail: String },

    #[error("network timeout: {0}")]
    NetworkTimeout(String),

    #[error("network connection failed: {0}")]
    NetworkConnection(String),

    /// Bounded queue buffer is saturated; callers decide to drop or retry.
    #[error("queue is full ({capacity} buffered)")]
    QueueFull { capacity: usize },

    /// Queue was closed; permanent.
    #[error("queue is closed")]
    QueueClosed,

    #[error("queue wait timed out after {0:?}")]
    QueueTimeout(Duration),

    /// Context deadline exceeded or a retry delay was cut short.
    #[error("operation timed out: {0}")]
    SystemTimeout(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The router found no healthy platform for a target.
    #[error("no platform available for target {target}")]
    NoPlatform { target: String },

    /// The caller's context was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

impl NotifyError {
    /// Whether a retry with backoff may succeed for this kind.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PlatformTimeout { .. }
                | Self::PlatformUnavailable { .. }
                | Self::PlatformRateLimit { .. }
                | Self::NetworkTimeout(_)
                | Self::NetworkConnection(_)
                | Self::QueueTimeout(_)
                | Self::SystemTimeout(_)
                | Self::ResourceExhausted(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::PlatformTimeout { .. }
                | Self::NetworkTimeout(_)
                | Self::QueueTimeout(_)
                | Self::SystemTimeout(_)
        )
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::PlatformRateLimit { .. })
    }

    pub fn is_queue_full(&self) -> bool {
        matches!(self, Self::QueueFull { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Decide retryability from an error string captured in a per-target result.
///
/// Per-target failures cross the worker boundary as strings, so the retry
/// layer classifies them by case-insensitive substring, the same way the
/// aggregator buckets them.
pub fn is_retryable_message(error: &str) -> bool {
    let lower = error.to_ascii_lowercase();
    if lower.contains("auth") || lower.contains("validation") || lower.contains("configuration") {
        return false;
    }
    lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("unavailable")
        || lower.contains("rate limit")
        || lower.contains("connection")
        || lower.contains("exhausted")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(NotifyError::PlatformTimeout {
            platform: "email".into(),
            elapsed: Duration::from_secs(5),
        }
        .is_retryable());
        assert!(NotifyError::NetworkConnection("refused".into()).is_retryable());
        assert!(NotifyError::QueueTimeout(Duration::from_secs(5)).is_retryable());
        assert!(NotifyError::ResourceExhausted("fd limit".into()).is_retryable());
    }

    #[test]
    fn non_retryable_kinds() {
        assert!(!NotifyError::Validation("empty value".into()).is_retryable());
        assert!(!NotifyError::Config("unknown platform".into()).is_retryable());
        assert!(!NotifyError::Auth { platform: "sms".into(), reason: "bad token".into() }
            .is_retryable());
        assert!(!NotifyError::QueueClosed.is_retryable());
        assert!(!NotifyError::NoPlatform { target: "x".into() }.is_retryable());
        assert!(!NotifyError::Cancelled.is_retryable());
    }

    #[test]
    fn queue_full_is_callers_choice() {
        let err = NotifyError::QueueFull { capacity: 1000 };
        assert!(!err.is_retryable());
        assert!(err.is_queue_full());
    }

    #[test]
    fn timeout_predicate_covers_all_timeout_kinds() {
        assert!(NotifyError::SystemTimeout("ctx".into()).is_timeout());
        assert!(NotifyError::NetworkTimeout("dns".into()).is_timeout());
        assert!(!NotifyError::QueueClosed.is_timeout());
    }

    #[test]
    fn message_classification() {
        assert!(is_retryable_message("platform timed out after 5s"));
        assert!(is_retryable_message("connection reset by peer"));
        assert!(is_retryable_message("429 rate limit exceeded"));
        assert!(!is_retryable_message("authentication rejected by sms"));
        assert!(!is_retryable_message("validation failed: empty value"));
    }

    #[test]
    fn display_carries_context() {
        let err = NotifyError::PlatformRateLimit {
            platform: "webhook".into(),
            detail: "usage=100 limit=100 reset=30s".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("webhook"));
        assert!(msg.contains("reset=30s"));
    }
}
