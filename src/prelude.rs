//! Convenience re-exports for the common surface.
//!
//! ```rust
//! use notifyhub::prelude::*;
//! ```

pub use crate::{
    AsyncReceipt, Backoff, CallbackEvent, CallbackOptions, Context, Jitter, LoadBalance, Message,
    MessageFormat, NotifyConfig, NotifyError, NotifyHub, PlatformResult, PlatformSender, Priority,
    Receipt, ReceiptFilter, ReceiptStatus, RetryPolicy, RoutingRule, Target, TargetKind,
    WebhookConfig,
};
