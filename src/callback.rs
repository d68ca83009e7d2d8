//! Event hooks: function callbacks and signed webhook delivery.
//!
//! Everything here is best-effort. Callback failures and webhook errors
//! are logged and never influence message acknowledgement.

use crate::receipt::duration_nanos;
use crate::PlatformResult;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Lifecycle events a message can fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackEvent {
    Sent,
    Failed,
    Retry,
    MaxRetries,
}

impl std::fmt::Display for CallbackEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Retry => "retry",
            Self::MaxRetries => "max_retries",
        };
        f.write_str(s)
    }
}

/// Payload handed to callbacks and POSTed to webhooks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub message_id: String,
    pub event: CallbackEvent,
    pub attempts: u32,
    pub executed_at: DateTime<Utc>,
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
    #[serde(default)]
    pub results: Vec<PlatformResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Async function callback.
pub type Callback = Arc<dyn Fn(CallbackPayload) -> BoxFuture<'static, ()> + Send + Sync>;

/// Outgoing webhook endpoint.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    pub secret: Option<String>,
    pub timeout: Duration,
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), secret: None, timeout: Duration::from_secs(10) }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Per-message callback registration.
#[derive(Clone, Default)]
pub struct CallbackOptions {
    callbacks: HashMap<CallbackEvent, Vec<Callback>>,
    webhook: Option<WebhookConfig>,
    callback_timeout: Option<Duration>,
}

impl std::fmt::Debug for CallbackOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackOptions")
            .field("events", &self.callbacks.keys().collect::<Vec<_>>())
            .field("webhook", &self.webhook)
            .finish()
    }
}

impl CallbackOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F, Fut>(mut self, event: CallbackEvent, callback: F) -> Self
    where
        F: Fn(CallbackPayload) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let callback: Callback = Arc::new(move |payload| Box::pin(callback(payload)));
        self.callbacks.entry(event).or_default().push(callback);
        self
    }

    pub fn on_sent<F, Fut>(self, callback: F) -> Self
    where
        F: Fn(CallbackPayload) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.on(CallbackEvent::Sent, callback)
    }

    pub fn on_failed<F, Fut>(self, callback: F) -> Self
    where
        F: Fn(CallbackPayload) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.on(CallbackEvent::Failed, callback)
    }

    pub fn on_retry<F, Fut>(self, callback: F) -> Self
    where
        F: Fn(CallbackPayload) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.on(CallbackEvent::Retry, callback)
    }

    pub fn on_max_retries<F, Fut>(self, callback: F) -> Self
    where
        F: Fn(CallbackPayload) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.on(CallbackEvent::MaxRetries, callback)
    }

    pub fn webhook(mut self, webhook: WebhookConfig) -> Self {
        self.webhook = Some(webhook);
        self
    }

    /// Per-callback execution timeout (default 30 s).
    pub fn callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = Some(timeout);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty() && self.webhook.is_none()
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// `sha256=<lowercase hex HMAC-SHA256>` over the exact body bytes.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        // HMAC accepts keys of any length; unreachable in practice.
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("sha256={}", hex(&mac.finalize().into_bytes()))
}

/// Constant-shape verification counterpart to [`sign_payload`].
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    sign_payload(secret, body) == header
}

/// Per-message callback registrations, shared between the hub (which
/// registers) and the workers (which fire and finally drop them).
#[derive(Default)]
pub struct CallbackRegistry {
    per_message: std::sync::Mutex<HashMap<String, CallbackOptions>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, message_id: &str, options: CallbackOptions) {
        if options.is_empty() {
            return;
        }
        self.per_message
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(message_id.to_string(), options);
    }

    pub fn options_for(&self, message_id: &str) -> Option<CallbackOptions> {
        self.per_message.lock().unwrap_or_else(|p| p.into_inner()).get(message_id).cloned()
    }

    /// Drop the registration once the message reaches a terminal event.
    pub fn remove(&self, message_id: &str) {
        self.per_message.lock().unwrap_or_else(|p| p.into_inner()).remove(message_id);
    }
}

/// Fires callbacks and webhooks for message lifecycle events.
#[derive(Clone)]
pub struct CallbackExecutor {
    client: reqwest::Client,
    default_timeout: Duration,
}

impl Default for CallbackExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackExecutor {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new(), default_timeout: Duration::from_secs(30) }
    }

    /// Fire `event` for the message: every registered callback runs in its
    /// own task under a timeout, and the webhook (when configured) is
    /// POSTed with the standard signed body. Returns immediately.
    pub fn fire(&self, options: &CallbackOptions, payload: CallbackPayload) {
        if options.is_empty() {
            return;
        }
        let timeout = options.callback_timeout.unwrap_or(self.default_timeout);

        if let Some(callbacks) = options.callbacks.get(&payload.event) {
            for callback in callbacks.iter().cloned() {
                let payload = payload.clone();
                let event = payload.event;
                tokio::spawn(async move {
                    if tokio::time::timeout(timeout, callback(payload)).await.is_err() {
                        tracing::warn!(%event, "callback timed out");
                    }
                });
            }
        }

        if let Some(webhook) = options.webhook.clone() {
            let client = self.client.clone();
            tokio::spawn(async move {
                post_webhook(client, webhook, payload).await;
            });
        }
    }
}

async fn post_webhook(client: reqwest::Client, webhook: WebhookConfig, payload: CallbackPayload) {
    let body = match serde_json::to_vec(&payload) {
        Ok(body) => body,
        Err(err) => {
            tracing::warn!(%err, "webhook payload serialization failed");
            return;
        }
    };

    let mut request = client
        .post(&webhook.url)
        .header("Content-Type", "application/json")
        .header("User-Agent", "NotifyHub-Webhook/1.0")
        .timeout(webhook.timeout);
    if let Some(secret) = &webhook.secret {
        request = request.header("X-NotifyHub-Signature", sign_payload(secret, &body));
    }

    match request.body(body).send().await {
        Ok(response) if response.status().is_success() => {
            tracing::debug!(
                url = %webhook.url,
                event = %payload.event,
                message_id = %payload.message_id,
                "webhook delivered"
            );
        }
        Ok(response) => {
            tracing::warn!(
                url = %webhook.url,
                status = response.status().as_u16(),
                "webhook rejected"
            );
        }
        Err(err) => {
            tracing::warn!(url = %webhook.url, %err, "webhook request failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn payload(event: CallbackEvent) -> CallbackPayload {
        CallbackPayload {
            message_id: "m1".into(),
            event,
            attempts: 1,
            executed_at: Utc::now(),
            duration: Duration::from_millis(100),
            results: Vec::new(),
            error: None,
        }
    }

    #[test]
    fn signature_shape_and_stability() {
        let sig = sign_payload("hunter2", b"{\"message_id\":\"m1\"}");
        assert!(sig.starts_with("sha256="));
        assert_eq!(sig.len(), "sha256=".len() + 64);
        assert!(sig[7..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(sig, sign_payload("hunter2", b"{\"message_id\":\"m1\"}"));
    }

    #[test]
    fn signature_changes_with_any_byte() {
        let body = b"{\"message_id\":\"m1\"}".to_vec();
        let sig = sign_payload("hunter2", &body);
        assert!(verify_signature("hunter2", &body, &sig));

        for i in 0..body.len() {
            let mut tampered = body.clone();
            tampered[i] ^= 0x01;
            assert!(!verify_signature("hunter2", &tampered, &sig), "byte {i} not detected");
        }
        assert!(!verify_signature("hunter3", &body, &sig));
    }

    #[tokio::test]
    async fn callbacks_fire_for_matching_event_only() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let options = CallbackOptions::new()
            .on_sent(move |p| {
                let seen = seen_clone.clone();
                async move {
                    seen.lock().unwrap().push(p.message_id);
                }
            })
            .on_failed(|_| async { panic!("failed callback must not fire") });

        let executor = CallbackExecutor::new();
        executor.fire(&options, payload(CallbackEvent::Sent));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn hung_callback_does_not_block_fire() {
        let options = CallbackOptions::new()
            .callback_timeout(Duration::from_millis(20))
            .on_sent(|_| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            });

        let executor = CallbackExecutor::new();
        let started = std::time::Instant::now();
        executor.fire(&options, payload(CallbackEvent::Sent));
        assert!(started.elapsed() < Duration::from_millis(50), "fire must not block");
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    #[tokio::test]
    async fn empty_options_are_a_no_op() {
        let executor = CallbackExecutor::new();
        executor.fire(&CallbackOptions::new(), payload(CallbackEvent::Retry));
    }

    #[test]
    fn payload_json_shape() {
        let p = payload(CallbackEvent::MaxRetries);
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["event"], "max_retries");
        assert_eq!(json["attempts"], 1);
        assert_eq!(json["duration"], 100_000_000u64);
        assert!(json.get("error").is_none());
    }
}
