//! Signed webhook delivery for lifecycle events.

use notifyhub::{
    sign_payload, verify_signature, CallbackOptions, Context, Message, MockSender, NotifyConfig,
    NotifyHub, ReceiptStatus, ScalingConfig, SchedulerConfig, WebhookConfig,
};
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_config() -> NotifyConfig {
    NotifyConfig {
        scheduler: SchedulerConfig { tick: Duration::from_millis(20) },
        workers: ScalingConfig {
            min_workers: 1,
            max_workers: 2,
            dequeue_timeout: Duration::from_millis(50),
            supervise_interval: Duration::from_millis(20),
            shutdown_grace: Duration::from_millis(1000),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn sent_event_posts_signed_payload() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header("Content-Type", "application/json"))
        .and(header("User-Agent", "NotifyHub-Webhook/1.0"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let hub = NotifyHub::builder()
        .config(fast_config())
        .sender(MockSender::succeeding("email"))
        .build();

    let options = CallbackOptions::new().webhook(
        WebhookConfig::new(format!("{}/hook", server.uri()))
            .with_secret("hunter2")
            .with_timeout(Duration::from_secs(2)),
    );
    let message = Message::builder().id("m1").title("x").to("a@x.com").build().unwrap();
    let receipt =
        hub.send_with_callbacks(&Context::background(), message, options).await.unwrap();
    assert_eq!(receipt.status, ReceiptStatus::Completed);

    // The webhook task is detached; wait for it to land.
    for _ in 0..100 {
        if !server.received_requests().await.unwrap_or_default().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];

    // The signature verifies against the exact body bytes and the shared
    // secret, and against nothing else.
    let signature = request.headers.get("X-NotifyHub-Signature").unwrap().to_str().unwrap();
    assert_eq!(signature, sign_payload("hunter2", &request.body));
    assert!(verify_signature("hunter2", &request.body, signature));
    assert!(!verify_signature("wrong-secret", &request.body, signature));
    let mut tampered = request.body.clone();
    tampered[0] ^= 0x01;
    assert!(!verify_signature("hunter2", &tampered, signature));

    let payload: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(payload["message_id"], "m1");
    assert_eq!(payload["event"], "sent");
    assert_eq!(payload["results"][0]["platform"], "email");
    assert!(payload["executed_at"].is_string());
    assert!(payload["duration"].is_u64());

    hub.shutdown().await;
}

#[tokio::test]
async fn webhook_without_secret_sends_no_signature() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let hub = NotifyHub::builder()
        .config(fast_config())
        .sender(MockSender::succeeding("email"))
        .build();

    let options = CallbackOptions::new()
        .webhook(WebhookConfig::new(format!("{}/hook", server.uri())));
    let message = Message::builder().title("x").to("a@x.com").build().unwrap();
    hub.send_with_callbacks(&Context::background(), message, options).await.unwrap();

    for _ in 0..100 {
        if !server.received_requests().await.unwrap_or_default().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].headers.get("X-NotifyHub-Signature").is_none());

    hub.shutdown().await;
}

#[tokio::test]
async fn webhook_failure_does_not_affect_delivery() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let hub = NotifyHub::builder()
        .config(fast_config())
        .sender(MockSender::succeeding("email"))
        .build();

    let options = CallbackOptions::new()
        .webhook(WebhookConfig::new(format!("{}/hook", server.uri())).with_secret("s"));
    let message = Message::builder().id("m1").title("x").to("a@x.com").build().unwrap();
    let receipt =
        hub.send_with_callbacks(&Context::background(), message, options).await.unwrap();

    // A 5xx from the webhook endpoint is logged, not retried, and never
    // touches the delivery outcome.
    assert_eq!(receipt.status, ReceiptStatus::Completed);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hub.receipts().get("m1").unwrap().status, ReceiptStatus::Completed);

    hub.shutdown().await;
}

#[tokio::test]
async fn failed_event_carries_error_detail() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let hub = NotifyHub::builder()
        .config(fast_config())
        .sender(MockSender::failing("email", "authentication rejected by email"))
        .build();

    let options = CallbackOptions::new()
        .webhook(WebhookConfig::new(format!("{}/hook", server.uri())));
    let message = Message::builder().title("x").to("a@x.com").build().unwrap();
    let receipt =
        hub.send_with_callbacks(&Context::background(), message, options).await.unwrap();
    assert_eq!(receipt.status, ReceiptStatus::Failed);

    for _ in 0..100 {
        if !server.received_requests().await.unwrap_or_default().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let requests = server.received_requests().await.unwrap();
    let payload: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(payload["event"], "failed");
    assert!(payload["error"].as_str().unwrap().contains("authentication"));

    hub.shutdown().await;
}
