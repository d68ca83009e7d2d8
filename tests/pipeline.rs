//! End-to-end pipeline scenarios: submission through queue, workers,
//! retry, circuit breaking, and receipts.

use notifyhub::{
    BreakerConfig, CallbackOptions, Context, Message, MockSender, NotifyConfig, NotifyHub,
    ReceiptStatus, RetryConfig, ScalingConfig, SchedulerConfig,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn fast_config() -> NotifyConfig {
    NotifyConfig {
        scheduler: SchedulerConfig { tick: Duration::from_millis(20) },
        retry: RetryConfig {
            base_delay: Duration::from_millis(10),
            multiplier: 2.0,
            max_delay: Duration::from_secs(1),
            jitter: 0.0,
            max_attempts: 3,
        },
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
async fn happy_path_single_email_target() {
    let email = MockSender::succeeding("email");
    email.set_latency(Duration::from_millis(100));
    let hub = NotifyHub::builder().config(fast_config()).sender(email.clone()).build();

    let message = Message::builder().title("hello").to("a@x.com").build().unwrap();
    let receipt = hub.send(&Context::background(), message).await.unwrap();

    assert_eq!(receipt.status, ReceiptStatus::Completed);
    assert_eq!((receipt.successful, receipt.failed, receipt.total), (1, 0, 1));
    assert_eq!(receipt.results.len(), 1);
    assert_eq!(receipt.results[0].platform, "email");
    assert!(receipt.results[0].success);
    assert!(receipt.results[0].duration >= Duration::from_millis(90));

    assert_eq!(hub.queue_len(), 0);
    assert_eq!(email.calls(), 1, "worker acks exactly once");
    hub.shutdown().await;
}

#[tokio::test]
async fn partial_failure_retries_sms_until_success() {
    let email = MockSender::succeeding("email");
    let sms = MockSender::succeeding("sms");
    sms.fail_target("+15550001111", 2, "platform sms timed out");

    let hub = NotifyHub::builder()
        .config(fast_config())
        .sender(email.clone())
        .sender(sms.clone())
        .build();

    let retries = Arc::new(AtomicU32::new(0));
    let retry_counter = retries.clone();
    let options = CallbackOptions::new().on_retry(move |payload| {
        let counter = retry_counter.clone();
        async move {
            assert!(payload.error.is_some());
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    let started = Instant::now();
    let message = Message::builder()
        .title("mixed")
        .to("a@x.com")
        .to("+15550001111")
        .build()
        .unwrap();
    let receipt =
        hub.send_with_callbacks(&Context::background(), message, options).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(receipt.status, ReceiptStatus::Completed);
    assert_eq!((receipt.successful, receipt.failed, receipt.total), (2, 0, 2));
    assert_eq!(sms.calls(), 3, "two timeouts then success");
    assert!(elapsed >= Duration::from_millis(30), "10ms + 20ms of backoff, got {elapsed:?}");

    // Callback tasks are detached; give them a beat.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(retries.load(Ordering::SeqCst), 2, "one retry callback per nack");
    hub.shutdown().await;
}

#[tokio::test]
async fn circuit_opens_after_five_failures_and_recovers() {
    let email = MockSender::flaky("email", 5, "authentication rejected by email");
    let mut config = fast_config();
    config.breaker = BreakerConfig {
        failure_threshold: 5,
        cool_down: Duration::from_millis(300),
    };
    let hub = NotifyHub::builder().config(config).sender(email.clone()).build();
    let ctx = Context::background();

    // Five consecutive failures open the breaker. Auth errors are not
    // retried, so each send is exactly one platform call.
    for i in 0..5 {
        let message =
            Message::builder().id(format!("m{i}")).title("x").to("a@x.com").build().unwrap();
        let receipt = hub.send(&ctx, message).await.unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Failed);
    }
    assert_eq!(email.calls(), 5);

    // Sixth submission inside the cool-down is rejected without touching
    // the sender.
    let message = Message::builder().id("m5").title("x").to("a@x.com").build().unwrap();
    let receipt = hub.send(&ctx, message).await.unwrap();
    assert_eq!(receipt.status, ReceiptStatus::Failed);
    assert!(receipt.results[0].error.contains("unavailable"));
    assert_eq!(email.calls(), 5, "open breaker must suppress the send");

    // After the cool-down one probe is admitted; the sender now succeeds,
    // closing the breaker.
    tokio::time::sleep(Duration::from_millis(350)).await;
    let message = Message::builder().id("m6").title("x").to("a@x.com").build().unwrap();
    let receipt = hub.send(&ctx, message).await.unwrap();
    assert_eq!(receipt.status, ReceiptStatus::Completed);
    assert_eq!(email.calls(), 6);

    let message = Message::builder().id("m7").title("x").to("a@x.com").build().unwrap();
    assert_eq!(hub.send(&ctx, message).await.unwrap().status, ReceiptStatus::Completed);
    hub.shutdown().await;
}

#[tokio::test]
async fn scheduled_delivery_fires_after_due_time() {
    let email = MockSender::succeeding("email");
    let hub = NotifyHub::builder().config(fast_config()).sender(email).build();

    let submitted_at = chrono::Utc::now();
    let message = Message::builder()
        .id("m4")
        .title("later")
        .to("a@x.com")
        .delay(Duration::from_millis(500))
        .build()
        .unwrap();
    hub.send_async(&Context::background(), message).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hub.queue_len(), 0, "nothing promoted before due time");
    assert!(hub.receipts().get("m4").is_none());

    tokio::time::sleep(Duration::from_millis(500)).await;
    let receipt = hub.receipts().get("m4").expect("delivered after due time");
    assert_eq!(receipt.status, ReceiptStatus::Completed);
    assert!(
        receipt.timestamp >= submitted_at + chrono::Duration::milliseconds(500),
        "receipt must not predate the due time"
    );
    hub.shutdown().await;
}

#[tokio::test]
async fn exhausted_retries_fire_max_retries_event() {
    let sms = MockSender::failing("sms", "platform sms timed out");
    let hub = NotifyHub::builder().config(fast_config()).sender(sms.clone()).build();

    let max_retries = Arc::new(AtomicU32::new(0));
    let counter = max_retries.clone();
    let options = CallbackOptions::new().on_max_retries(move |payload| {
        let counter = counter.clone();
        async move {
            assert_eq!(payload.event, notifyhub::CallbackEvent::MaxRetries);
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    let message = Message::builder().title("x").to("+15550001111").build().unwrap();
    let receipt =
        hub.send_with_callbacks(&Context::background(), message, options).await.unwrap();
    assert_eq!(receipt.status, ReceiptStatus::Failed);
    // Initial attempt plus max_attempts redeliveries.
    assert_eq!(sms.calls(), 4);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(max_retries.load(Ordering::SeqCst), 1);
    hub.shutdown().await;
}

#[tokio::test]
async fn async_submission_tracks_progress_to_completion() {
    let email = MockSender::succeeding("email");
    let hub = NotifyHub::builder().config(fast_config()).sender(email).build();

    let message = Message::builder()
        .id("ma")
        .title("x")
        .to("a@x.com")
        .to("b@x.com")
        .build()
        .unwrap();
    let tracker = hub.send_async(&Context::background(), message).await.unwrap();
    assert_eq!(tracker.status, ReceiptStatus::Pending);
    assert_eq!(tracker.progress.as_ref().unwrap().total_targets, 2);

    for _ in 0..100 {
        if hub.receipts().get("ma").is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let tracked = hub.receipts().get_async("ma").unwrap();
    assert_eq!(tracked.status, ReceiptStatus::Completed);
    let progress = tracked.progress.unwrap();
    assert_eq!(progress.processed_targets, 2);
    assert_eq!(progress.successful_targets, 2);
    assert_eq!(progress.progress_percent, 100.0);
    hub.shutdown().await;
}
