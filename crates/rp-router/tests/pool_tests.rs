//! Process pool behavior: concurrency enforcement, rate-limit deferral,
//! deferred outcomes, and in-place resize.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use rp_common::{AckNack, MediationOutcome, MessagePointer, PoolConfig, RoutedMessage};
use rp_router::pool::ProcessPool;
use rp_router::Mediator;

/// Tracks the peak number of concurrent mediations.
struct ConcurrencyProbe {
    active: AtomicU32,
    peak: AtomicU32,
    delay: Duration,
    outcome: fn() -> MediationOutcome,
}

impl ConcurrencyProbe {
    fn new(delay_ms: u64) -> Self {
        Self {
            active: AtomicU32::new(0),
            peak: AtomicU32::new(0),
            delay: Duration::from_millis(delay_ms),
            outcome: MediationOutcome::success,
        }
    }

    fn with_outcome(delay_ms: u64, outcome: fn() -> MediationOutcome) -> Self {
        Self {
            outcome,
            ..Self::new(delay_ms)
        }
    }

    fn peak(&self) -> u32 {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Mediator for ConcurrencyProbe {
    async fn mediate(&self, _pointer: &MessagePointer, _target: &str) -> MediationOutcome {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        (self.outcome)()
    }
}

fn pool_config(code: &str, concurrency: u32, rate_limit: Option<u32>) -> PoolConfig {
    PoolConfig {
        code: code.to_string(),
        concurrency,
        rate_limit_per_minute: rate_limit,
        callback_url: Some("http://localhost:9/hook".to_string()),
        timeout_ms: None,
        retries: None,
    }
}

fn routed(id: &str, group: &str) -> (RoutedMessage, oneshot::Receiver<AckNack>) {
    let (ack_tx, ack_rx) = oneshot::channel();
    (
        RoutedMessage {
            pointer: MessagePointer {
                id: id.to_string(),
                pool_code: "TEST".to_string(),
                message_group_id: Some(group.to_string()),
                message_deduplication_id: None,
                payload: serde_json::json!({}),
                auth_token: None,
                signing_secret: None,
                callback_url: None,
                correlation_id: None,
                causation_id: None,
            },
            receipt_handle: format!("receipt-{id}"),
            broker_message_id: Some(format!("broker-{id}")),
            queue_identifier: "q".to_string(),
            batch_id: None,
            ack_tx,
        },
        ack_rx,
    )
}

#[tokio::test]
async fn concurrency_limit_is_enforced() {
    let probe = Arc::new(ConcurrencyProbe::new(50));
    let pool = ProcessPool::new(pool_config("TEST", 3, None), probe.clone());
    pool.start();

    let mut receivers = Vec::new();
    // Ten distinct groups so only the semaphore limits parallelism
    for i in 0..10 {
        let (msg, rx) = routed(&format!("m-{i}"), &format!("g-{i}"));
        pool.submit(msg).await.unwrap();
        receivers.push(rx);
    }

    for rx in receivers {
        let ack = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("completion within deadline")
            .expect("completion channel intact");
        assert!(matches!(ack, AckNack::Ack));
    }

    assert!(
        probe.peak() <= 3,
        "peak concurrency {} exceeded the limit of 3",
        probe.peak()
    );
}

#[tokio::test]
async fn one_mediation_in_flight_per_group() {
    let probe = Arc::new(ConcurrencyProbe::new(30));
    // Plenty of permits: the group serializer must be the limiter
    let pool = ProcessPool::new(pool_config("TEST", 20, None), probe.clone());
    pool.start();

    let mut receivers = Vec::new();
    for i in 0..6 {
        let (msg, rx) = routed(&format!("m-{i}"), "only-group");
        pool.submit(msg).await.unwrap();
        receivers.push(rx);
    }

    for rx in receivers {
        let _ = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap();
    }

    assert_eq!(probe.peak(), 1, "a single group must never mediate concurrently");
}

#[tokio::test]
async fn rate_limited_messages_are_deferred() {
    let probe = Arc::new(ConcurrencyProbe::new(0));
    // One token per minute: the second message in the window must defer
    let pool = ProcessPool::new(pool_config("TEST", 5, Some(1)), probe.clone());
    pool.start();

    let (first, first_rx) = routed("m-1", "g-1");
    let (second, second_rx) = routed("m-2", "g-2");
    pool.submit(first).await.unwrap();
    pool.submit(second).await.unwrap();

    let outcomes = [
        tokio::time::timeout(Duration::from_secs(5), first_rx).await.unwrap().unwrap(),
        tokio::time::timeout(Duration::from_secs(5), second_rx).await.unwrap().unwrap(),
    ];

    let acks = outcomes.iter().filter(|a| matches!(a, AckNack::Ack)).count();
    let defers = outcomes
        .iter()
        .filter(|a| matches!(a, AckNack::Defer { .. }))
        .count();
    assert_eq!(acks, 1, "exactly one message should pass the token bucket");
    assert_eq!(defers, 1, "the rate-limited message defers with a delay");

    let stats = pool.get_stats();
    assert_eq!(stats.total_rate_limited, 1);
}

#[tokio::test]
async fn deferred_outcome_defers_the_message() {
    let probe = Arc::new(ConcurrencyProbe::with_outcome(0, || {
        MediationOutcome::deferred(Some(30), 200)
    }));
    let pool = ProcessPool::new(pool_config("TEST", 2, None), probe);
    pool.start();

    let (msg, rx) = routed("m-1", "g-1");
    pool.submit(msg).await.unwrap();

    let ack = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
    match ack {
        AckNack::Defer { delay_seconds } => assert_eq!(delay_seconds, Some(30)),
        other => panic!("expected Defer, got {other:?}"),
    }
}

#[tokio::test]
async fn config_error_acks_terminally() {
    let probe = Arc::new(ConcurrencyProbe::with_outcome(0, || {
        MediationOutcome::error_config(404, "gone".to_string())
    }));
    let pool = ProcessPool::new(pool_config("TEST", 2, None), probe);
    pool.start();

    let (msg, rx) = routed("m-1", "g-1");
    pool.submit(msg).await.unwrap();

    let ack = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
    assert!(matches!(ack, AckNack::Ack), "4xx outcomes ack to stop redelivery");

    let stats = pool.get_stats();
    assert_eq!(stats.total_failed, 1);
}

#[tokio::test]
async fn concurrency_resize_in_place() {
    let probe = Arc::new(ConcurrencyProbe::new(20));
    let pool = ProcessPool::new(pool_config("TEST", 2, None), probe.clone());
    pool.start();

    assert!(pool.update_concurrency(6));
    assert_eq!(pool.concurrency(), 6);

    let mut receivers = Vec::new();
    for i in 0..12 {
        let (msg, rx) = routed(&format!("m-{i}"), &format!("g-{i}"));
        pool.submit(msg).await.unwrap();
        receivers.push(rx);
    }
    for rx in receivers {
        let _ = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap();
    }
    assert!(probe.peak() <= 6);
    assert!(probe.peak() > 2, "the raised limit should actually be used");

    // Decrease is rejected only at zero
    assert!(!pool.update_concurrency(0));
    assert!(pool.update_concurrency(1));
    assert_eq!(pool.concurrency(), 1);
}

#[tokio::test]
async fn drain_completes_in_flight_work() {
    let probe = Arc::new(ConcurrencyProbe::new(50));
    let pool = ProcessPool::new(pool_config("TEST", 2, None), probe.clone());
    pool.start();

    let mut receivers = Vec::new();
    for i in 0..4 {
        let (msg, rx) = routed(&format!("m-{i}"), &format!("g-{i}"));
        pool.submit(msg).await.unwrap();
        receivers.push(rx);
    }

    assert!(pool.drain_with_deadline(Duration::from_secs(5)).await);
    assert!(pool.is_fully_drained());

    for rx in receivers {
        let ack = rx.await.unwrap();
        assert!(matches!(ack, AckNack::Ack));
    }

    // New work is refused after the drain
    let (late, late_rx) = routed("late", "g-late");
    pool.submit(late).await.unwrap();
    assert!(matches!(late_rx.await.unwrap(), AckNack::Nack { .. }));
}
