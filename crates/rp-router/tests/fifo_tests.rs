//! Ordering guarantees through the queue manager:
//! - same (pool, group): strict FIFO on enqueue order
//! - different groups: independent
//! - redeliveries are deferred, not reprocessed

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rp_common::{
    MediationOutcome, MessagePointer, PoolConfig, QueuedMessage, RouterTopology,
};
use rp_queue::{QueueConsumer, QueueError};
use rp_router::{Mediator, QueueManager};

struct OrderTrackingMediator {
    processed: parking_lot::Mutex<Vec<String>>,
    delay: Duration,
}

impl OrderTrackingMediator {
    fn new(delay_ms: u64) -> Self {
        Self {
            processed: parking_lot::Mutex::new(Vec::new()),
            delay: Duration::from_millis(delay_ms),
        }
    }

    fn processed_ids(&self) -> Vec<String> {
        self.processed.lock().clone()
    }
}

#[async_trait]
impl Mediator for OrderTrackingMediator {
    async fn mediate(&self, pointer: &MessagePointer, _target: &str) -> MediationOutcome {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.processed.lock().push(pointer.id.clone());
        MediationOutcome::success()
    }
}

struct TestConsumer {
    identifier: String,
    acked: parking_lot::Mutex<Vec<String>>,
    nacked: parking_lot::Mutex<Vec<(String, Option<u32>)>>,
    deferred: parking_lot::Mutex<Vec<String>>,
    running: AtomicBool,
}

impl TestConsumer {
    fn new(identifier: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            acked: parking_lot::Mutex::new(Vec::new()),
            nacked: parking_lot::Mutex::new(Vec::new()),
            deferred: parking_lot::Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl QueueConsumer for TestConsumer {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn poll(&self, _max: u32) -> rp_queue::Result<Vec<QueuedMessage>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }
        Ok(vec![])
    }

    async fn ack(&self, receipt_handle: &str) -> rp_queue::Result<()> {
        self.acked.lock().push(receipt_handle.to_string());
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str, delay: Option<u32>) -> rp_queue::Result<()> {
        self.nacked.lock().push((receipt_handle.to_string(), delay));
        Ok(())
    }

    async fn defer(&self, receipt_handle: &str, _delay: Option<u32>) -> rp_queue::Result<()> {
        self.deferred.lock().push(receipt_handle.to_string());
        Ok(())
    }

    async fn extend_visibility(&self, _receipt_handle: &str, _seconds: u32) -> rp_queue::Result<()> {
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn queued(id: &str, pool: &str, group: Option<&str>) -> QueuedMessage {
    QueuedMessage {
        pointer: MessagePointer {
            id: id.to_string(),
            pool_code: pool.to_string(),
            message_group_id: group.map(String::from),
            message_deduplication_id: None,
            payload: serde_json::json!({"id": id}),
            auth_token: None,
            signing_secret: None,
            callback_url: Some("http://localhost:9/unused".to_string()),
            correlation_id: None,
            causation_id: None,
        },
        receipt_handle: format!("receipt-{id}"),
        broker_message_id: Some(format!("broker-{id}")),
        queue_identifier: "test-queue".to_string(),
        receive_count: 1,
    }
}

async fn manager_with_pool(
    mediator: Arc<dyn Mediator>,
    concurrency: u32,
) -> Arc<QueueManager> {
    let manager = Arc::new(QueueManager::new(mediator));
    manager
        .apply_config(RouterTopology {
            processing_pools: vec![PoolConfig {
                code: "DEFAULT".to_string(),
                concurrency,
                rate_limit_per_minute: None,
                callback_url: Some("http://localhost:9/unused".to_string()),
                timeout_ms: None,
                retries: None,
            }],
            queues: vec![],
        })
        .await
        .unwrap();
    manager
}

async fn wait_for(mut check: impl FnMut() -> bool, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn same_group_is_processed_in_enqueue_order() {
    let mediator = Arc::new(OrderTrackingMediator::new(20));
    let manager = manager_with_pool(mediator.clone(), 5).await;
    let consumer = Arc::new(TestConsumer::new("test-queue"));

    let messages: Vec<QueuedMessage> = (1..=6)
        .map(|i| queued(&format!("m-{i}"), "DEFAULT", Some("group-a")))
        .collect();

    manager.route_batch(messages, consumer.clone()).await.unwrap();

    assert!(
        wait_for(|| mediator.processed_ids().len() == 6, Duration::from_secs(5)).await,
        "all six messages should complete"
    );

    let expected: Vec<String> = (1..=6).map(|i| format!("m-{i}")).collect();
    assert_eq!(mediator.processed_ids(), expected);

    assert!(
        wait_for(|| consumer.acked.lock().len() == 6, Duration::from_secs(2)).await,
        "all six messages should be acked"
    );
}

#[tokio::test]
async fn different_groups_all_complete() {
    let mediator = Arc::new(OrderTrackingMediator::new(10));
    let manager = manager_with_pool(mediator.clone(), 5).await;
    let consumer = Arc::new(TestConsumer::new("test-queue"));

    let mut messages = Vec::new();
    for group in ["g-1", "g-2", "g-3"] {
        for i in 1..=3 {
            messages.push(queued(&format!("{group}-m-{i}"), "DEFAULT", Some(group)));
        }
    }

    manager.route_batch(messages, consumer.clone()).await.unwrap();

    assert!(
        wait_for(|| mediator.processed_ids().len() == 9, Duration::from_secs(5)).await,
        "all nine messages should complete"
    );

    // Each group individually preserves order
    let processed = mediator.processed_ids();
    for group in ["g-1", "g-2", "g-3"] {
        let in_group: Vec<&String> = processed.iter().filter(|id| id.starts_with(group)).collect();
        let expected: Vec<String> = (1..=3).map(|i| format!("{group}-m-{i}")).collect();
        assert_eq!(in_group, expected.iter().collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn redelivery_of_in_flight_message_is_deferred() {
    // A mediator slow enough that the original is still in flight when the
    // redelivery arrives
    let mediator = Arc::new(OrderTrackingMediator::new(300));
    let manager = manager_with_pool(mediator.clone(), 5).await;
    let consumer = Arc::new(TestConsumer::new("test-queue"));

    manager
        .route_batch(vec![queued("m-1", "DEFAULT", Some("g"))], consumer.clone())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Same broker message id arrives again with a fresh receipt handle
    let mut redelivery = queued("m-1", "DEFAULT", Some("g"));
    redelivery.receipt_handle = "receipt-m-1-redelivered".to_string();
    manager
        .route_batch(vec![redelivery], consumer.clone())
        .await
        .unwrap();

    assert!(
        wait_for(|| !consumer.deferred.lock().is_empty(), Duration::from_secs(2)).await,
        "the redelivery should be deferred"
    );

    assert!(
        wait_for(|| mediator.processed_ids().len() == 1, Duration::from_secs(2)).await,
        "only the original should be processed"
    );
    assert_eq!(mediator.processed_ids(), vec!["m-1".to_string()]);
}

#[tokio::test]
async fn requeued_duplicate_is_acked() {
    let mediator = Arc::new(OrderTrackingMediator::new(300));
    let manager = manager_with_pool(mediator.clone(), 5).await;
    let consumer = Arc::new(TestConsumer::new("test-queue"));

    manager
        .route_batch(vec![queued("m-1", "DEFAULT", None)], consumer.clone())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Same application id on a different broker message
    let mut requeued = queued("m-1", "DEFAULT", None);
    requeued.broker_message_id = Some("broker-other".to_string());
    requeued.receipt_handle = "receipt-requeued".to_string();
    manager.route_batch(vec![requeued], consumer.clone()).await.unwrap();

    assert!(
        wait_for(
            || consumer.acked.lock().contains(&"receipt-requeued".to_string()),
            Duration::from_secs(2)
        )
        .await,
        "the requeued duplicate should be acked away"
    );
    assert!(
        wait_for(|| mediator.processed_ids().len() == 1, Duration::from_secs(2)).await
    );
}
