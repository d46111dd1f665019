//! Embedded queue exercised through the broker traits, the way the router
//! uses it, including file-backed durability across reopen.

use std::sync::Arc;
use std::time::Duration;

use rp_common::MessagePointer;
use rp_queue::embedded::{EmbeddedQueueConfig, EmbeddedQueueEngine};
use rp_queue::{QueueConsumer, QueuePublisher};

fn pointer(id: &str, group: Option<&str>) -> MessagePointer {
    MessagePointer {
        id: id.to_string(),
        pool_code: "DEFAULT".to_string(),
        message_group_id: group.map(String::from),
        message_deduplication_id: None,
        payload: serde_json::json!({"id": id}),
        auth_token: None,
        signing_secret: None,
        callback_url: Some("http://localhost:8080/hook".to_string()),
        correlation_id: None,
        causation_id: None,
    }
}

async fn in_memory() -> Arc<EmbeddedQueueEngine> {
    EmbeddedQueueEngine::open(EmbeddedQueueConfig {
        queue_name: "broker-test".to_string(),
        ..Default::default()
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn trait_level_publish_poll_ack_cycle() {
    let engine = in_memory().await;
    let publisher: Arc<dyn QueuePublisher> = engine.clone();
    let consumer: Arc<dyn QueueConsumer + Send + Sync> = engine.clone();

    let id = publisher.publish(pointer("m-1", Some("g"))).await.unwrap();
    assert_eq!(id, "m-1");

    let batch = consumer.poll(10).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].pointer.id, "m-1");
    assert_eq!(batch[0].queue_identifier, "broker-test");
    assert_eq!(batch[0].receive_count, 1);

    consumer.ack(&batch[0].receipt_handle).await.unwrap();

    let metrics = consumer.get_metrics().await.unwrap().unwrap();
    assert_eq!(metrics.pending_messages, 0);
    assert_eq!(metrics.in_flight_messages, 0);
    assert_eq!(metrics.total_polled, 1);
    assert_eq!(metrics.total_acked, 1);
}

#[tokio::test]
async fn defer_is_not_counted_as_a_failure() {
    let engine = in_memory().await;

    engine.publish(pointer("m-1", None)).await.unwrap();
    let batch = engine.poll(10).await.unwrap();

    engine.defer(&batch[0].receipt_handle, Some(0)).await.unwrap();

    let metrics = engine.get_metrics().await.unwrap().unwrap();
    assert_eq!(metrics.total_deferred, 1);
    assert_eq!(metrics.total_nacked, 0);

    // Deferred message comes back
    let redelivered = engine.poll(10).await.unwrap();
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].receive_count, 2);
}

#[tokio::test]
async fn publish_batch_preserves_insertion_order() {
    let engine = in_memory().await;

    let ids = engine
        .publish_batch(vec![
            pointer("m-1", Some("g")),
            pointer("m-2", Some("g")),
            pointer("m-3", Some("g")),
        ])
        .await
        .unwrap();
    assert_eq!(ids, vec!["m-1", "m-2", "m-3"]);

    // One per group per batch: drain the group serially
    for expected in ["m-1", "m-2", "m-3"] {
        let batch = engine.poll(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].pointer.id, expected);
        engine.ack(&batch[0].receipt_handle).await.unwrap();
    }
}

#[tokio::test]
async fn file_backed_queue_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("queue.db").to_string_lossy().to_string();

    let config = EmbeddedQueueConfig {
        queue_name: "durable".to_string(),
        db_path: Some(db_path.clone()),
        visibility_timeout: Duration::from_secs(30),
        dedup_window: Duration::from_secs(300),
        checkpoint_interval: Duration::from_secs(10),
    };

    {
        let engine = EmbeddedQueueEngine::open(config.clone()).await.unwrap();
        engine.publish(pointer("m-durable", None)).await.unwrap();
        engine.close().await;
    }

    let reopened = EmbeddedQueueEngine::open(config).await.unwrap();
    let batch = reopened.poll(10).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].pointer.id, "m-durable");
}

#[tokio::test]
async fn stopped_consumer_refuses_to_poll() {
    let engine = in_memory().await;
    engine.stop().await;
    assert!(engine.poll(10).await.is_err());
    assert!(!engine.is_healthy());
}
