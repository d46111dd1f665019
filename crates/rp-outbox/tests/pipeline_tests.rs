//! End-to-end outbox pipeline: rows in customer tables flow through the
//! poller, buffer, distributor, and group processors to terminal statuses.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use std::time::Duration;

use rp_common::{OutboxItem, OutboxItemType, OutboxStatus};
use rp_outbox::sqlite::SqliteOutboxRepository;
use rp_outbox::{
    BatchDispatcher, DispatchPanic, OutboxDispatchResult, OutboxProcessor, OutboxProcessorConfig,
    OutboxRepository,
};

/// Succeeds everything and records batch compositions per group.
struct RecordingDispatcher {
    batches: parking_lot::Mutex<Vec<(OutboxItemType, Vec<String>)>>,
}

impl RecordingDispatcher {
    fn new() -> Self {
        Self {
            batches: parking_lot::Mutex::new(Vec::new()),
        }
    }

    fn batches(&self) -> Vec<(OutboxItemType, Vec<String>)> {
        self.batches.lock().clone()
    }
}

#[async_trait]
impl BatchDispatcher for RecordingDispatcher {
    async fn dispatch_batch(
        &self,
        item_type: OutboxItemType,
        items: &[OutboxItem],
    ) -> Result<Vec<OutboxDispatchResult>, DispatchPanic> {
        self.batches
            .lock()
            .push((item_type, items.iter().map(|i| i.id.clone()).collect()));

        Ok(items
            .iter()
            .map(|i| OutboxDispatchResult {
                id: i.id.clone(),
                status: OutboxStatus::Success,
                error_message: None,
            })
            .collect())
    }
}

async fn repo() -> Arc<SqliteOutboxRepository> {
    let pool = SqlitePoolOptions::new()
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let repository = Arc::new(SqliteOutboxRepository::new(pool));
    repository.init_schema().await.unwrap();
    repository
}

fn item(id: &str, item_type: OutboxItemType, group: Option<&str>) -> OutboxItem {
    OutboxItem {
        id: id.to_string(),
        item_type,
        message_group: group.map(String::from),
        payload: serde_json::json!({"id": id}),
        status: OutboxStatus::Pending,
        retry_count: 0,
        max_retries: 3,
        error_message: None,
        created_at: Utc::now(),
        updated_at: None,
    }
}

async fn wait_for_status(
    repository: &SqliteOutboxRepository,
    item_type: OutboxItemType,
    id: &str,
    status: OutboxStatus,
    timeout: Duration,
) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if let Ok(Some(stored)) = repository.get_item(item_type, id).await {
            if stored.status == status {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

#[tokio::test]
async fn items_flow_to_success_across_types_and_groups() {
    let repository = repo().await;
    let dispatcher = Arc::new(RecordingDispatcher::new());

    for i in 0..4 {
        repository
            .insert_item(&item(&format!("ev-{i}"), OutboxItemType::Event, Some("g-1")))
            .await
            .unwrap();
    }
    for i in 0..3 {
        repository
            .insert_item(&item(&format!("job-{i}"), OutboxItemType::DispatchJob, Some("g-2")))
            .await
            .unwrap();
    }
    repository
        .insert_item(&item("audit-0", OutboxItemType::AuditLog, None))
        .await
        .unwrap();

    let processor = Arc::new(OutboxProcessor::new(
        OutboxProcessorConfig {
            poll_interval: Duration::from_millis(50),
            poll_batch_size: 10,
            api_batch_size: 10,
            recovery_interval: Duration::from_secs(60),
            ..Default::default()
        },
        repository.clone(),
        dispatcher.clone(),
    ));

    let runner = tokio::spawn(processor.clone().start());

    assert!(
        wait_for_status(&repository, OutboxItemType::Event, "ev-3", OutboxStatus::Success, Duration::from_secs(5)).await
    );
    assert!(
        wait_for_status(&repository, OutboxItemType::DispatchJob, "job-2", OutboxStatus::Success, Duration::from_secs(5)).await
    );
    assert!(
        wait_for_status(&repository, OutboxItemType::AuditLog, "audit-0", OutboxStatus::Success, Duration::from_secs(5)).await
    );

    // All permits returned once everything is terminal
    let start = std::time::Instant::now();
    while processor.in_flight_count() > 0 && start.elapsed() < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(processor.in_flight_count(), 0);

    // No batch ever mixed item types
    for (item_type, ids) in dispatcher.batches() {
        match item_type {
            OutboxItemType::Event => assert!(ids.iter().all(|id| id.starts_with("ev-"))),
            OutboxItemType::DispatchJob => assert!(ids.iter().all(|id| id.starts_with("job-"))),
            OutboxItemType::AuditLog => assert!(ids.iter().all(|id| id.starts_with("audit-"))),
        }
    }

    processor.stop();
    let _ = tokio::time::timeout(Duration::from_secs(5), runner).await;
}

#[tokio::test]
async fn grouped_items_stay_in_enqueue_order_within_batches() {
    let repository = repo().await;
    let dispatcher = Arc::new(RecordingDispatcher::new());

    // Fixed created_at spacing keeps (group, created_at) ordering stable
    for i in 0..6 {
        let mut it = item(&format!("ev-{i}"), OutboxItemType::Event, Some("orders"));
        it.created_at = Utc::now() - chrono::Duration::seconds(60 - i);
        repository.insert_item(&it).await.unwrap();
    }

    let processor = Arc::new(OutboxProcessor::new(
        OutboxProcessorConfig {
            poll_interval: Duration::from_millis(50),
            poll_batch_size: 10,
            api_batch_size: 10,
            ..Default::default()
        },
        repository.clone(),
        dispatcher.clone(),
    ));

    let runner = tokio::spawn(processor.clone().start());

    assert!(
        wait_for_status(&repository, OutboxItemType::Event, "ev-5", OutboxStatus::Success, Duration::from_secs(5)).await
    );

    // Concatenated batch contents preserve the insertion order
    let dispatched: Vec<String> = dispatcher
        .batches()
        .into_iter()
        .flat_map(|(_, ids)| ids)
        .collect();
    let expected: Vec<String> = (0..6).map(|i| format!("ev-{i}")).collect();
    assert_eq!(dispatched, expected);

    processor.stop();
    let _ = tokio::time::timeout(Duration::from_secs(5), runner).await;
}
