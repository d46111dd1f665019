//! Per-(type, group) processor.
//!
//! Drains up to `api_batch_size` items per cycle in enqueue order and
//! keeps at most one batch in flight per group. Batch outcomes drive the
//! status transitions:
//!
//! - success-listed items → SUCCESS
//! - INTERNAL_ERROR / GATEWAY_ERROR / UNAUTHORIZED with retry budget →
//!   retry_count+1 and back to PENDING
//! - exhausted or terminal → stored with the terminal status
//!   (GATEWAY_ERROR collapses to INTERNAL_ERROR on exhaustion)
//! - an unexpected dispatch exception splits the batch by retry budget
//!
//! Every completed batch releases its size back to the poller's in-flight
//! budget through the narrow release handle.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, Semaphore};
use tracing::{debug, error, info, warn};

use crate::dispatcher::{BatchDispatcher, OutboxDispatchResult};
use crate::repository::OutboxRepository;
use rp_common::{OutboxItem, OutboxItemType, OutboxStatus};

/// Releases in-flight permits back to the poller. Cloned down the pipeline
/// instead of wiring the components to each other.
#[derive(Clone)]
pub struct InFlightRelease {
    counter: Arc<AtomicU64>,
}

impl InFlightRelease {
    pub fn new(counter: Arc<AtomicU64>) -> Self {
        Self { counter }
    }

    pub fn release(&self, count: u64) {
        let mut current = self.counter.load(Ordering::SeqCst);
        loop {
            let next = current.saturating_sub(count);
            match self.counter.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct GroupProcessorConfig {
    pub api_batch_size: usize,
}

impl Default for GroupProcessorConfig {
    fn default() -> Self {
        Self { api_batch_size: 50 }
    }
}

pub struct MessageGroupProcessor {
    item_type: OutboxItemType,
    group_key: String,
    config: GroupProcessorConfig,
    queue: Mutex<VecDeque<OutboxItem>>,
    wakeup: Notify,
    dispatcher: Arc<dyn BatchDispatcher>,
    repository: Arc<dyn OutboxRepository>,
    release: InFlightRelease,
    /// Caps concurrently active groups across the whole distributor.
    group_slots: Arc<Semaphore>,
}

impl MessageGroupProcessor {
    pub fn new(
        item_type: OutboxItemType,
        group_key: String,
        config: GroupProcessorConfig,
        dispatcher: Arc<dyn BatchDispatcher>,
        repository: Arc<dyn OutboxRepository>,
        release: InFlightRelease,
        group_slots: Arc<Semaphore>,
    ) -> Self {
        Self {
            item_type,
            group_key,
            config,
            queue: Mutex::new(VecDeque::new()),
            wakeup: Notify::new(),
            dispatcher,
            repository,
            release,
            group_slots,
        }
    }

    pub fn group_key(&self) -> &str {
        &self.group_key
    }

    pub async fn enqueue(&self, item: OutboxItem) {
        self.queue.lock().await.push_back(item);
        self.wakeup.notify_one();
    }

    pub async fn queue_depth(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Run one batch cycle if there is queued work. Returns the batch size
    /// processed (0 when idle).
    pub async fn process_one_batch(&self) -> usize {
        let batch: Vec<OutboxItem> = {
            let mut queue = self.queue.lock().await;
            let count = queue.len().min(self.config.api_batch_size);
            if count == 0 {
                return 0;
            }
            queue.drain(..count).collect()
        };
        let batch_size = batch.len();

        // One active batch per group; the semaphore also caps how many
        // groups are mid-batch at once.
        let _slot = match self.group_slots.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                // Shutdown: items stay IN_PROGRESS and recover later.
                self.release.release(batch_size as u64);
                return 0;
            }
        };

        debug!(
            group = %self.group_key,
            count = batch_size,
            "Dispatching outbox batch"
        );

        match self.dispatcher.dispatch_batch(self.item_type, &batch).await {
            Ok(results) => self.apply_results(&batch, results).await,
            Err(e) => self.apply_exception(&batch, &e.to_string()).await,
        }

        // Success or failure, the poller gets its permits back.
        self.release.release(batch_size as u64);
        batch_size
    }

    async fn apply_results(&self, batch: &[OutboxItem], results: Vec<OutboxDispatchResult>) {
        let mut succeeded: Vec<String> = Vec::new();
        let mut to_retry: Vec<String> = Vec::new();
        // (id, terminal status, error)
        let mut terminal: Vec<(String, OutboxStatus, Option<String>)> = Vec::new();

        for item in batch {
            let result = results.iter().find(|r| r.id == item.id);

            match result {
                Some(r) if r.status == OutboxStatus::Success => succeeded.push(item.id.clone()),
                Some(r) if r.status.is_retryable() => {
                    if item.has_retry_budget() {
                        to_retry.push(item.id.clone());
                    } else {
                        // Exhausted: gateway errors collapse into the
                        // generic server-error terminal status.
                        let stored = if r.status == OutboxStatus::GatewayError {
                            OutboxStatus::InternalError
                        } else {
                            r.status
                        };
                        terminal.push((item.id.clone(), stored, r.error_message.clone()));
                    }
                }
                Some(r) => terminal.push((item.id.clone(), r.status, r.error_message.clone())),
                None => {
                    // The platform did not answer for this id; treat as a
                    // server error within the retry budget.
                    if item.has_retry_budget() {
                        to_retry.push(item.id.clone());
                    } else {
                        terminal.push((
                            item.id.clone(),
                            OutboxStatus::InternalError,
                            Some("missing result in batch response".to_string()),
                        ));
                    }
                }
            }
        }

        if !succeeded.is_empty() {
            if let Err(e) = self
                .repository
                .mark_with_status(self.item_type, &succeeded, OutboxStatus::Success, None)
                .await
            {
                error!(group = %self.group_key, error = %e, "Failed to mark successes");
            }
        }

        if !to_retry.is_empty() {
            debug!(group = %self.group_key, count = to_retry.len(), "Re-queueing for retry");
            if let Err(e) = self.repository.increment_retry(self.item_type, &to_retry).await {
                error!(group = %self.group_key, error = %e, "Failed to increment retries");
            }
        }

        for (id, status, error_message) in terminal {
            warn!(
                group = %self.group_key,
                item_id = %id,
                status = ?status,
                "Outbox item reached terminal status"
            );
            if let Err(e) = self
                .repository
                .mark_with_status(self.item_type, &[id], status, error_message.as_deref())
                .await
            {
                error!(group = %self.group_key, error = %e, "Failed to mark terminal status");
            }
        }
    }

    /// An unexpected exception mid-dispatch: split the batch by retry
    /// budget.
    async fn apply_exception(&self, batch: &[OutboxItem], message: &str) {
        error!(group = %self.group_key, error = %message, "Unexpected dispatch failure");

        let (retryable, exhausted): (Vec<&OutboxItem>, Vec<&OutboxItem>) =
            batch.iter().partition(|i| i.has_retry_budget());

        let retry_ids: Vec<String> = retryable.iter().map(|i| i.id.clone()).collect();
        if !retry_ids.is_empty() {
            if let Err(e) = self.repository.increment_retry(self.item_type, &retry_ids).await {
                error!(error = %e, "Failed to re-queue retryable items after exception");
            }
        }

        let exhausted_ids: Vec<String> = exhausted.iter().map(|i| i.id.clone()).collect();
        if !exhausted_ids.is_empty() {
            if let Err(e) = self
                .repository
                .mark_with_status(
                    self.item_type,
                    &exhausted_ids,
                    OutboxStatus::InternalError,
                    Some(message),
                )
                .await
            {
                error!(error = %e, "Failed to mark exhausted items after exception");
            }
        }
    }

    /// Serial loop: one batch at a time until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(group = %self.group_key, "Group processor started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let processed = self.process_one_batch().await;
            if processed == 0 {
                tokio::select! {
                    _ = self.wakeup.notified() => {}
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(std::time::Duration::from_millis(200)) => {}
                }
            }
        }

        info!(group = %self.group_key, "Group processor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatchPanic;
    use crate::sqlite::SqliteOutboxRepository;
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex as PlMutex;
    use sqlx::sqlite::SqlitePoolOptions;

    fn item(id: &str, retry_count: i32, max_retries: i32) -> OutboxItem {
        OutboxItem {
            id: id.to_string(),
            item_type: OutboxItemType::Event,
            message_group: Some("g".to_string()),
            payload: serde_json::json!({"id": id}),
            status: OutboxStatus::InProgress,
            retry_count,
            max_retries,
            error_message: None,
            created_at: Utc::now(),
            updated_at: Some(Utc::now()),
        }
    }

    /// Scripted dispatcher: pops the next canned response per call.
    struct ScriptedDispatcher {
        script: PlMutex<Vec<Result<OutboxStatus, String>>>,
    }

    #[async_trait]
    impl BatchDispatcher for ScriptedDispatcher {
        async fn dispatch_batch(
            &self,
            _item_type: OutboxItemType,
            items: &[OutboxItem],
        ) -> Result<Vec<OutboxDispatchResult>, DispatchPanic> {
            let step = self.script.lock().remove(0);
            match step {
                Ok(status) => Ok(items
                    .iter()
                    .map(|i| OutboxDispatchResult {
                        id: i.id.clone(),
                        status,
                        error_message: if status == OutboxStatus::Success {
                            None
                        } else {
                            Some(format!("scripted {status:?}"))
                        },
                    })
                    .collect()),
                Err(e) => Err(DispatchPanic(e)),
            }
        }
    }

    async fn setup(
        script: Vec<Result<OutboxStatus, String>>,
    ) -> (Arc<MessageGroupProcessor>, Arc<SqliteOutboxRepository>, Arc<AtomicU64>) {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let repository = Arc::new(SqliteOutboxRepository::new(pool));
        repository.init_schema().await.unwrap();

        let in_flight = Arc::new(AtomicU64::new(0));
        let processor = Arc::new(MessageGroupProcessor::new(
            OutboxItemType::Event,
            "EVENT:g".to_string(),
            GroupProcessorConfig::default(),
            Arc::new(ScriptedDispatcher {
                script: PlMutex::new(script),
            }),
            repository.clone(),
            InFlightRelease::new(in_flight.clone()),
            Arc::new(Semaphore::new(10)),
        ));

        (processor, repository, in_flight)
    }

    #[tokio::test]
    async fn success_marks_items() {
        let (processor, repository, in_flight) = setup(vec![Ok(OutboxStatus::Success)]).await;

        let i = item("i-1", 0, 3);
        repository.insert_item(&i).await.unwrap();
        in_flight.fetch_add(1, Ordering::SeqCst);
        processor.enqueue(i).await;

        assert_eq!(processor.process_one_batch().await, 1);

        let stored = repository
            .get_item(OutboxItemType::Event, "i-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, OutboxStatus::Success);
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn retry_cycle_then_terminal_internal_error() {
        // 500-class answers until the budget runs out; the final gateway
        // error collapses to INTERNAL_ERROR.
        let (processor, repository, in_flight) = setup(vec![
            Ok(OutboxStatus::InternalError),
            Ok(OutboxStatus::GatewayError),
            Ok(OutboxStatus::GatewayError),
            Ok(OutboxStatus::GatewayError),
        ])
        .await;

        let mut current = item("i-42", 0, 3);
        repository.insert_item(&current).await.unwrap();

        for expected_retry in 1..=3 {
            in_flight.fetch_add(1, Ordering::SeqCst);
            processor.enqueue(current.clone()).await;
            processor.process_one_batch().await;

            current = repository
                .get_item(OutboxItemType::Event, "i-42")
                .await
                .unwrap()
                .unwrap();
            assert_eq!(current.status, OutboxStatus::Pending);
            assert_eq!(current.retry_count, expected_retry);
        }

        // Fourth attempt exceeds the budget
        in_flight.fetch_add(1, Ordering::SeqCst);
        processor.enqueue(current.clone()).await;
        processor.process_one_batch().await;

        let stored = repository
            .get_item(OutboxItemType::Event, "i-42")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, OutboxStatus::InternalError);
        assert_eq!(stored.retry_count, 3);
        assert!(stored.error_message.is_some());
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unauthorized_retries_within_budget_then_sticks() {
        let (processor, repository, in_flight) = setup(vec![
            Ok(OutboxStatus::Unauthorized),
            Ok(OutboxStatus::Unauthorized),
        ])
        .await;

        let first = item("i-7", 0, 1);
        repository.insert_item(&first).await.unwrap();
        in_flight.fetch_add(1, Ordering::SeqCst);
        processor.enqueue(first).await;
        processor.process_one_batch().await;

        let after_retry = repository
            .get_item(OutboxItemType::Event, "i-7")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after_retry.status, OutboxStatus::Pending);
        assert_eq!(after_retry.retry_count, 1);

        in_flight.fetch_add(1, Ordering::SeqCst);
        processor.enqueue(after_retry).await;
        processor.process_one_batch().await;

        let stored = repository
            .get_item(OutboxItemType::Event, "i-7")
            .await
            .unwrap()
            .unwrap();
        // Exhausted UNAUTHORIZED stays UNAUTHORIZED
        assert_eq!(stored.status, OutboxStatus::Unauthorized);
    }

    #[tokio::test]
    async fn bad_request_is_terminal_immediately() {
        let (processor, repository, in_flight) = setup(vec![Ok(OutboxStatus::BadRequest)]).await;

        let i = item("i-9", 0, 3);
        repository.insert_item(&i).await.unwrap();
        in_flight.fetch_add(1, Ordering::SeqCst);
        processor.enqueue(i).await;
        processor.process_one_batch().await;

        let stored = repository
            .get_item(OutboxItemType::Event, "i-9")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, OutboxStatus::BadRequest);
        assert_eq!(stored.retry_count, 0);
    }

    #[tokio::test]
    async fn exception_splits_batch_by_retry_budget() {
        let (processor, repository, in_flight) =
            setup(vec![Err("connection reset".to_string())]).await;

        let fresh = item("i-fresh", 0, 3);
        let spent = item("i-spent", 3, 3);
        repository.insert_item(&fresh).await.unwrap();
        repository.insert_item(&spent).await.unwrap();
        in_flight.fetch_add(2, Ordering::SeqCst);
        processor.enqueue(fresh).await;
        processor.enqueue(spent).await;

        processor.process_one_batch().await;

        let fresh_stored = repository
            .get_item(OutboxItemType::Event, "i-fresh")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fresh_stored.status, OutboxStatus::Pending);
        assert_eq!(fresh_stored.retry_count, 1);

        let spent_stored = repository
            .get_item(OutboxItemType::Event, "i-spent")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(spent_stored.status, OutboxStatus::InternalError);
        assert_eq!(
            spent_stored.error_message.as_deref(),
            Some("dispatch failed unexpectedly: connection reset")
        );

        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    }
}
