//! Group distributor.
//!
//! Routes buffered items to their `(type, group)` processor, creating one
//! on first use. A shared semaphore caps how many groups can have a batch
//! in flight at once. Items without a group dispatch directly as a
//! singleton batch with no ordering guarantee.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, RwLock, Semaphore};
use tracing::{debug, info, warn};

use crate::dispatcher::BatchDispatcher;
use crate::group_processor::{
    GroupProcessorConfig, InFlightRelease, MessageGroupProcessor,
};
use crate::repository::OutboxRepository;
use rp_common::{OutboxItem, OutboxItemType, OutboxStatus};

#[derive(Debug, Clone)]
pub struct GroupDistributorConfig {
    pub processor_config: GroupProcessorConfig,
    pub max_concurrent_groups: usize,
    /// Processors idle past this many seconds are reaped.
    pub group_idle_timeout_secs: u64,
}

impl Default for GroupDistributorConfig {
    fn default() -> Self {
        Self {
            processor_config: GroupProcessorConfig::default(),
            max_concurrent_groups: 10,
            group_idle_timeout_secs: 300,
        }
    }
}

struct GroupEntry {
    processor: Arc<MessageGroupProcessor>,
    shutdown_tx: watch::Sender<bool>,
    last_activity: Instant,
}

#[derive(Debug, Clone, Default)]
pub struct DistributorStats {
    pub active_groups: usize,
    pub total_distributed: u64,
    pub direct_dispatched: u64,
}

pub struct GroupDistributor {
    config: GroupDistributorConfig,
    dispatcher: Arc<dyn BatchDispatcher>,
    repository: Arc<dyn OutboxRepository>,
    release: InFlightRelease,
    group_slots: Arc<Semaphore>,
    groups: RwLock<HashMap<String, GroupEntry>>,
    stats: parking_lot::Mutex<DistributorStats>,
}

impl GroupDistributor {
    pub fn new(
        config: GroupDistributorConfig,
        dispatcher: Arc<dyn BatchDispatcher>,
        repository: Arc<dyn OutboxRepository>,
        release: InFlightRelease,
    ) -> Self {
        let group_slots = Arc::new(Semaphore::new(config.max_concurrent_groups));
        Self {
            config,
            dispatcher,
            repository,
            release,
            group_slots,
            groups: RwLock::new(HashMap::new()),
            stats: parking_lot::Mutex::new(DistributorStats::default()),
        }
    }

    fn key_for(item: &OutboxItem) -> Option<String> {
        item.message_group
            .as_ref()
            .map(|group| format!("{}:{}", item.item_type, group))
    }

    pub async fn distribute(&self, item: OutboxItem) {
        match Self::key_for(&item) {
            Some(key) => {
                let processor = self.processor_for(&item.item_type, &key).await;
                processor.enqueue(item).await;
                self.stats.lock().total_distributed += 1;
            }
            None => {
                // No group, no ordering constraint
                self.dispatch_direct(item).await;
                let mut stats = self.stats.lock();
                stats.total_distributed += 1;
                stats.direct_dispatched += 1;
            }
        }
    }

    async fn processor_for(
        &self,
        item_type: &OutboxItemType,
        key: &str,
    ) -> Arc<MessageGroupProcessor> {
        {
            let mut groups = self.groups.write().await;
            if let Some(entry) = groups.get_mut(key) {
                entry.last_activity = Instant::now();
                return Arc::clone(&entry.processor);
            }

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let processor = Arc::new(MessageGroupProcessor::new(
                *item_type,
                key.to_string(),
                self.config.processor_config.clone(),
                Arc::clone(&self.dispatcher),
                Arc::clone(&self.repository),
                self.release.clone(),
                Arc::clone(&self.group_slots),
            ));

            tokio::spawn(Arc::clone(&processor).run(shutdown_rx));

            groups.insert(
                key.to_string(),
                GroupEntry {
                    processor: Arc::clone(&processor),
                    shutdown_tx,
                    last_activity: Instant::now(),
                },
            );

            info!(group = %key, "Created message group processor");
            processor
        }
    }

    async fn dispatch_direct(&self, item: OutboxItem) {
        let batch = [item];
        match self.dispatcher.dispatch_batch(batch[0].item_type, &batch).await {
            Ok(results) => {
                let item = &batch[0];
                let result = results.iter().find(|r| r.id == item.id);
                let (status, error) = match result {
                    Some(r) if r.status == OutboxStatus::Success => (OutboxStatus::Success, None),
                    Some(r) if r.status.is_retryable() && item.has_retry_budget() => {
                        let _ = self
                            .repository
                            .increment_retry(item.item_type, &[item.id.clone()])
                            .await;
                        self.release.release(1);
                        return;
                    }
                    Some(r) => {
                        let stored = if r.status == OutboxStatus::GatewayError {
                            OutboxStatus::InternalError
                        } else {
                            r.status
                        };
                        (stored, r.error_message.clone())
                    }
                    None => (
                        OutboxStatus::InternalError,
                        Some("missing result in batch response".to_string()),
                    ),
                };

                if let Err(e) = self
                    .repository
                    .mark_with_status(item.item_type, &[item.id.clone()], status, error.as_deref())
                    .await
                {
                    warn!(item_id = %item.id, error = %e, "Failed to store direct dispatch result");
                }
            }
            Err(e) => {
                let item = &batch[0];
                warn!(item_id = %item.id, error = %e, "Direct dispatch failed unexpectedly");
                if item.has_retry_budget() {
                    let _ = self
                        .repository
                        .increment_retry(item.item_type, &[item.id.clone()])
                        .await;
                } else {
                    let _ = self
                        .repository
                        .mark_with_status(
                            item.item_type,
                            &[item.id.clone()],
                            OutboxStatus::InternalError,
                            Some(&e.to_string()),
                        )
                        .await;
                }
            }
        }
        self.release.release(1);
    }

    /// Reap processors idle past the TTL with empty queues.
    pub async fn cleanup_idle_groups(&self) {
        let ttl = std::time::Duration::from_secs(self.config.group_idle_timeout_secs);
        let mut groups = self.groups.write().await;

        let mut to_remove = Vec::new();
        for (key, entry) in groups.iter() {
            if entry.last_activity.elapsed() > ttl && entry.processor.queue_depth().await == 0 {
                to_remove.push(key.clone());
            }
        }

        for key in to_remove {
            if let Some(entry) = groups.remove(&key) {
                let _ = entry.shutdown_tx.send(true);
                debug!(group = %key, "Reaped idle group processor");
            }
        }
    }

    pub async fn stats(&self) -> DistributorStats {
        let mut stats = self.stats.lock().clone();
        stats.active_groups = self.groups.read().await.len();
        stats
    }

    pub async fn active_groups(&self) -> Vec<String> {
        self.groups.read().await.keys().cloned().collect()
    }

    pub async fn shutdown(&self) {
        let mut groups = self.groups.write().await;
        for (key, entry) in groups.drain() {
            let _ = entry.shutdown_tx.send(true);
            debug!(group = %key, "Group processor shut down");
        }
        self.group_slots.close();
    }
}
