//! Outbox processor: poller → buffer → distributor → group processors.
//!
//! The poller refuses to fetch unless the in-flight budget can absorb a
//! full batch, marks rows IN_PROGRESS before buffering them, and hands the
//! in-flight counter's release handle down to the group processors so
//! completed batches return their permits without the components holding
//! references to each other.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::buffer::{GlobalBuffer, GlobalBufferConfig};
use crate::dispatcher::BatchDispatcher;
use crate::distributor::{DistributorStats, GroupDistributor, GroupDistributorConfig};
use crate::group_processor::{GroupProcessorConfig, InFlightRelease};
use crate::recovery::{RecoveryConfig, RecoveryTask};
use crate::repository::OutboxRepository;
use rp_common::OutboxItemType;

#[derive(Debug, Clone)]
pub struct OutboxProcessorConfig {
    pub poll_interval: Duration,
    pub poll_batch_size: u32,
    pub api_batch_size: usize,
    pub max_concurrent_groups: usize,
    pub global_buffer_size: usize,
    pub max_in_flight: u64,
    pub processing_timeout: Duration,
    pub recovery_interval: Duration,
    pub group_idle_timeout_secs: u64,
}

impl Default for OutboxProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1_000),
            poll_batch_size: 100,
            api_batch_size: 50,
            max_concurrent_groups: 10,
            global_buffer_size: 1_000,
            max_in_flight: 5_000,
            processing_timeout: Duration::from_secs(600),
            recovery_interval: Duration::from_millis(60_000),
            group_idle_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessorMetrics {
    pub items_polled: u64,
    pub items_recovered: u64,
    pub buffer_rejections: u64,
    pub current_in_flight: u64,
    pub buffer_size: usize,
    pub active_groups: usize,
}

pub struct OutboxProcessor {
    config: OutboxProcessorConfig,
    repository: Arc<dyn OutboxRepository>,
    buffer: Arc<GlobalBuffer>,
    distributor: Arc<GroupDistributor>,
    recovery: Arc<RecoveryTask>,
    in_flight: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    is_primary: Arc<AtomicBool>,
    metrics: Arc<RwLock<ProcessorMetrics>>,
}

impl OutboxProcessor {
    pub fn new(
        config: OutboxProcessorConfig,
        repository: Arc<dyn OutboxRepository>,
        dispatcher: Arc<dyn BatchDispatcher>,
    ) -> Self {
        let in_flight = Arc::new(AtomicU64::new(0));
        let release = InFlightRelease::new(in_flight.clone());

        let buffer = Arc::new(GlobalBuffer::new(GlobalBufferConfig {
            max_size: config.global_buffer_size,
            drain_batch_size: config.api_batch_size,
        }));

        let distributor = Arc::new(GroupDistributor::new(
            GroupDistributorConfig {
                processor_config: GroupProcessorConfig {
                    api_batch_size: config.api_batch_size,
                },
                max_concurrent_groups: config.max_concurrent_groups,
                group_idle_timeout_secs: config.group_idle_timeout_secs,
            },
            dispatcher,
            repository.clone(),
            release,
        ));

        let recovery = Arc::new(RecoveryTask::new(
            repository.clone(),
            RecoveryConfig {
                enabled: true,
                check_interval: config.recovery_interval,
                processing_timeout: config.processing_timeout,
                sweep_limit: 1000,
            },
        ));

        Self {
            config,
            repository,
            buffer,
            distributor,
            recovery,
            in_flight,
            running: Arc::new(AtomicBool::new(false)),
            is_primary: Arc::new(AtomicBool::new(true)),
            metrics: Arc::new(RwLock::new(ProcessorMetrics::default())),
        }
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary.load(Ordering::SeqCst)
    }

    /// Leader election toggles this; only the primary polls.
    pub fn set_primary(&self, primary: bool) {
        let was = self.is_primary.swap(primary, Ordering::SeqCst);
        if was != primary {
            if primary {
                info!("Outbox processor became primary");
            } else {
                warn!("Outbox processor entering standby");
            }
        }
    }

    pub fn is_primary_flag(&self) -> Arc<AtomicBool> {
        self.is_primary.clone()
    }

    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub async fn metrics(&self) -> ProcessorMetrics {
        let mut metrics = self.metrics.read().await.clone();
        metrics.current_in_flight = self.in_flight_count();
        metrics.buffer_size = self.buffer.len().await;
        metrics.active_groups = self.distributor.stats().await.active_groups;
        metrics
    }

    pub async fn distributor_stats(&self) -> DistributorStats {
        self.distributor.stats().await
    }

    /// One poll cycle over all item types, gated by the in-flight budget.
    pub async fn poll_once(&self) -> anyhow::Result<()> {
        for item_type in OutboxItemType::ALL {
            let current = self.in_flight.load(Ordering::SeqCst);
            let available = self.config.max_in_flight.saturating_sub(current);

            // Only fetch when a whole batch fits; partial fetches would
            // starve the batch endpoints.
            if available < self.config.poll_batch_size as u64 {
                debug!(
                    item_type = %item_type,
                    in_flight = current,
                    "Skipping poll, insufficient in-flight budget"
                );
                continue;
            }

            let items = self
                .repository
                .fetch_pending(item_type, self.config.poll_batch_size)
                .await?;
            if items.is_empty() {
                continue;
            }

            // IN_PROGRESS before buffering: a crash between here and
            // dispatch is covered by the recovery sweep.
            let ids: Vec<String> = items.iter().map(|i| i.id.clone()).collect();
            self.repository.mark_in_progress(item_type, &ids).await?;
            self.in_flight.fetch_add(items.len() as u64, Ordering::SeqCst);

            {
                let mut m = self.metrics.write().await;
                m.items_polled += items.len() as u64;
            }

            let mut rejected = 0u64;
            for item in items {
                if self.buffer.push(item).await.is_err() {
                    // Rejected rows stay IN_PROGRESS; recovery returns them
                    // to PENDING, and their in-flight permit is released by
                    // the recovery accounting below.
                    rejected += 1;
                }
            }

            if rejected > 0 {
                warn!(
                    item_type = %item_type,
                    rejected = rejected,
                    "Global buffer rejected items, recovery will reclaim them"
                );
                self.in_flight.fetch_sub(rejected, Ordering::SeqCst);
                let mut m = self.metrics.write().await;
                m.buffer_rejections += rejected;
            }
        }

        Ok(())
    }

    /// Run until `stop`. Spawns the recovery, distribution, and group
    /// cleanup loops alongside the poller.
    pub async fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Outbox processor already running");
            return;
        }

        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            poll_batch_size = self.config.poll_batch_size,
            api_batch_size = self.config.api_batch_size,
            max_in_flight = self.config.max_in_flight,
            max_concurrent_groups = self.config.max_concurrent_groups,
            "Starting outbox processor"
        );

        // Startup recovery before the first poll
        let recovered = self.recovery.recover_once().await;
        if recovered > 0 {
            let mut m = self.metrics.write().await;
            m.items_recovered += recovered;
        }

        // Periodic recovery sweep
        let recovery_handle = {
            let recovery = self.recovery.clone();
            let running = self.running.clone();
            let is_primary = self.is_primary.clone();
            let metrics = self.metrics.clone();
            let interval = self.config.recovery_interval;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                while running.load(Ordering::SeqCst) {
                    ticker.tick().await;
                    if !is_primary.load(Ordering::SeqCst) {
                        continue;
                    }
                    let recovered = recovery.recover_once().await;
                    if recovered > 0 {
                        let mut m = metrics.write().await;
                        m.items_recovered += recovered;
                    }
                }
            })
        };

        // Buffer → distributor pump
        let distribution_handle = {
            let buffer = self.buffer.clone();
            let distributor = self.distributor.clone();
            let running = self.running.clone();

            tokio::spawn(async move {
                while running.load(Ordering::SeqCst) {
                    let batch = buffer.drain_batch().await;
                    if batch.is_empty() {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        continue;
                    }
                    for item in batch {
                        distributor.distribute(item).await;
                    }
                }
            })
        };

        // Idle group reaper
        let cleanup_handle = {
            let distributor = self.distributor.clone();
            let running = self.running.clone();

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(60));
                while running.load(Ordering::SeqCst) {
                    ticker.tick().await;
                    distributor.cleanup_idle_groups().await;
                }
            })
        };

        // Poll loop
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;

            if !self.is_primary() {
                debug!("Skipping poll, not primary");
                continue;
            }

            if let Err(e) = self.poll_once().await {
                error!(error = %e, "Outbox poll failed");
            }
        }

        info!("Outbox processor stopping");
        self.distributor.shutdown().await;
        recovery_handle.abort();
        distribution_handle.abort();
        cleanup_handle.abort();
        info!("Outbox processor stopped");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{DispatchPanic, OutboxDispatchResult};
    use crate::sqlite::SqliteOutboxRepository;
    use async_trait::async_trait;
    use chrono::Utc;
    use rp_common::{OutboxItem, OutboxStatus};
    use sqlx::sqlite::SqlitePoolOptions;

    struct AlwaysSuccess;

    #[async_trait]
    impl BatchDispatcher for AlwaysSuccess {
        async fn dispatch_batch(
            &self,
            _item_type: OutboxItemType,
            items: &[OutboxItem],
        ) -> Result<Vec<OutboxDispatchResult>, DispatchPanic> {
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

    fn pending_item(id: &str, group: Option<&str>) -> OutboxItem {
        OutboxItem {
            id: id.to_string(),
            item_type: OutboxItemType::Event,
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

    #[tokio::test]
    async fn poll_marks_in_progress_and_tracks_in_flight() {
        let repository = repo().await;
        for i in 0..5 {
            repository
                .insert_item(&pending_item(&format!("i-{i}"), Some("g")))
                .await
                .unwrap();
        }

        let processor = OutboxProcessor::new(
            OutboxProcessorConfig {
                poll_batch_size: 10,
                ..Default::default()
            },
            repository.clone(),
            Arc::new(AlwaysSuccess),
        );

        processor.poll_once().await.unwrap();

        assert_eq!(processor.in_flight_count(), 5);
        for i in 0..5 {
            let item = repository
                .get_item(OutboxItemType::Event, &format!("i-{i}"))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(item.status, OutboxStatus::InProgress);
        }
    }

    #[tokio::test]
    async fn capacity_gate_blocks_poll() {
        let repository = repo().await;
        repository.insert_item(&pending_item("i-1", None)).await.unwrap();

        let processor = OutboxProcessor::new(
            OutboxProcessorConfig {
                poll_batch_size: 10,
                max_in_flight: 5, // budget smaller than a batch
                ..Default::default()
            },
            repository.clone(),
            Arc::new(AlwaysSuccess),
        );

        processor.poll_once().await.unwrap();

        // Gate refused the fetch entirely
        assert_eq!(processor.in_flight_count(), 0);
        let item = repository
            .get_item(OutboxItemType::Event, "i-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.status, OutboxStatus::Pending);
    }
}
