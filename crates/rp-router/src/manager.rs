//! Queue manager: binds broker consumers to processing pools and drives
//! their lifecycle.
//!
//! Owns the poll loops, deduplicates broker redeliveries against the
//! in-pipeline map, routes batches to pools grouped by (pool, group), and
//! reconciles configuration changes without touching unaffected
//! components.

use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock as SyncRwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::RouterError;
use crate::health::HealthService;
use crate::mediator::Mediator;
use crate::pool::ProcessPool;
use crate::warning::WarningService;
use crate::Result;
use rp_common::{
    AckNack, InFlightMessage, PoolConfig, QueueBinding, QueuedMessage, RoutedMessage,
    RouterTopology, WarningCategory, WarningSeverity,
};
use rp_queue::{QueueConsumer, QueueMetrics};

const DEFAULT_POOL_CODE: &str = "DEFAULT";
const DEFAULT_POOL_CONCURRENCY: u32 = 20;
const DEFAULT_GROUP_KEY: &str = "__DEFAULT__";
/// In-pipeline map size above which a leak warning fires.
const PIPELINE_LEAK_THRESHOLD: usize = 10_000;

/// Creates consumers for queue bindings during config reconciliation.
#[async_trait::async_trait]
pub trait ConsumerFactory: Send + Sync {
    async fn create_consumer(
        &self,
        binding: &QueueBinding,
    ) -> Result<Arc<dyn QueueConsumer + Send + Sync>>;
}

#[derive(Debug, Clone)]
pub struct QueueManagerConfig {
    pub max_pools: usize,
    pub pool_warning_threshold: usize,
    /// Bounded drain on shutdown; in-flight work is nacked afterwards.
    pub drain_deadline: Duration,
    pub drain_grace: Duration,
}

impl Default for QueueManagerConfig {
    fn default() -> Self {
        Self {
            max_pools: 2000,
            pool_warning_threshold: 1000,
            drain_deadline: Duration::from_secs(30),
            drain_grace: Duration::from_secs(15),
        }
    }
}

pub struct QueueManager {
    config: QueueManagerConfig,

    /// pipeline key (broker message id) → in-flight record
    in_pipeline: Arc<DashMap<String, InFlightMessage>>,
    /// application message id → pipeline key, for requeue detection
    app_to_pipeline: Arc<DashMap<String, String>>,

    pools: DashMap<String, Arc<ProcessPool>>,
    draining_pools: DashMap<String, Arc<ProcessPool>>,

    consumers: RwLock<HashMap<String, Arc<dyn QueueConsumer + Send + Sync>>>,
    draining_consumers: RwLock<HashMap<String, Arc<dyn QueueConsumer + Send + Sync>>>,

    pool_configs: RwLock<HashMap<String, PoolConfig>>,
    queue_bindings: RwLock<HashMap<String, QueueBinding>>,

    consumer_factory: SyncRwLock<Option<Arc<dyn ConsumerFactory>>>,

    mediator: Arc<dyn Mediator>,

    running: AtomicBool,
    /// STANDBY pauses the poll loops without stopping consumers.
    paused: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    batch_counter: AtomicU64,

    /// Broker ids processed successfully whose delete failed on an expired
    /// receipt handle; deleted immediately when they reappear.
    pending_delete_broker_ids: Arc<Mutex<HashSet<String>>>,

    warning_service: SyncRwLock<Option<Arc<WarningService>>>,
    health_service: SyncRwLock<Option<Arc<HealthService>>>,
}

impl QueueManager {
    pub fn new(mediator: Arc<dyn Mediator>) -> Self {
        Self::with_config(mediator, QueueManagerConfig::default())
    }

    pub fn with_config(mediator: Arc<dyn Mediator>, config: QueueManagerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            in_pipeline: Arc::new(DashMap::new()),
            app_to_pipeline: Arc::new(DashMap::new()),
            pools: DashMap::new(),
            draining_pools: DashMap::new(),
            consumers: RwLock::new(HashMap::new()),
            draining_consumers: RwLock::new(HashMap::new()),
            pool_configs: RwLock::new(HashMap::new()),
            queue_bindings: RwLock::new(HashMap::new()),
            consumer_factory: SyncRwLock::new(None),
            mediator,
            running: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            shutdown_tx,
            batch_counter: AtomicU64::new(0),
            pending_delete_broker_ids: Arc::new(Mutex::new(HashSet::new())),
            warning_service: SyncRwLock::new(None),
            health_service: SyncRwLock::new(None),
        }
    }

    pub fn set_consumer_factory(&self, factory: Arc<dyn ConsumerFactory>) {
        *self.consumer_factory.write() = Some(factory);
    }

    pub fn set_warning_service(&self, warning_service: Arc<WarningService>) {
        *self.warning_service.write() = Some(warning_service);
    }

    pub fn set_health_service(&self, health_service: Arc<HealthService>) {
        *self.health_service.write() = Some(health_service);
    }

    fn warning_service(&self) -> Option<Arc<WarningService>> {
        self.warning_service.read().clone()
    }

    fn health_service(&self) -> Option<Arc<HealthService>> {
        self.health_service.read().clone()
    }

    fn warn(&self, category: WarningCategory, severity: WarningSeverity, message: String) {
        if let Some(ws) = self.warning_service() {
            ws.add_warning(category, severity, message, "QueueManager".to_string());
        }
    }

    pub async fn add_consumer(&self, consumer: Arc<dyn QueueConsumer + Send + Sync>) {
        let id = consumer.identifier().to_string();
        if let Some(hs) = self.health_service() {
            hs.set_consumer_running(&id, true);
        }
        self.consumers.write().await.insert(id, consumer);
    }

    /// Apply the initial topology.
    pub async fn apply_config(&self, topology: RouterTopology) -> Result<()> {
        let mut pool_configs = self.pool_configs.write().await;
        for pool_config in topology.processing_pools {
            let code = pool_config.code.clone();
            pool_configs.insert(code.clone(), pool_config.clone());
            self.get_or_create_pool(&code, Some(pool_config)).await?;
        }
        let mut bindings = self.queue_bindings.write().await;
        for binding in topology.queues {
            bindings.insert(binding.name.clone(), binding);
        }
        Ok(())
    }

    /// Reconcile a new topology without restarting unaffected components:
    /// removed pools drain, changed pools resize in place, new pools start,
    /// and queue consumers are phased in/out through the factory.
    pub async fn reload_config(&self, topology: RouterTopology) -> Result<ReloadSummary> {
        if !self.running.load(Ordering::SeqCst) {
            warn!("Config reload refused, manager is shutting down");
            return Err(RouterError::ShutdownInProgress);
        }

        info!("Reconciling configuration");

        let new_pool_configs: HashMap<String, PoolConfig> = topology
            .processing_pools
            .iter()
            .map(|p| (p.code.clone(), p.clone()))
            .collect();

        let mut pool_configs = self.pool_configs.write().await;
        let mut summary = ReloadSummary::default();

        let existing_codes: Vec<String> = self.pools.iter().map(|e| e.key().clone()).collect();
        for pool_code in existing_codes {
            match new_pool_configs.get(&pool_code) {
                Some(new_config) => {
                    let changed = pool_configs
                        .get(&pool_code)
                        .map(|old| {
                            old.concurrency != new_config.concurrency
                                || old.rate_limit_per_minute != new_config.rate_limit_per_minute
                                || old.callback_url != new_config.callback_url
                        })
                        .unwrap_or(true);

                    if changed {
                        if let Some(pool) = self.pools.get(&pool_code) {
                            pool.update_concurrency(new_config.concurrency);
                            pool.update_rate_limit(new_config.rate_limit_per_minute);
                            pool.update_callback_url(new_config.callback_url.clone());
                            summary.pools_updated += 1;
                        }
                    }
                    pool_configs.insert(pool_code, new_config.clone());
                }
                None => {
                    if let Some((code, pool)) = self.pools.remove(&pool_code) {
                        info!(pool_code = %code, "Pool removed from config, draining");
                        pool.drain();
                        self.draining_pools.insert(code.clone(), pool);
                        pool_configs.remove(&code);
                        summary.pools_removed += 1;
                    }
                }
            }
        }

        for pool_config in &topology.processing_pools {
            if !self.pools.contains_key(&pool_config.code) {
                if !self.check_pool_budget().await {
                    continue;
                }
                self.get_or_create_pool(&pool_config.code, Some(pool_config.clone()))
                    .await?;
                pool_configs.insert(pool_config.code.clone(), pool_config.clone());
                summary.pools_created += 1;
            }
        }
        drop(pool_configs);

        let (queues_created, queues_removed) = self.sync_queue_consumers(&topology).await?;
        summary.queues_created = queues_created;
        summary.queues_removed = queues_removed;

        info!(
            pools_updated = summary.pools_updated,
            pools_created = summary.pools_created,
            pools_removed = summary.pools_removed,
            queues_created = summary.queues_created,
            queues_removed = summary.queues_removed,
            active_pools = self.pools.len(),
            draining_pools = self.draining_pools.len(),
            "Configuration reconciled"
        );

        Ok(summary)
    }

    /// Returns false (with warnings) when the pool budget is exhausted.
    async fn check_pool_budget(&self) -> bool {
        let count = self.pools.len();

        if count >= self.config.max_pools {
            error!(
                current = count,
                max = self.config.max_pools,
                "Pool limit reached, refusing to create pool"
            );
            self.warn(
                WarningCategory::PoolLimit,
                WarningSeverity::Critical,
                format!("Pool limit reached ({count}/{})", self.config.max_pools),
            );
            return false;
        }

        if count >= self.config.pool_warning_threshold {
            self.warn(
                WarningCategory::PoolLimit,
                WarningSeverity::Warning,
                format!(
                    "Pool count {count} approaching limit {} (threshold {})",
                    self.config.max_pools, self.config.pool_warning_threshold
                ),
            );
        }

        true
    }

    async fn sync_queue_consumers(&self, topology: &RouterTopology) -> Result<(usize, usize)> {
        let mut created = 0;
        let mut removed = 0;

        let new_bindings: HashMap<String, QueueBinding> = topology
            .queues
            .iter()
            .map(|q| {
                let id = if q.name.is_empty() { q.uri.clone() } else { q.name.clone() };
                (id, q.clone())
            })
            .collect();

        let mut bindings = self.queue_bindings.write().await;
        let mut consumers = self.consumers.write().await;
        let mut draining = self.draining_consumers.write().await;

        let existing: Vec<String> = consumers.keys().cloned().collect();
        for queue_id in existing {
            if !new_bindings.contains_key(&queue_id) {
                info!(queue_id = %queue_id, "Phasing out consumer for removed queue");
                if let Some(consumer) = consumers.remove(&queue_id) {
                    consumer.stop().await;
                    if let Some(hs) = self.health_service() {
                        hs.set_consumer_running(&queue_id, false);
                    }
                    draining.insert(queue_id.clone(), consumer);
                    bindings.remove(&queue_id);
                    removed += 1;
                }
            }
        }

        let factory = self.consumer_factory.read().clone();
        match factory {
            Some(factory) => {
                for (queue_id, binding) in &new_bindings {
                    if !consumers.contains_key(queue_id) {
                        match factory.create_consumer(binding).await {
                            Ok(consumer) => {
                                consumers.insert(queue_id.clone(), consumer);
                                bindings.insert(queue_id.clone(), binding.clone());
                                if let Some(hs) = self.health_service() {
                                    hs.set_consumer_running(queue_id, true);
                                }
                                created += 1;
                                info!(queue_id = %queue_id, "Queue consumer created");
                            }
                            Err(e) => {
                                error!(queue_id = %queue_id, error = %e, "Consumer creation failed");
                                self.warn(
                                    WarningCategory::Configuration,
                                    WarningSeverity::Critical,
                                    format!("Failed to create consumer for queue [{queue_id}]: {e}"),
                                );
                            }
                        }
                    }
                }
            }
            None => {
                for queue_id in new_bindings.keys() {
                    if !consumers.contains_key(queue_id) {
                        warn!(
                            queue_id = %queue_id,
                            "New queue in config but no consumer factory configured"
                        );
                    }
                }
            }
        }

        Ok((created, removed))
    }

    /// Reap draining pools that have finished. Called periodically.
    pub async fn cleanup_draining_pools(&self) {
        let finished: Vec<String> = self
            .draining_pools
            .iter()
            .filter(|e| e.value().is_fully_drained())
            .map(|e| e.key().clone())
            .collect();

        for code in finished {
            info!(pool_code = %code, "Draining pool finished");
            self.draining_pools.remove(&code);
        }
    }

    async fn get_or_create_pool(
        &self,
        code: &str,
        config: Option<PoolConfig>,
    ) -> Result<Arc<ProcessPool>> {
        if let Some(pool) = self.pools.get(code) {
            return Ok(pool.clone());
        }

        let pool_config = config
            .unwrap_or_else(|| PoolConfig::new(code, DEFAULT_POOL_CONCURRENCY));

        let pool = Arc::new(ProcessPool::new(pool_config.clone(), self.mediator.clone()));
        if let Some(ws) = self.warning_service() {
            pool.set_warning_service(ws);
        }
        pool.start();

        self.pools.insert(code.to_string(), pool.clone());
        info!(pool_code = %code, concurrency = pool_config.concurrency, "Created process pool");

        Ok(pool)
    }

    /// Route one polled batch: delete previously-completed redeliveries,
    /// filter duplicates, then fan out by (pool, group) preserving order
    /// within each group.
    pub async fn route_batch(
        &self,
        messages: Vec<QueuedMessage>,
        consumer: Arc<dyn QueueConsumer + Send + Sync>,
    ) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            for msg in messages {
                let _ = consumer.nack(&msg.receipt_handle, None).await;
            }
            return Err(RouterError::ShutdownInProgress);
        }

        if messages.is_empty() {
            return Ok(());
        }

        let batch_id = self.batch_counter.fetch_add(1, Ordering::SeqCst).to_string();

        // Previously processed messages whose delete failed: delete now.
        let mut to_delete = Vec::new();
        let mut to_process = Vec::with_capacity(messages.len());
        {
            let mut pending = self.pending_delete_broker_ids.lock();
            for msg in messages {
                let delete_now = msg
                    .broker_message_id
                    .as_ref()
                    .map(|id| pending.remove(id))
                    .unwrap_or(false);
                if delete_now {
                    to_delete.push(msg);
                } else {
                    to_process.push(msg);
                }
            }
        }
        for msg in to_delete {
            info!(
                broker_message_id = ?msg.broker_message_id,
                message_id = %msg.pointer.id,
                "Deleting previously processed redelivery"
            );
            let _ = consumer.ack(&msg.receipt_handle).await;
        }

        let filtered = self.filter_duplicates(to_process);

        for dup in filtered.redeliveries {
            debug!(message_id = %dup.pointer.id, "Visibility-timeout redelivery, deferring");
            let _ = consumer.defer(&dup.receipt_handle, None).await;
        }
        for requeued in filtered.requeued {
            debug!(message_id = %requeued.pointer.id, "Externally requeued duplicate, acking");
            let _ = consumer.ack(&requeued.receipt_handle).await;
        }

        let by_pool = Self::group_by_pool(filtered.unique);

        for (pool_code, pool_messages) in by_pool {
            let pool = match self.get_or_create_pool(&pool_code, None).await {
                Ok(p) => p,
                Err(e) => {
                    error!(pool_code = %pool_code, error = %e, "Pool unavailable");
                    for msg in pool_messages {
                        let _ = consumer.nack(&msg.receipt_handle, Some(5)).await;
                    }
                    continue;
                }
            };

            // Capacity is checked for the whole pool slice: admitting only a
            // prefix would reorder groups split across the boundary.
            if pool.available_capacity() < pool_messages.len() {
                warn!(
                    pool_code = %pool_code,
                    available = pool.available_capacity(),
                    requested = pool_messages.len(),
                    "Pool at capacity, deferring slice"
                );
                self.warn(
                    WarningCategory::QueueFull,
                    WarningSeverity::Warning,
                    format!(
                        "Pool [{pool_code}] full, deferring {} messages",
                        pool_messages.len()
                    ),
                );
                for msg in pool_messages {
                    let _ = consumer.defer(&msg.receipt_handle, Some(5)).await;
                }
                continue;
            }

            let by_group = Self::group_by_message_group(pool_messages);

            for (group_id, group_messages) in by_group {
                let mut nack_remaining = false;

                for msg in group_messages {
                    if nack_remaining {
                        // A failed submit poisons the rest of the group to
                        // preserve FIFO.
                        let _ = consumer.nack(&msg.receipt_handle, Some(5)).await;
                        continue;
                    }

                    let (ack_tx, ack_rx) = oneshot::channel();
                    let app_message_id = msg.pointer.id.clone();
                    let pipeline_key = msg
                        .broker_message_id
                        .clone()
                        .unwrap_or_else(|| format!("local:{}:{}", msg.queue_identifier, msg.pointer.id));
                    let receipt_handle = msg.receipt_handle.clone();

                    let in_flight = InFlightMessage::new(
                        &msg.pointer,
                        msg.broker_message_id.clone(),
                        msg.queue_identifier.clone(),
                        Some(batch_id.clone()),
                        msg.receipt_handle.clone(),
                    );
                    self.in_pipeline.insert(pipeline_key.clone(), in_flight);
                    self.app_to_pipeline
                        .insert(app_message_id.clone(), pipeline_key.clone());

                    self.spawn_completion_task(
                        consumer.clone(),
                        pipeline_key.clone(),
                        app_message_id.clone(),
                        msg.broker_message_id.clone(),
                        receipt_handle.clone(),
                        ack_rx,
                        pool_code.clone(),
                    );

                    let routed = RoutedMessage {
                        pointer: msg.pointer,
                        receipt_handle: msg.receipt_handle,
                        broker_message_id: msg.broker_message_id,
                        queue_identifier: msg.queue_identifier,
                        batch_id: Some(batch_id.clone()),
                        ack_tx,
                    };

                    if let Err(e) = pool.submit(routed).await {
                        error!(
                            message_id = %app_message_id,
                            group_id = %group_id,
                            error = %e,
                            "Pool submit failed, nacking rest of group"
                        );
                        self.in_pipeline.remove(&pipeline_key);
                        self.app_to_pipeline.remove(&app_message_id);
                        let _ = consumer.nack(&receipt_handle, Some(5)).await;
                        nack_remaining = true;
                    }
                }
            }
        }

        Ok(())
    }

    /// Waits for the pool's completion signal and performs the broker
    /// operation with the freshest receipt handle.
    #[allow(clippy::too_many_arguments)]
    fn spawn_completion_task(
        &self,
        consumer: Arc<dyn QueueConsumer + Send + Sync>,
        pipeline_key: String,
        app_message_id: String,
        broker_message_id: Option<String>,
        original_receipt_handle: String,
        ack_rx: oneshot::Receiver<AckNack>,
        pool_code: String,
    ) {
        let in_pipeline = self.in_pipeline.clone();
        let app_to_pipeline = self.app_to_pipeline.clone();
        let pending_delete = self.pending_delete_broker_ids.clone();
        let health_service = self.health_service();

        tokio::spawn(async move {
            // The receipt handle may have rotated on redelivery; take the
            // freshest one from the in-pipeline record.
            let (current_handle, current_broker_id) = in_pipeline
                .get(&pipeline_key)
                .map(|e| (e.receipt_handle.clone(), e.broker_message_id.clone()))
                .unwrap_or((original_receipt_handle, broker_message_id));

            let ack_result = ack_rx.await;

            // Remove from tracking before the broker call so a slow broker
            // never makes the message look stuck.
            in_pipeline.remove(&pipeline_key);
            app_to_pipeline.remove(&app_message_id);

            match ack_result {
                Ok(AckNack::Ack) => {
                    if let Some(ref hs) = health_service {
                        hs.record_pool_result(&pool_code, true);
                    }
                    if let Err(e) = consumer.ack(&current_handle).await {
                        if let Some(broker_id) = current_broker_id {
                            warn!(
                                broker_message_id = %broker_id,
                                message_id = %app_message_id,
                                error = %e,
                                "Ack failed (handle likely expired), queueing delete-on-redelivery"
                            );
                            pending_delete.lock().insert(broker_id);
                        } else {
                            error!(
                                message_id = %app_message_id,
                                error = %e,
                                "Ack failed with no broker id to track"
                            );
                        }
                    }
                }
                Ok(AckNack::Nack { delay_seconds }) => {
                    if let Some(ref hs) = health_service {
                        hs.record_pool_result(&pool_code, false);
                    }
                    let _ = consumer.nack(&current_handle, delay_seconds).await;
                }
                Ok(AckNack::Defer { delay_seconds }) => {
                    let _ = consumer.defer(&current_handle, delay_seconds).await;
                }
                Ok(AckNack::ExtendVisibility { seconds }) => {
                    let _ = consumer.extend_visibility(&current_handle, seconds).await;
                }
                Err(_) => {
                    // Completion channel dropped; nack to be safe.
                    let _ = consumer.nack(&current_handle, None).await;
                }
            }
        });
    }

    /// Split a batch into unique messages, visibility-timeout redeliveries
    /// (same broker id as an in-flight message), and externally requeued
    /// duplicates (same app id, different broker id).
    fn filter_duplicates(&self, messages: Vec<QueuedMessage>) -> FilteredBatch {
        let mut result = FilteredBatch {
            unique: Vec::with_capacity(messages.len()),
            redeliveries: Vec::new(),
            requeued: Vec::new(),
        };

        for msg in messages {
            if let Some(ref broker_id) = msg.broker_message_id {
                if let Some(mut entry) = self.in_pipeline.get_mut(broker_id) {
                    if entry.receipt_handle != msg.receipt_handle {
                        debug!(
                            message_id = %msg.pointer.id,
                            "Rotating receipt handle for redelivered message"
                        );
                        entry.receipt_handle = msg.receipt_handle.clone();
                    }
                    drop(entry);
                    result.redeliveries.push(msg);
                    continue;
                }
            }

            if let Some(existing_key) = self
                .app_to_pipeline
                .get(&msg.pointer.id)
                .map(|e| e.value().clone())
            {
                let different_broker = msg
                    .broker_message_id
                    .as_ref()
                    .map(|id| *id != existing_key)
                    .unwrap_or(false);

                if different_broker {
                    info!(
                        message_id = %msg.pointer.id,
                        "Requeued duplicate while original still in flight"
                    );
                    result.requeued.push(msg);
                    continue;
                }

                if let Some(mut entry) = self.in_pipeline.get_mut(&existing_key) {
                    if entry.receipt_handle != msg.receipt_handle {
                        entry.receipt_handle = msg.receipt_handle.clone();
                    }
                    drop(entry);
                    result.redeliveries.push(msg);
                    continue;
                }
            }

            result.unique.push(msg);
        }

        result
    }

    fn group_by_pool(messages: Vec<QueuedMessage>) -> HashMap<String, Vec<QueuedMessage>> {
        let mut by_pool: HashMap<String, Vec<QueuedMessage>> = HashMap::new();
        for msg in messages {
            let pool_code = if msg.pointer.pool_code.is_empty() {
                DEFAULT_POOL_CODE.to_string()
            } else {
                msg.pointer.pool_code.clone()
            };
            by_pool.entry(pool_code).or_default().push(msg);
        }
        by_pool
    }

    /// IndexMap keeps groups in first-seen order so the per-group slices
    /// stay in enqueue order.
    fn group_by_message_group(messages: Vec<QueuedMessage>) -> IndexMap<String, Vec<QueuedMessage>> {
        let mut by_group: IndexMap<String, Vec<QueuedMessage>> = IndexMap::new();
        for msg in messages {
            let group = msg
                .pointer
                .message_group_id
                .clone()
                .unwrap_or_else(|| DEFAULT_GROUP_KEY.to_string());
            by_group.entry(group).or_default().push(msg);
        }
        by_group
    }

    /// Start one poll loop per consumer. Returns when shutdown is signaled.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let consumers: Vec<_> = self.consumers.read().await.values().cloned().collect();
        info!(consumers = consumers.len(), "Starting queue manager");

        let mut handles = Vec::new();

        for consumer in consumers {
            let manager = self.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();

            let handle = tokio::spawn(async move {
                loop {
                    if manager.paused.load(Ordering::SeqCst) {
                        tokio::select! {
                            _ = shutdown_rx.recv() => break,
                            _ = tokio::time::sleep(Duration::from_millis(500)) => continue,
                        }
                    }

                    tokio::select! {
                        _ = shutdown_rx.recv() => {
                            info!(consumer = %consumer.identifier(), "Poll loop stopping");
                            break;
                        }
                        result = consumer.poll(10) => {
                            if let Some(hs) = manager.health_service() {
                                hs.record_consumer_poll(consumer.identifier());
                            }
                            match result {
                                Ok(messages) if !messages.is_empty() => {
                                    if let Err(e) = manager.route_batch(messages, consumer.clone()).await {
                                        error!(error = %e, "Batch routing error");
                                    }
                                }
                                Ok(_) => {
                                    tokio::time::sleep(Duration::from_millis(100)).await;
                                }
                                Err(e) => {
                                    error!(consumer = %consumer.identifier(), error = %e, "Poll error, backing off");
                                    tokio::time::sleep(Duration::from_secs(1)).await;
                                }
                            }
                        }
                    }
                }
            });
            handles.push(handle);
        }

        for handle in handles {
            let _ = handle.await;
        }

        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("Queue manager paused (standby)");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!("Queue manager resumed (primary)");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Graceful shutdown: stop consumers, drain pools within the deadline
    /// plus grace, then nack whatever is left. Returns true when the drain
    /// completed cleanly.
    pub async fn shutdown(&self) -> bool {
        info!("Queue manager shutting down");
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());

        {
            let consumers = self.consumers.read().await;
            for consumer in consumers.values() {
                consumer.stop().await;
            }
        }

        for entry in self.pools.iter() {
            entry.value().drain();
        }

        let deadline = self.config.drain_deadline + self.config.drain_grace;
        let start = Instant::now();
        let mut clean = true;

        while !self.all_pools_drained() {
            if start.elapsed() >= deadline {
                clean = false;
                break;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        let remaining = self.in_pipeline.len();
        if remaining > 0 {
            clean = false;
            warn!(remaining = remaining, "Nacking in-flight messages at shutdown");

            let leftovers: Vec<(String, String)> = self
                .in_pipeline
                .iter()
                .map(|e| (e.value().queue_identifier.clone(), e.value().receipt_handle.clone()))
                .collect();

            let consumers = self.consumers.read().await;
            let mut nack_errors = 0usize;
            for (queue_id, receipt_handle) in leftovers {
                if let Some(consumer) = consumers.get(&queue_id) {
                    if consumer.nack(&receipt_handle, None).await.is_err() {
                        nack_errors += 1;
                    }
                }
            }
            if nack_errors > 0 {
                if let Some(ws) = self.warning_service() {
                    ws.add_warning(
                        WarningCategory::ShutdownCleanupErrors,
                        WarningSeverity::Warning,
                        format!("{nack_errors} in-flight messages could not be nacked at shutdown"),
                        "QueueManager".to_string(),
                    );
                }
            }
            self.in_pipeline.clear();
            self.app_to_pipeline.clear();
        }

        info!(clean = clean, "Queue manager shutdown complete");
        clean
    }

    fn all_pools_drained(&self) -> bool {
        self.pools.iter().all(|e| e.value().is_fully_drained())
    }

    pub fn get_pool_stats(&self) -> Vec<rp_common::PoolStats> {
        self.pools.iter().map(|e| e.value().get_stats()).collect()
    }

    pub fn pool_codes(&self) -> Vec<String> {
        self.pools.iter().map(|e| e.key().clone()).collect()
    }

    pub fn get_pool(&self, code: &str) -> Option<Arc<ProcessPool>> {
        self.pools.get(code).map(|e| e.clone())
    }

    pub async fn update_pool_config(&self, pool_code: &str, config: PoolConfig) -> Result<()> {
        // Clone the Arc out so no map guard is held across the awaits below
        let existing = self.pools.get(pool_code).map(|e| e.clone());
        match existing {
            Some(pool) => {
                if !pool.update_concurrency(config.concurrency) {
                    return Err(RouterError::Validation(format!(
                        "invalid concurrency {} for pool {pool_code}",
                        config.concurrency
                    )));
                }
                pool.update_rate_limit(config.rate_limit_per_minute);
                pool.update_callback_url(config.callback_url.clone());
                self.pool_configs
                    .write()
                    .await
                    .insert(pool_code.to_string(), config);
                Ok(())
            }
            None => {
                self.get_or_create_pool(pool_code, Some(config)).await?;
                Ok(())
            }
        }
    }

    pub async fn consumer_ids(&self) -> Vec<String> {
        self.consumers.read().await.keys().cloned().collect()
    }

    pub async fn is_consumer_healthy(&self, consumer_id: &str) -> bool {
        self.consumers
            .read()
            .await
            .get(consumer_id)
            .map(|c| c.is_healthy())
            .unwrap_or(false)
    }

    /// Restart signal for a stalled consumer; the lifecycle loop re-polls.
    pub async fn restart_consumer(&self, consumer_id: &str) -> bool {
        let consumers = self.consumers.read().await;
        match consumers.get(consumer_id) {
            Some(consumer) => {
                info!(consumer_id = %consumer_id, "Restarting consumer");
                consumer.stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn get_queue_metrics(&self) -> Vec<QueueMetrics> {
        let consumers = self.consumers.read().await;
        let mut metrics = Vec::with_capacity(consumers.len());

        for (id, consumer) in consumers.iter() {
            match consumer.get_metrics().await {
                Ok(Some(m)) => metrics.push(m),
                Ok(None) => debug!(consumer_id = %id, "Consumer reports no metrics"),
                Err(e) => warn!(consumer_id = %id, error = %e, "Queue metrics fetch failed"),
            }
        }

        metrics
    }

    /// Extend visibility for messages processing longer than the threshold.
    pub async fn extend_visibility_for_long_running(&self) {
        let threshold_seconds = 50;
        let extension_seconds = 120;

        let extensions: Vec<_> = self
            .in_pipeline
            .iter()
            .filter(|e| e.value().elapsed_seconds() >= threshold_seconds)
            .map(|e| {
                let v = e.value();
                (v.queue_identifier.clone(), v.receipt_handle.clone(), v.message_id.clone())
            })
            .collect();

        if extensions.is_empty() {
            return;
        }

        let consumers = self.consumers.read().await;
        for (queue_id, receipt_handle, message_id) in extensions {
            if let Some(consumer) = consumers.get(&queue_id) {
                if let Err(e) = consumer.extend_visibility(&receipt_handle, extension_seconds).await {
                    warn!(
                        message_id = %message_id,
                        queue = %queue_id,
                        error = %e,
                        "Visibility extension failed"
                    );
                }
            }
        }
    }

    /// PIPELINE_MAP_LEAK check: the in-pipeline map should stay bounded by
    /// pool capacity; sustained growth means completions are being lost.
    pub async fn check_pipeline_health(&self) -> bool {
        let size = self.in_pipeline.len();
        if size > PIPELINE_LEAK_THRESHOLD {
            warn!(size = size, threshold = PIPELINE_LEAK_THRESHOLD, "In-pipeline map is large");
            self.warn(
                WarningCategory::PipelineMapLeak,
                WarningSeverity::Error,
                format!("In-pipeline map holds {size} entries (threshold {PIPELINE_LEAK_THRESHOLD})"),
            );
            return false;
        }
        true
    }

    pub fn get_in_flight_messages(
        &self,
        limit: usize,
        message_id_filter: Option<&str>,
    ) -> Vec<InFlightMessageInfo> {
        let mut messages: Vec<InFlightMessageInfo> = self
            .in_pipeline
            .iter()
            .filter(|e| {
                message_id_filter
                    .map(|f| e.value().message_id.contains(f))
                    .unwrap_or(true)
            })
            .map(|e| {
                let v = e.value();
                InFlightMessageInfo {
                    message_id: v.message_id.clone(),
                    broker_message_id: v.broker_message_id.clone(),
                    queue_id: v.queue_identifier.clone(),
                    pool_code: v.pool_code.clone(),
                    message_group_id: v.message_group_id.clone(),
                    elapsed_time_ms: v.started_at.elapsed().as_millis() as u64,
                }
            })
            .collect();

        messages.sort_by(|a, b| b.elapsed_time_ms.cmp(&a.elapsed_time_ms));
        messages.truncate(limit);
        messages
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_pipeline.len()
    }
}

#[async_trait::async_trait]
impl crate::traffic::TrafficListener for QueueManager {
    async fn on_pause(&self) {
        self.pause();
    }

    async fn on_resume(&self) {
        self.resume();
    }
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct ReloadSummary {
    pub pools_updated: usize,
    pub pools_created: usize,
    pub pools_removed: usize,
    pub queues_created: usize,
    pub queues_removed: usize,
}

struct FilteredBatch {
    unique: Vec<QueuedMessage>,
    /// Same broker id as an in-flight message: deferred.
    redeliveries: Vec<QueuedMessage>,
    /// Same app id, different broker id: acked as duplicates.
    requeued: Vec<QueuedMessage>,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InFlightMessageInfo {
    pub message_id: String,
    pub broker_message_id: Option<String>,
    pub queue_id: String,
    pub pool_code: String,
    pub message_group_id: Option<String>,
    pub elapsed_time_ms: u64,
}
