//! Processing pool: per-pool concurrency and rate limiting, with one
//! serial worker per message group.
//!
//! Each group gets a dedicated task fed by an mpsc channel. The task
//! drains one message at a time, so a group never has more than one
//! mediation in flight, while the pool-level semaphore bounds total
//! concurrency across groups. Idle group workers reap themselves after
//! five minutes.

use dashmap::{DashMap, DashSet};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use parking_lot::RwLock;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, error, info, warn};

use crate::mediator::Mediator;
use crate::stats::PoolStatsCollector;
use crate::warning::WarningService;
use crate::Result;
use rp_common::{
    AckNack, MediationResult, MessagePointer, PoolConfig, PoolStats, RoutedMessage,
    WarningCategory, WarningSeverity,
};

const DEFAULT_GROUP: &str = "__DEFAULT__";
const QUEUE_CAPACITY_MULTIPLIER: u32 = 2;
const MIN_QUEUE_CAPACITY: u32 = 50;
const GROUP_IDLE_TTL: Duration = Duration::from_secs(300);
const GROUP_CHANNEL_DEPTH: usize = 100;
/// Delay applied when the rate limiter rejects an attempt.
const RATE_LIMIT_DEFER_SECONDS: u32 = 5;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;
type SharedRateLimiter = Arc<RwLock<Option<Arc<DirectRateLimiter>>>>;

/// (batch, group) key for tracking cascading failures without string
/// formatting on the hot path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchGroupKey {
    pub batch_id: Arc<str>,
    pub group_id: Arc<str>,
}

impl BatchGroupKey {
    fn new(batch_id: &str, group_id: &str) -> Self {
        Self {
            batch_id: Arc::from(batch_id),
            group_id: Arc::from(group_id),
        }
    }
}

impl std::fmt::Display for BatchGroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.batch_id, self.group_id)
    }
}

struct GroupTask {
    pointer: MessagePointer,
    ack_tx: oneshot::Sender<AckNack>,
    batch_group_key: Option<BatchGroupKey>,
}

/// Everything a group worker needs, shared by Arc with the pool.
struct PoolShared {
    pool_code: Arc<str>,
    config: RwLock<PoolConfig>,
    semaphore: Arc<Semaphore>,
    mediator: Arc<dyn Mediator>,
    group_senders: DashMap<Arc<str>, mpsc::Sender<GroupTask>>,
    live_groups: DashSet<Arc<str>>,
    failed_batch_groups: DashSet<BatchGroupKey>,
    batch_group_counts: DashMap<BatchGroupKey, AtomicU32>,
    rate_limiter: SharedRateLimiter,
    queue_size: AtomicU32,
    active_workers: AtomicU32,
    stats: PoolStatsCollector,
    warning_service: RwLock<Option<Arc<WarningService>>>,
}

impl PoolShared {
    /// Decrement the (batch, group) count, clearing failure tracking once
    /// the batch+group fully drains.
    fn finish_batch_group_member(&self, key: &BatchGroupKey) {
        let drained = match self.batch_group_counts.get(key) {
            Some(counter) => counter.fetch_sub(1, Ordering::SeqCst) <= 1,
            None => false,
        };
        // Ref guard dropped before mutating the maps
        if drained {
            self.batch_group_counts.remove(key);
            self.failed_batch_groups.remove(key);
        }
    }

    fn warn(&self, category: WarningCategory, severity: WarningSeverity, message: String) {
        if let Some(ref ws) = *self.warning_service.read() {
            ws.add_warning(category, severity, message, format!("ProcessPool:{}", self.pool_code));
        }
    }
}

pub struct ProcessPool {
    shared: Arc<PoolShared>,
    concurrency: AtomicU32,
    running: AtomicBool,
}

impl ProcessPool {
    pub fn new(config: PoolConfig, mediator: Arc<dyn Mediator>) -> Self {
        let concurrency = config.concurrency.max(1);

        let rate_limiter = config
            .rate_limit_per_minute
            .and_then(NonZeroU32::new)
            .map(|rpm| Arc::new(RateLimiter::direct(Quota::per_minute(rpm))));

        let shared = Arc::new(PoolShared {
            pool_code: Arc::from(config.code.as_str()),
            semaphore: Arc::new(Semaphore::new(concurrency as usize)),
            mediator,
            group_senders: DashMap::new(),
            live_groups: DashSet::new(),
            failed_batch_groups: DashSet::new(),
            batch_group_counts: DashMap::new(),
            rate_limiter: Arc::new(RwLock::new(rate_limiter)),
            queue_size: AtomicU32::new(0),
            active_workers: AtomicU32::new(0),
            stats: PoolStatsCollector::new(),
            warning_service: RwLock::new(None),
            config: RwLock::new(config),
        });

        Self {
            shared,
            concurrency: AtomicU32::new(concurrency),
            running: AtomicBool::new(false),
        }
    }

    pub fn set_warning_service(&self, warning_service: Arc<WarningService>) {
        *self.shared.warning_service.write() = Some(warning_service);
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let config = self.shared.config.read();
        info!(
            pool_code = %config.code,
            concurrency = self.concurrency.load(Ordering::SeqCst),
            rate_limit = ?config.rate_limit_per_minute,
            "Process pool started"
        );
    }

    pub fn code(&self) -> String {
        self.shared.config.read().code.clone()
    }

    fn queue_capacity(&self) -> u32 {
        std::cmp::max(
            self.concurrency.load(Ordering::SeqCst) * QUEUE_CAPACITY_MULTIPLIER,
            MIN_QUEUE_CAPACITY,
        )
    }

    pub fn available_capacity(&self) -> usize {
        let used = self.shared.queue_size.load(Ordering::SeqCst) as usize;
        (self.queue_capacity() as usize).saturating_sub(used)
    }

    /// Hand a routed message to its group worker.
    pub async fn submit(&self, routed: RoutedMessage) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            let _ = routed.ack_tx.send(AckNack::Nack { delay_seconds: Some(5) });
            return Ok(());
        }

        if self.shared.queue_size.load(Ordering::SeqCst) >= self.queue_capacity() {
            debug!(pool_code = %self.shared.pool_code, "Pool at capacity, deferring");
            let _ = routed.ack_tx.send(AckNack::Defer { delay_seconds: Some(5) });
            return Ok(());
        }

        self.shared.queue_size.fetch_add(1, Ordering::SeqCst);

        let group_id: Arc<str> = routed
            .pointer
            .message_group_id
            .as_deref()
            .filter(|g| !g.is_empty())
            .map(Arc::from)
            .unwrap_or_else(|| Arc::from(DEFAULT_GROUP));

        let batch_group_key = routed
            .batch_id
            .as_deref()
            .map(|batch_id| BatchGroupKey::new(batch_id, &group_id));

        if let Some(ref key) = batch_group_key {
            self.shared
                .batch_group_counts
                .entry(key.clone())
                .or_insert_with(|| AtomicU32::new(0))
                .fetch_add(1, Ordering::SeqCst);

            // A failed batch+group nacks everything behind it to keep order
            if self.shared.failed_batch_groups.contains(key) {
                self.shared.queue_size.fetch_sub(1, Ordering::SeqCst);
                self.shared.finish_batch_group_member(key);
                let _ = routed.ack_tx.send(AckNack::Nack { delay_seconds: Some(1) });
                return Ok(());
            }
        }

        let task = GroupTask {
            pointer: routed.pointer,
            ack_tx: routed.ack_tx,
            batch_group_key,
        };

        let sender = self.group_sender(&group_id);
        if let Err(send_error) = sender.send(task).await {
            // The worker reaped itself between lookup and send; retry once
            // against a fresh worker.
            debug!(group_id = %group_id, "Group worker gone, restarting");
            self.shared.group_senders.remove(&group_id);

            let task = send_error.0;
            let retry_sender = self.group_sender(&group_id);
            if let Err(second_error) = retry_sender.send(task).await {
                error!(group_id = %group_id, "Group worker unavailable after restart");
                self.shared.queue_size.fetch_sub(1, Ordering::SeqCst);
                let task = second_error.0;
                if let Some(ref key) = task.batch_group_key {
                    self.shared.finish_batch_group_member(key);
                }
                let _ = task.ack_tx.send(AckNack::Nack { delay_seconds: Some(5) });
            }
        }

        Ok(())
    }

    fn group_sender(&self, group_id: &Arc<str>) -> mpsc::Sender<GroupTask> {
        if let Some(sender) = self.shared.group_senders.get(group_id) {
            if self.shared.live_groups.contains(group_id) {
                return sender.clone();
            }
        }

        self.shared.group_senders.remove(group_id);

        let (tx, rx) = mpsc::channel(GROUP_CHANNEL_DEPTH);
        self.shared.group_senders.insert(Arc::clone(group_id), tx.clone());
        self.shared.live_groups.insert(Arc::clone(group_id));

        let shared = Arc::clone(&self.shared);
        let group = Arc::clone(group_id);
        tokio::spawn(async move {
            run_group_worker(shared, group, rx).await;
        });

        tx
    }

    /// Resize the concurrency limit in place. Increases release waiters
    /// immediately; decreases take effect as running workers release their
    /// permits. Limits below 1 are rejected.
    pub fn update_concurrency(&self, new_concurrency: u32) -> bool {
        if new_concurrency == 0 {
            warn!(pool_code = %self.shared.pool_code, "Rejecting concurrency limit of 0");
            return false;
        }
        // Pool concurrency is bounded at 1..=1000
        let new_concurrency = new_concurrency.min(1000);

        let old = self.concurrency.swap(new_concurrency, Ordering::SeqCst);
        if new_concurrency == old {
            return true;
        }

        if new_concurrency > old {
            self.shared.semaphore.add_permits((new_concurrency - old) as usize);
            info!(
                pool_code = %self.shared.pool_code,
                old = old,
                new = new_concurrency,
                "Pool concurrency increased"
            );
        } else {
            // Soak up the excess permits in the background; active work may
            // exceed the new limit until completions drain it.
            let semaphore = Arc::clone(&self.shared.semaphore);
            let to_remove = old - new_concurrency;
            let pool_code = Arc::clone(&self.shared.pool_code);
            tokio::spawn(async move {
                match semaphore.acquire_many_owned(to_remove).await {
                    Ok(permits) => {
                        permits.forget();
                        info!(
                            pool_code = %pool_code,
                            removed_permits = to_remove,
                            "Pool concurrency decrease completed"
                        );
                    }
                    Err(_) => warn!(pool_code = %pool_code, "Semaphore closed during resize"),
                }
            });
            info!(
                pool_code = %self.shared.pool_code,
                old = old,
                new = new_concurrency,
                "Pool concurrency decrease scheduled"
            );
        }

        self.shared.config.write().concurrency = new_concurrency;
        true
    }

    /// Swap the rate limiter in place. `None` or zero disables limiting.
    pub fn update_rate_limit(&self, new_rate_limit: Option<u32>) {
        let current = self.shared.config.read().rate_limit_per_minute;
        if current == new_rate_limit {
            return;
        }

        let limiter = new_rate_limit
            .and_then(NonZeroU32::new)
            .map(|rpm| Arc::new(RateLimiter::direct(Quota::per_minute(rpm))));

        *self.shared.rate_limiter.write() = limiter;
        self.shared.config.write().rate_limit_per_minute = new_rate_limit;

        info!(
            pool_code = %self.shared.pool_code,
            old = ?current,
            new = ?new_rate_limit,
            "Pool rate limit updated in place"
        );
    }

    pub fn update_callback_url(&self, callback_url: Option<String>) {
        self.shared.config.write().callback_url = callback_url;
    }

    pub fn is_rate_limited(&self) -> bool {
        self.shared
            .rate_limiter
            .read()
            .as_ref()
            .map(|rl| rl.check().is_err())
            .unwrap_or(false)
    }

    /// Stop accepting new messages.
    pub fn drain(&self) {
        info!(pool_code = %self.shared.pool_code, "Draining pool");
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_fully_drained(&self) -> bool {
        self.shared.queue_size.load(Ordering::SeqCst) == 0
            && self.shared.active_workers.load(Ordering::SeqCst) == 0
    }

    /// Drain and wait up to `deadline` for group workers to flush.
    pub async fn drain_with_deadline(&self, deadline: Duration) -> bool {
        self.drain();
        let start = std::time::Instant::now();
        while !self.is_fully_drained() {
            if start.elapsed() >= deadline {
                warn!(
                    pool_code = %self.shared.pool_code,
                    queue_size = self.shared.queue_size.load(Ordering::SeqCst),
                    active_workers = self.shared.active_workers.load(Ordering::SeqCst),
                    "Drain deadline elapsed with work in flight"
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        true
    }

    pub fn queue_size(&self) -> u32 {
        self.shared.queue_size.load(Ordering::SeqCst)
    }

    pub fn active_workers(&self) -> u32 {
        self.shared.active_workers.load(Ordering::SeqCst)
    }

    pub fn concurrency(&self) -> u32 {
        self.concurrency.load(Ordering::SeqCst)
    }

    pub fn rate_limit_per_minute(&self) -> Option<u32> {
        self.shared.config.read().rate_limit_per_minute
    }

    pub fn callback_url(&self) -> Option<String> {
        self.shared.config.read().callback_url.clone()
    }

    pub fn group_count(&self) -> u32 {
        self.shared.group_senders.len() as u32
    }

    pub fn get_stats(&self) -> PoolStats {
        let config = self.shared.config.read();
        PoolStats {
            pool_code: config.code.clone(),
            concurrency: self.concurrency.load(Ordering::SeqCst),
            active_workers: self.shared.active_workers.load(Ordering::SeqCst),
            available_permits: self.shared.semaphore.available_permits() as u32,
            queue_size: self.shared.queue_size.load(Ordering::SeqCst),
            queue_capacity: self.queue_capacity(),
            message_group_count: self.shared.group_senders.len() as u32,
            rate_limit_per_minute: config.rate_limit_per_minute,
            is_rate_limited: self
                .shared
                .rate_limiter
                .read()
                .as_ref()
                .map(|rl| rl.check().is_err())
                .unwrap_or(false),
            total_processed: self.shared.stats.total_processed(),
            total_succeeded: self.shared.stats.total_succeeded(),
            total_failed: self.shared.stats.total_failed(),
            total_rate_limited: self.shared.stats.total_rate_limited(),
            last_5_min: self.shared.stats.last_5_min(),
            last_30_min: self.shared.stats.last_30_min(),
        }
    }

    pub fn reset_stats(&self) {
        self.shared.stats.reset();
    }
}

/// Serial worker for one message group. At most one mediation in flight
/// per group; strictly FIFO over the channel.
async fn run_group_worker(
    shared: Arc<PoolShared>,
    group_id: Arc<str>,
    mut rx: mpsc::Receiver<GroupTask>,
) {
    debug!(group_id = %group_id, pool_code = %shared.pool_code, "Group worker started");

    loop {
        let task = match tokio::time::timeout(GROUP_IDLE_TTL, rx.recv()).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                debug!(group_id = %group_id, "Group channel closed");
                break;
            }
            Err(_) => {
                if rx.is_empty() {
                    debug!(group_id = %group_id, "Group idle TTL elapsed, reaping");
                    shared.group_senders.remove(&group_id);
                    break;
                }
                continue;
            }
        };

        shared.queue_size.fetch_sub(1, Ordering::SeqCst);

        // Re-check after dequeue: a failure may have landed while this
        // message sat in the channel.
        if let Some(ref key) = task.batch_group_key {
            if shared.failed_batch_groups.contains(key) {
                debug!(
                    message_id = %task.pointer.id,
                    batch_group = %key,
                    "Batch+group failed earlier, nacking to preserve order"
                );
                shared.finish_batch_group_member(key);
                let _ = task.ack_tx.send(AckNack::Nack { delay_seconds: Some(1) });
                continue;
            }
        }

        // Rate limit: a failed token acquisition defers the message back
        // to the broker instead of blocking the worker.
        let limiter = shared.rate_limiter.read().clone();
        if let Some(limiter) = limiter {
            if limiter.check().is_err() {
                shared.stats.record_rate_limited();
                debug!(message_id = %task.pointer.id, "Rate limited, deferring");
                if let Some(ref key) = task.batch_group_key {
                    shared.finish_batch_group_member(key);
                }
                let _ = task.ack_tx.send(AckNack::Defer {
                    delay_seconds: Some(RATE_LIMIT_DEFER_SECONDS),
                });
                continue;
            }
        }

        let permit = match shared.semaphore.acquire().await {
            Ok(p) => p,
            Err(_) => {
                error!(group_id = %group_id, "Pool semaphore closed");
                if let Some(ref key) = task.batch_group_key {
                    shared.finish_batch_group_member(key);
                }
                let _ = task.ack_tx.send(AckNack::Nack { delay_seconds: Some(5) });
                break;
            }
        };

        shared.active_workers.fetch_add(1, Ordering::SeqCst);

        let target = {
            let config = shared.config.read();
            task.pointer
                .resolve_target(config.callback_url.as_deref())
                .map(String::from)
        };

        let started = std::time::Instant::now();
        let outcome = match target {
            Some(ref target) => shared.mediator.mediate(&task.pointer, target).await,
            None => rp_common::MediationOutcome::error_config(
                0,
                format!("no callback URL for pool {}", shared.pool_code),
            ),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let ack_nack = match outcome.result {
            MediationResult::Success => {
                shared.stats.record_success(duration_ms);
                AckNack::Ack
            }
            MediationResult::Deferred => {
                shared.stats.record_deferred(duration_ms);
                AckNack::Defer {
                    delay_seconds: outcome.delay_seconds,
                }
            }
            MediationResult::ErrorConfig => {
                warn!(
                    message_id = %task.pointer.id,
                    error = ?outcome.error_message,
                    "Configuration error, acking to stop redelivery"
                );
                shared.stats.record_failure(duration_ms);
                shared.warn(
                    WarningCategory::Mediation,
                    WarningSeverity::Warning,
                    format!(
                        "Terminal mediation failure for message {}: {}",
                        task.pointer.id,
                        outcome.error_message.as_deref().unwrap_or("unknown")
                    ),
                );
                AckNack::Ack
            }
            MediationResult::ErrorProcess | MediationResult::ErrorConnection => {
                shared.stats.record_failure(duration_ms);
                if let Some(ref key) = task.batch_group_key {
                    if shared.failed_batch_groups.insert(key.clone()) {
                        warn!(batch_group = %key, "Batch+group marked failed, cascading nacks");
                    }
                }
                AckNack::Nack {
                    delay_seconds: outcome.delay_seconds,
                }
            }
            MediationResult::BatchFailed => AckNack::Nack {
                delay_seconds: outcome.delay_seconds,
            },
        };

        let _ = task.ack_tx.send(ack_nack);

        if let Some(ref key) = task.batch_group_key {
            shared.finish_batch_group_member(key);
        }

        shared.active_workers.fetch_sub(1, Ordering::SeqCst);
        drop(permit);
    }

    shared.live_groups.remove(&group_id);
    debug!(group_id = %group_id, pool_code = %shared.pool_code, "Group worker exited");
}
