//! Embedded queue engine.
//!
//! A durable local queue with SQS-like visibility semantics, usable both
//! as a broker in its own right and as a development substitute for a
//! cloud queue. Rows are keyed by an autoincrement id which doubles as the
//! FIFO tiebreaker; a dequeue batch yields at most one row per message
//! group, giving per-group FIFO with cross-group parallelism.
//!
//! Deduplication is publish-side: a `message_deduplication_id` seen within
//! the last five minutes (or a duplicate `message_id`) is reported as a
//! successful, deduplicated publish without inserting a row.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Row, Sqlite};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{
    EmbeddedBroker, PollClock, PublishResult, QueueConsumer, QueueError, QueueMetrics,
    QueuePublisher, Result,
};
use rp_common::{MessagePointer, QueuedMessage};

/// Configuration for the embedded queue engine.
#[derive(Debug, Clone)]
pub struct EmbeddedQueueConfig {
    pub queue_name: String,
    /// Database file path; `None` keeps everything in memory.
    pub db_path: Option<String>,
    pub visibility_timeout: Duration,
    pub dedup_window: Duration,
    /// WAL checkpoint cadence in file-backed mode.
    pub checkpoint_interval: Duration,
}

impl Default for EmbeddedQueueConfig {
    fn default() -> Self {
        Self {
            queue_name: "embedded".to_string(),
            db_path: None,
            visibility_timeout: Duration::from_secs(30),
            dedup_window: Duration::from_secs(300),
            checkpoint_interval: Duration::from_secs(10),
        }
    }
}

/// A dequeued row before it is wrapped into a [`QueuedMessage`].
#[derive(Debug, Clone)]
pub struct DequeuedRow {
    pub id: i64,
    pub message_id: String,
    pub message_group_id: Option<String>,
    pub receipt_handle: String,
    pub receive_count: u32,
    pub pointer: MessagePointer,
}

pub struct EmbeddedQueueEngine {
    pool: Pool<Sqlite>,
    config: EmbeddedQueueConfig,
    running: AtomicBool,
    poll_clock: PollClock,
    total_polled: AtomicU64,
    total_acked: AtomicU64,
    total_nacked: AtomicU64,
    total_deferred: AtomicU64,
}

impl EmbeddedQueueEngine {
    /// Open (or create) the engine. File-backed mode uses WAL journaling;
    /// pass `db_path: None` for an in-memory queue.
    pub async fn open(config: EmbeddedQueueConfig) -> Result<Arc<Self>> {
        let url = match &config.db_path {
            Some(path) => format!("sqlite://{}?mode=rwc", path),
            None => "sqlite::memory:".to_string(),
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await?;

        if config.db_path.is_some() {
            sqlx::query("PRAGMA journal_mode = WAL")
                .execute(&pool)
                .await?;
        }

        let engine = Arc::new(Self {
            pool,
            config,
            running: AtomicBool::new(true),
            poll_clock: PollClock::default(),
            total_polled: AtomicU64::new(0),
            total_acked: AtomicU64::new(0),
            total_nacked: AtomicU64::new(0),
            total_deferred: AtomicU64::new(0),
        });

        engine.create_schema().await?;

        if engine.config.db_path.is_some() {
            engine.clone().spawn_checkpoint_task();
        }

        Ok(engine)
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL UNIQUE,
                message_group_id TEXT,
                message_deduplication_id TEXT,
                message_json TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                visible_at INTEGER NOT NULL,
                receipt_handle TEXT UNIQUE,
                receive_count INTEGER NOT NULL DEFAULT 0,
                first_received_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_queue_group_visible
            ON queue_messages (message_group_id, visible_at, id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_queue_visible
            ON queue_messages (visible_at, id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS message_deduplication (
                message_deduplication_id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_dedup_created
            ON message_deduplication (created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!(queue = %self.config.queue_name, "Embedded queue schema initialized");
        Ok(())
    }

    fn spawn_checkpoint_task(self: Arc<Self>) {
        let interval = self.config.checkpoint_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                    .execute(&self.pool)
                    .await
                {
                    warn!(error = %e, "WAL checkpoint failed");
                }
            }
        });
    }

    fn now_millis() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Publish a single pointer, enforcing the dedup window.
    pub async fn publish_pointer(&self, pointer: &MessagePointer) -> Result<PublishResult> {
        let now = Self::now_millis();
        let dedup_id = pointer.message_deduplication_id.clone();

        self.prune_dedup_window(now).await?;

        if let Some(ref dedup_id) = dedup_id {
            let seen = sqlx::query(
                "SELECT message_id FROM message_deduplication WHERE message_deduplication_id = ?",
            )
            .bind(dedup_id)
            .fetch_optional(&self.pool)
            .await?;

            if seen.is_some() {
                debug!(
                    message_id = %pointer.id,
                    dedup_id = %dedup_id,
                    "Duplicate publish within dedup window"
                );
                return Ok(PublishResult::deduplicated());
            }
        }

        let body = serde_json::to_string(pointer)?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO queue_messages
                (message_id, message_group_id, message_deduplication_id, message_json, created_at, visible_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (message_id) DO NOTHING
            "#,
        )
        .bind(&pointer.id)
        .bind(&pointer.message_group_id)
        .bind(&dedup_id)
        .bind(&body)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            debug!(message_id = %pointer.id, "Duplicate message id, not inserted");
            return Ok(PublishResult::deduplicated());
        }

        if let Some(dedup_id) = dedup_id {
            sqlx::query(
                r#"
                INSERT INTO message_deduplication (message_deduplication_id, message_id, created_at)
                VALUES (?, ?, ?)
                ON CONFLICT (message_deduplication_id) DO UPDATE
                    SET message_id = excluded.message_id, created_at = excluded.created_at
                "#,
            )
            .bind(dedup_id)
            .bind(&pointer.id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        }

        debug!(
            message_id = %pointer.id,
            group = ?pointer.message_group_id,
            "Message published to embedded queue"
        );
        Ok(PublishResult::stored())
    }

    /// Batch publish with one result per message. A storage failure stops
    /// the batch and surfaces the error; earlier messages stay published.
    pub async fn publish_pointers(
        &self,
        pointers: &[MessagePointer],
    ) -> Result<Vec<PublishResult>> {
        let mut results = Vec::with_capacity(pointers.len());
        for pointer in pointers {
            results.push(self.publish_pointer(pointer).await?);
        }
        Ok(results)
    }

    async fn prune_dedup_window(&self, now: i64) -> Result<()> {
        let cutoff = now - self.config.dedup_window.as_millis() as i64;
        sqlx::query("DELETE FROM message_deduplication WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Dequeue up to `max` rows: the oldest visible row of each group not
    /// already yielded in this batch, ordered by row id. Each returned row
    /// gets a fresh receipt handle, its visibility pushed out, its receive
    /// count bumped, and `first_received_at` stamped on first receipt.
    pub async fn dequeue_batch(&self, max: u32) -> Result<Vec<DequeuedRow>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }

        let now = Self::now_millis();
        let new_visible_at = now + self.config.visibility_timeout.as_millis() as i64;

        // Rows without a group order only against themselves, so each is
        // its own partition.
        let rows = sqlx::query(
            r#"
            SELECT id, message_id, message_group_id, message_json, receive_count
            FROM (
                SELECT id, message_id, message_group_id, message_json, receive_count,
                       ROW_NUMBER() OVER (
                           PARTITION BY COALESCE(message_group_id, 'solo:' || id)
                           ORDER BY id
                       ) AS rn
                FROM queue_messages
                WHERE visible_at <= ?
            )
            WHERE rn = 1
            ORDER BY id
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut batch = Vec::with_capacity(rows.len());

        for row in rows {
            let id: i64 = row.get("id");
            let message_id: String = row.get("message_id");
            let message_group_id: Option<String> = row.get("message_group_id");
            let message_json: String = row.get("message_json");
            let receive_count: i64 = row.get("receive_count");

            let receipt_handle = uuid::Uuid::new_v4().to_string();

            let claimed = sqlx::query(
                r#"
                UPDATE queue_messages
                SET receipt_handle = ?,
                    visible_at = ?,
                    receive_count = receive_count + 1,
                    first_received_at = COALESCE(first_received_at, ?)
                WHERE id = ? AND visible_at <= ?
                "#,
            )
            .bind(&receipt_handle)
            .bind(new_visible_at)
            .bind(now)
            .bind(id)
            .bind(now)
            .execute(&self.pool)
            .await?;

            if claimed.rows_affected() == 0 {
                // Another consumer claimed it between select and update.
                continue;
            }

            let pointer: MessagePointer = serde_json::from_str(&message_json)?;

            batch.push(DequeuedRow {
                id,
                message_id,
                message_group_id,
                receipt_handle,
                receive_count: receive_count as u32 + 1,
                pointer,
            });
        }

        if !batch.is_empty() {
            self.total_polled.fetch_add(batch.len() as u64, Ordering::Relaxed);
            debug!(
                queue = %self.config.queue_name,
                count = batch.len(),
                "Dequeued batch from embedded queue"
            );
        }

        Ok(batch)
    }

    /// Approximate pending (visible) row count.
    pub async fn pending_count(&self) -> Result<u64> {
        let now = Self::now_millis();
        let row = sqlx::query("SELECT COUNT(*) AS n FROM queue_messages WHERE visible_at <= ?")
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    /// Approximate in-flight (claimed, invisible) row count.
    pub async fn in_flight_count(&self) -> Result<u64> {
        let now = Self::now_millis();
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM queue_messages WHERE visible_at > ? AND receipt_handle IS NOT NULL",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    /// Final WAL checkpoint and pool close.
    pub async fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        if self.config.db_path.is_some() {
            let _ = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(&self.pool)
                .await;
        }
        self.pool.close().await;
        info!(queue = %self.config.queue_name, "Embedded queue closed");
    }
}

#[async_trait]
impl QueueConsumer for EmbeddedQueueEngine {
    fn identifier(&self) -> &str {
        &self.config.queue_name
    }

    async fn poll(&self, max_messages: u32) -> Result<Vec<QueuedMessage>> {
        let batch = self.dequeue_batch(max_messages).await?;
        self.poll_clock.mark();

        Ok(batch
            .into_iter()
            .map(|row| QueuedMessage {
                broker_message_id: Some(row.id.to_string()),
                receipt_handle: row.receipt_handle,
                queue_identifier: self.config.queue_name.clone(),
                receive_count: row.receive_count,
                pointer: row.pointer,
            })
            .collect())
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM queue_messages WHERE receipt_handle = ?")
            .bind(receipt_handle)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            warn!(receipt_handle = %receipt_handle, "ACK failed, receipt handle unknown or rotated");
            return Err(QueueError::NotFound(receipt_handle.to_string()));
        }

        self.total_acked.fetch_add(1, Ordering::Relaxed);
        debug!(receipt_handle = %receipt_handle, "Message acknowledged");
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()> {
        let delay_ms = delay_seconds.unwrap_or(0) as i64 * 1000;
        let new_visible_at = Self::now_millis() + delay_ms;

        let result = sqlx::query(
            "UPDATE queue_messages SET visible_at = ?, receipt_handle = NULL WHERE receipt_handle = ?",
        )
        .bind(new_visible_at)
        .bind(receipt_handle)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(receipt_handle = %receipt_handle, "NACK failed, receipt handle unknown");
            return Err(QueueError::NotFound(receipt_handle.to_string()));
        }

        self.total_nacked.fetch_add(1, Ordering::Relaxed);
        debug!(
            receipt_handle = %receipt_handle,
            delay_seconds = delay_seconds.unwrap_or(0),
            "Message returned for redelivery"
        );
        Ok(())
    }

    async fn defer(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()> {
        let delay_ms = delay_seconds.unwrap_or(0) as i64 * 1000;
        let new_visible_at = Self::now_millis() + delay_ms;

        let result = sqlx::query(
            "UPDATE queue_messages SET visible_at = ?, receipt_handle = NULL WHERE receipt_handle = ?",
        )
        .bind(new_visible_at)
        .bind(receipt_handle)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(receipt_handle.to_string()));
        }

        self.total_deferred.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn extend_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()> {
        let new_visible_at = Self::now_millis() + seconds as i64 * 1000;

        let result = sqlx::query(
            "UPDATE queue_messages SET visible_at = ? WHERE receipt_handle = ?",
        )
        .bind(new_visible_at)
        .bind(receipt_handle)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(receipt_handle.to_string()));
        }

        debug!(receipt_handle = %receipt_handle, seconds = seconds, "Visibility extended");
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.poll_clock.is_fresh()
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(queue = %self.config.queue_name, "Embedded queue consumer stopped");
    }

    async fn get_metrics(&self) -> Result<Option<QueueMetrics>> {
        Ok(Some(QueueMetrics {
            queue_identifier: self.config.queue_name.clone(),
            pending_messages: self.pending_count().await?,
            in_flight_messages: self.in_flight_count().await?,
            total_polled: self.total_polled.load(Ordering::Relaxed),
            total_acked: self.total_acked.load(Ordering::Relaxed),
            total_nacked: self.total_nacked.load(Ordering::Relaxed),
            total_deferred: self.total_deferred.load(Ordering::Relaxed),
        }))
    }
}

#[async_trait]
impl QueuePublisher for EmbeddedQueueEngine {
    fn identifier(&self) -> &str {
        &self.config.queue_name
    }

    async fn publish(&self, pointer: MessagePointer) -> Result<String> {
        let id = pointer.id.clone();
        self.publish_pointer(&pointer).await?;
        Ok(id)
    }

    async fn publish_batch(&self, pointers: Vec<MessagePointer>) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(pointers.len());
        for pointer in pointers {
            ids.push(self.publish(pointer).await?);
        }
        Ok(ids)
    }
}

#[async_trait]
impl EmbeddedBroker for EmbeddedQueueEngine {
    async fn init_schema(&self) -> Result<()> {
        self.create_schema().await
    }
}

#[async_trait]
impl crate::BrokerProbe for EmbeddedQueueEngine {
    async fn probe(&self) -> std::result::Result<(), crate::BrokerProbeError> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| crate::BrokerProbeError::Unreachable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_test_engine() -> Arc<EmbeddedQueueEngine> {
        EmbeddedQueueEngine::open(EmbeddedQueueConfig {
            queue_name: "test".to_string(),
            ..Default::default()
        })
        .await
        .unwrap()
    }

    fn pointer(id: &str, group: Option<&str>) -> MessagePointer {
        MessagePointer {
            id: id.to_string(),
            pool_code: "DEFAULT".to_string(),
            message_group_id: group.map(String::from),
            message_deduplication_id: None,
            payload: serde_json::json!({"n": id}),
            auth_token: None,
            signing_secret: None,
            callback_url: Some("http://localhost:8080/hook".to_string()),
            correlation_id: None,
            causation_id: None,
        }
    }

    fn pointer_with_dedup(id: &str, dedup: &str) -> MessagePointer {
        let mut p = pointer(id, None);
        p.message_deduplication_id = Some(dedup.to_string());
        p
    }

    #[tokio::test]
    async fn publish_dequeue_ack_round_trip() {
        let engine = open_test_engine().await;

        let result = engine.publish_pointer(&pointer("m-1", None)).await.unwrap();
        assert!(result.success);
        assert!(!result.deduplicated);

        let batch = engine.dequeue_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].message_id, "m-1");
        assert_eq!(batch[0].receive_count, 1);

        engine.ack(&batch[0].receipt_handle).await.unwrap();
        assert_eq!(engine.pending_count().await.unwrap(), 0);
        assert!(engine.dequeue_batch(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_message_id_reported_as_deduplicated() {
        let engine = open_test_engine().await;

        assert!(!engine.publish_pointer(&pointer("m-1", None)).await.unwrap().deduplicated);
        let second = engine.publish_pointer(&pointer("m-1", None)).await.unwrap();
        assert!(second.success);
        assert!(second.deduplicated);

        assert_eq!(engine.dequeue_batch(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dedup_window_suppresses_second_publish() {
        let engine = open_test_engine().await;

        let first = engine.publish_pointer(&pointer_with_dedup("m-1", "dedup-x")).await.unwrap();
        assert!(!first.deduplicated);

        let second = engine.publish_pointer(&pointer_with_dedup("m-2", "dedup-x")).await.unwrap();
        assert!(second.success);
        assert!(second.deduplicated);

        // Exactly one persisted row
        let batch = engine.dequeue_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].message_id, "m-1");
    }

    #[tokio::test]
    async fn batch_publish_reports_per_message_results() {
        let engine = open_test_engine().await;

        let results = engine
            .publish_pointers(&[
                pointer_with_dedup("m-1", "d-1"),
                pointer_with_dedup("m-2", "d-1"),
                pointer("m-3", None),
            ])
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert!(!results[0].deduplicated);
        assert!(results[1].deduplicated);
        assert!(!results[2].deduplicated);
        assert!(results.iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn nack_delays_redelivery() {
        let engine = open_test_engine().await;
        engine.publish_pointer(&pointer("m-1", None)).await.unwrap();

        let batch = engine.dequeue_batch(10).await.unwrap();
        engine.nack(&batch[0].receipt_handle, Some(60)).await.unwrap();

        assert!(engine.dequeue_batch(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn nack_without_delay_makes_message_visible() {
        let engine = open_test_engine().await;
        engine.publish_pointer(&pointer("m-1", None)).await.unwrap();

        let batch = engine.dequeue_batch(10).await.unwrap();
        let old_handle = batch[0].receipt_handle.clone();
        engine.nack(&old_handle, None).await.unwrap();

        let redelivered = engine.dequeue_batch(10).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].receive_count, 2);
        // Receipt handle rotates on redelivery
        assert_ne!(redelivered[0].receipt_handle, old_handle);
        // The old handle is dead
        assert!(engine.ack(&old_handle).await.is_err());
    }

    #[tokio::test]
    async fn group_yields_at_most_one_row_per_batch() {
        let engine = open_test_engine().await;

        // Insertion order fixes ids 1..=6
        engine.publish_pointer(&pointer("m-1", Some("A"))).await.unwrap();
        engine.publish_pointer(&pointer("m-2", Some("B"))).await.unwrap();
        engine.publish_pointer(&pointer("m-3", Some("A"))).await.unwrap();
        engine.publish_pointer(&pointer("m-4", Some("A"))).await.unwrap();
        engine.publish_pointer(&pointer("m-5", Some("B"))).await.unwrap();
        engine.publish_pointer(&pointer("m-6", Some("C"))).await.unwrap();

        let batch = engine.dequeue_batch(3).await.unwrap();
        let ids: Vec<i64> = batch.iter().map(|r| r.id).collect();
        let groups: Vec<Option<String>> = batch.iter().map(|r| r.message_group_id.clone()).collect();
        assert_eq!(ids, vec![1, 2, 6]);
        assert_eq!(
            groups,
            vec![Some("A".to_string()), Some("B".to_string()), Some("C".to_string())]
        );

        for row in &batch {
            engine.ack(&row.receipt_handle).await.unwrap();
        }

        let next = engine.dequeue_batch(3).await.unwrap();
        let ids: Vec<i64> = next.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 5]);
    }

    #[tokio::test]
    async fn extend_visibility_keeps_message_invisible() {
        let engine = open_test_engine().await;
        engine.publish_pointer(&pointer("m-1", None)).await.unwrap();

        let batch = engine.dequeue_batch(10).await.unwrap();
        engine
            .extend_visibility(&batch[0].receipt_handle, 120)
            .await
            .unwrap();

        assert!(engine.dequeue_batch(10).await.unwrap().is_empty());
        assert_eq!(engine.in_flight_count().await.unwrap(), 1);
    }
}
