//! SQLite outbox repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use tracing::{debug, info};

use crate::repository::{OutboxRepository, OutboxTableConfig, Result};
use rp_common::{OutboxItem, OutboxItemType, OutboxStatus};

pub struct SqliteOutboxRepository {
    pool: SqlitePool,
    table_config: OutboxTableConfig,
}

impl SqliteOutboxRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            table_config: OutboxTableConfig::default(),
        }
    }

    pub fn with_config(pool: SqlitePool, table_config: OutboxTableConfig) -> Self {
        Self { pool, table_config }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn placeholders(count: usize) -> String {
        vec!["?"; count].join(", ")
    }

    fn parse_row(row: &sqlx::sqlite::SqliteRow, item_type: OutboxItemType) -> Result<OutboxItem> {
        let created_at_ms: i64 = row.get("created_at");
        let created_at = DateTime::from_timestamp_millis(created_at_ms)
            .unwrap_or_else(Utc::now);
        let updated_at: Option<DateTime<Utc>> = row
            .try_get::<Option<i64>, _>("updated_at")
            .ok()
            .flatten()
            .and_then(DateTime::from_timestamp_millis);

        let payload: String = row.get("payload");

        Ok(OutboxItem {
            id: row.get("id"),
            item_type,
            message_group: row.try_get("message_group").ok(),
            payload: serde_json::from_str(&payload)?,
            status: OutboxStatus::from_code(row.get::<i32, _>("status")),
            retry_count: row.get::<i32, _>("retry_count"),
            max_retries: row.get::<i32, _>("max_retries"),
            error_message: row.try_get("error_message").ok().flatten(),
            created_at,
            updated_at,
        })
    }
}

#[async_trait]
impl OutboxRepository for SqliteOutboxRepository {
    async fn fetch_pending(&self, item_type: OutboxItemType, limit: u32) -> Result<Vec<OutboxItem>> {
        let table = self.table_config.table_for(item_type);
        let query = format!(
            "SELECT id, message_group, payload, status, retry_count, max_retries, error_message, created_at, updated_at \
             FROM {table} WHERE status = ? ORDER BY message_group, created_at LIMIT ?"
        );

        let rows = sqlx::query(&query)
            .bind(OutboxStatus::Pending.code())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            items.push(Self::parse_row(row, item_type)?);
        }

        debug!(table = %table, count = items.len(), "Fetched pending outbox items");
        Ok(items)
    }

    async fn mark_in_progress(&self, item_type: OutboxItemType, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let table = self.table_config.table_for(item_type);
        let query = format!(
            "UPDATE {table} SET status = ?, updated_at = ? WHERE id IN ({})",
            Self::placeholders(ids.len())
        );

        let mut q = sqlx::query(&query)
            .bind(OutboxStatus::InProgress.code())
            .bind(Utc::now().timestamp_millis());
        for id in ids {
            q = q.bind(id);
        }
        q.execute(&self.pool).await?;
        Ok(())
    }

    async fn mark_with_status(
        &self,
        item_type: OutboxItemType,
        ids: &[String],
        status: OutboxStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let table = self.table_config.table_for(item_type);
        let query = format!(
            "UPDATE {table} SET status = ?, error_message = ?, updated_at = ? WHERE id IN ({})",
            Self::placeholders(ids.len())
        );

        let mut q = sqlx::query(&query)
            .bind(status.code())
            .bind(error_message)
            .bind(Utc::now().timestamp_millis());
        for id in ids {
            q = q.bind(id);
        }
        q.execute(&self.pool).await?;

        debug!(table = %table, status = ?status, count = ids.len(), "Marked outbox items");
        Ok(())
    }

    async fn increment_retry(&self, item_type: OutboxItemType, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let table = self.table_config.table_for(item_type);
        let query = format!(
            "UPDATE {table} SET retry_count = retry_count + 1, status = ?, updated_at = ? WHERE id IN ({})",
            Self::placeholders(ids.len())
        );

        let mut q = sqlx::query(&query)
            .bind(OutboxStatus::Pending.code())
            .bind(Utc::now().timestamp_millis());
        for id in ids {
            q = q.bind(id);
        }
        q.execute(&self.pool).await?;
        Ok(())
    }

    async fn reset_stuck_in_progress(
        &self,
        item_type: OutboxItemType,
        stale_after: Duration,
        limit: u32,
    ) -> Result<u64> {
        let table = self.table_config.table_for(item_type);
        let cutoff = Utc::now().timestamp_millis() - stale_after.as_millis() as i64;

        // Retry counts are untouched: recovery is not a retry.
        let query = format!(
            "UPDATE {table} SET status = ?, updated_at = ? \
             WHERE id IN (SELECT id FROM {table} WHERE status = ? AND updated_at < ? LIMIT ?)"
        );

        let result = sqlx::query(&query)
            .bind(OutboxStatus::Pending.code())
            .bind(Utc::now().timestamp_millis())
            .bind(OutboxStatus::InProgress.code())
            .bind(cutoff)
            .bind(limit)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn get_item(&self, item_type: OutboxItemType, id: &str) -> Result<Option<OutboxItem>> {
        let table = self.table_config.table_for(item_type);
        let query = format!(
            "SELECT id, message_group, payload, status, retry_count, max_retries, error_message, created_at, updated_at \
             FROM {table} WHERE id = ?"
        );

        let row = sqlx::query(&query).bind(id).fetch_optional(&self.pool).await?;
        row.map(|r| Self::parse_row(&r, item_type)).transpose()
    }

    async fn init_schema(&self) -> Result<()> {
        for item_type in OutboxItemType::ALL {
            let table = self.table_config.table_for(item_type);
            let schema = format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT PRIMARY KEY,
                    message_group TEXT,
                    payload TEXT NOT NULL,
                    status INTEGER NOT NULL DEFAULT 0,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    max_retries INTEGER NOT NULL DEFAULT 3,
                    error_message TEXT,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER
                )
                "#
            );
            sqlx::query(&schema).execute(&self.pool).await?;

            let index = format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_poll ON {table} (status, message_group, created_at)"
            );
            sqlx::query(&index).execute(&self.pool).await?;
        }

        info!("SQLite outbox schema initialized");
        Ok(())
    }

    fn table_config(&self) -> &OutboxTableConfig {
        &self.table_config
    }
}

/// Test/dev helper for inserting items.
impl SqliteOutboxRepository {
    pub async fn insert_item(&self, item: &OutboxItem) -> Result<()> {
        let table = self.table_config.table_for(item.item_type);
        let query = format!(
            "INSERT INTO {table} (id, message_group, payload, status, retry_count, max_retries, error_message, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );

        sqlx::query(&query)
            .bind(&item.id)
            .bind(&item.message_group)
            .bind(serde_json::to_string(&item.payload)?)
            .bind(item.status.code())
            .bind(item.retry_count)
            .bind(item.max_retries)
            .bind(&item.error_message)
            .bind(item.created_at.timestamp_millis())
            .bind(item.updated_at.map(|t| t.timestamp_millis()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
