//! PostgreSQL outbox repository for customer databases.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::{debug, info};

use crate::repository::{OutboxRepository, OutboxTableConfig, Result};
use rp_common::{OutboxItem, OutboxItemType, OutboxStatus};

pub struct PostgresOutboxRepository {
    pool: PgPool,
    table_config: OutboxTableConfig,
}

impl PostgresOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            table_config: OutboxTableConfig::default(),
        }
    }

    pub fn with_config(pool: PgPool, table_config: OutboxTableConfig) -> Self {
        Self { pool, table_config }
    }

    fn placeholders(count: usize, start: usize) -> String {
        (0..count)
            .map(|i| format!("${}", start + i))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn parse_row(row: &sqlx::postgres::PgRow, item_type: OutboxItemType) -> Result<OutboxItem> {
        let payload: serde_json::Value = row.get("payload");

        Ok(OutboxItem {
            id: row.get("id"),
            item_type,
            message_group: row.try_get("message_group").ok(),
            payload,
            status: OutboxStatus::from_code(row.get::<i32, _>("status")),
            retry_count: row.get::<i32, _>("retry_count"),
            max_retries: row.get::<i32, _>("max_retries"),
            error_message: row.try_get("error_message").ok().flatten(),
            created_at: row.get::<DateTime<Utc>, _>("created_at"),
            updated_at: row.try_get("updated_at").ok(),
        })
    }
}

#[async_trait]
impl OutboxRepository for PostgresOutboxRepository {
    async fn fetch_pending(&self, item_type: OutboxItemType, limit: u32) -> Result<Vec<OutboxItem>> {
        let table = self.table_config.table_for(item_type);
        let query = format!(
            "SELECT id, message_group, payload, status, retry_count, max_retries, error_message, created_at, updated_at \
             FROM {table} WHERE status = $1 ORDER BY message_group, created_at LIMIT $2"
        );

        let rows = sqlx::query(&query)
            .bind(OutboxStatus::Pending.code())
            .bind(limit as i64)
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
            "UPDATE {table} SET status = $1, updated_at = NOW() WHERE id IN ({})",
            Self::placeholders(ids.len(), 2)
        );

        let mut q = sqlx::query(&query).bind(OutboxStatus::InProgress.code());
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
            "UPDATE {table} SET status = $1, error_message = $2, updated_at = NOW() WHERE id IN ({})",
            Self::placeholders(ids.len(), 3)
        );

        let mut q = sqlx::query(&query).bind(status.code()).bind(error_message);
        for id in ids {
            q = q.bind(id);
        }
        q.execute(&self.pool).await?;
        Ok(())
    }

    async fn increment_retry(&self, item_type: OutboxItemType, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let table = self.table_config.table_for(item_type);
        let query = format!(
            "UPDATE {table} SET retry_count = retry_count + 1, status = $1, updated_at = NOW() WHERE id IN ({})",
            Self::placeholders(ids.len(), 2)
        );

        let mut q = sqlx::query(&query).bind(OutboxStatus::Pending.code());
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
        let query = format!(
            "UPDATE {table} SET status = $1, updated_at = NOW() \
             WHERE id IN (SELECT id FROM {table} WHERE status = $2 AND updated_at < NOW() - $3::interval LIMIT $4)"
        );

        let interval = format!("{} seconds", stale_after.as_secs());
        let result = sqlx::query(&query)
            .bind(OutboxStatus::Pending.code())
            .bind(OutboxStatus::InProgress.code())
            .bind(interval)
            .bind(limit as i64)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn get_item(&self, item_type: OutboxItemType, id: &str) -> Result<Option<OutboxItem>> {
        let table = self.table_config.table_for(item_type);
        let query = format!(
            "SELECT id, message_group, payload, status, retry_count, max_retries, error_message, created_at, updated_at \
             FROM {table} WHERE id = $1"
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
                    payload JSONB NOT NULL,
                    status INTEGER NOT NULL DEFAULT 0,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    max_retries INTEGER NOT NULL DEFAULT 3,
                    error_message TEXT,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMPTZ
                )
                "#
            );
            sqlx::query(&schema).execute(&self.pool).await?;

            let index = format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_poll ON {table} (status, message_group, created_at)"
            );
            sqlx::query(&index).execute(&self.pool).await?;
        }

        info!("PostgreSQL outbox schema initialized");
        Ok(())
    }

    fn table_config(&self) -> &OutboxTableConfig {
        &self.table_config
    }
}
