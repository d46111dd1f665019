//! Outbox persistence interface.
//!
//! One table per item type in the customer database. Items move
//! PENDING → IN_PROGRESS → terminal/SUCCESS, with IN_PROGRESS doubling as
//! the crash-recovery marker.

use async_trait::async_trait;
use std::time::Duration;

use crate::OutboxError;
use rp_common::{OutboxItem, OutboxItemType, OutboxStatus};

pub type Result<T> = std::result::Result<T, OutboxError>;

#[derive(Debug, Clone)]
pub struct OutboxTableConfig {
    pub events_table: String,
    pub dispatch_jobs_table: String,
    pub audit_logs_table: String,
}

impl Default for OutboxTableConfig {
    fn default() -> Self {
        Self {
            events_table: "outbox_events".to_string(),
            dispatch_jobs_table: "outbox_dispatch_jobs".to_string(),
            audit_logs_table: "outbox_audit_logs".to_string(),
        }
    }
}

impl OutboxTableConfig {
    pub fn table_for(&self, item_type: OutboxItemType) -> &str {
        match item_type {
            OutboxItemType::Event => &self.events_table,
            OutboxItemType::DispatchJob => &self.dispatch_jobs_table,
            OutboxItemType::AuditLog => &self.audit_logs_table,
        }
    }
}

#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Fetch PENDING items ordered by (message_group, created_at) so a
    /// poll batch never interleaves a group out of order.
    async fn fetch_pending(&self, item_type: OutboxItemType, limit: u32) -> Result<Vec<OutboxItem>>;

    /// Set status = IN_PROGRESS. Happens before buffering so a crash
    /// between fetch and dispatch is recoverable.
    async fn mark_in_progress(&self, item_type: OutboxItemType, ids: &[String]) -> Result<()>;

    async fn mark_with_status(
        &self,
        item_type: OutboxItemType,
        ids: &[String],
        status: OutboxStatus,
        error_message: Option<&str>,
    ) -> Result<()>;

    /// retry_count += 1 and back to PENDING.
    async fn increment_retry(&self, item_type: OutboxItemType, ids: &[String]) -> Result<()>;

    /// Reset IN_PROGRESS rows older than `stale_after` back to PENDING
    /// without touching retry counts. Returns how many were reset.
    async fn reset_stuck_in_progress(
        &self,
        item_type: OutboxItemType,
        stale_after: Duration,
        limit: u32,
    ) -> Result<u64>;

    /// Fetch one item by id, mostly for tests and diagnostics.
    async fn get_item(&self, item_type: OutboxItemType, id: &str) -> Result<Option<OutboxItem>>;

    async fn init_schema(&self) -> Result<()>;

    fn table_config(&self) -> &OutboxTableConfig;
}
