//! Crash recovery for stranded IN_PROGRESS items.
//!
//! Runs at startup and then on an interval: any item that has sat in
//! IN_PROGRESS past the processing timeout is returned to PENDING with its
//! retry count untouched.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::repository::OutboxRepository;
use rp_common::OutboxItemType;

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub enabled: bool,
    pub check_interval: Duration,
    /// IN_PROGRESS older than this is considered stranded.
    pub processing_timeout: Duration,
    pub sweep_limit: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: Duration::from_millis(60_000),
            processing_timeout: Duration::from_secs(600),
            sweep_limit: 1000,
        }
    }
}

pub struct RecoveryTask {
    repository: Arc<dyn OutboxRepository>,
    config: RecoveryConfig,
}

impl RecoveryTask {
    pub fn new(repository: Arc<dyn OutboxRepository>, config: RecoveryConfig) -> Self {
        Self { repository, config }
    }

    /// One sweep across all item types. Returns the number recovered.
    pub async fn recover_once(&self) -> u64 {
        let mut total = 0u64;

        for item_type in OutboxItemType::ALL {
            match self
                .repository
                .reset_stuck_in_progress(item_type, self.config.processing_timeout, self.config.sweep_limit)
                .await
            {
                Ok(count) => total += count,
                Err(e) => error!(item_type = %item_type, error = %e, "Recovery sweep failed"),
            }
        }

        if total > 0 {
            info!(recovered = total, "Recovered stranded outbox items");
        } else {
            debug!("Recovery sweep found nothing stranded");
        }

        total
    }

    /// Run forever on the configured cadence.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Outbox recovery disabled");
            return;
        }

        info!(
            interval_ms = self.config.check_interval.as_millis() as u64,
            timeout_secs = self.config.processing_timeout.as_secs(),
            "Starting outbox recovery task"
        );

        let mut ticker = interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            self.recover_once().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteOutboxRepository;
    use chrono::{Duration as ChronoDuration, Utc};
    use rp_common::{OutboxItem, OutboxStatus};
    use sqlx::sqlite::SqlitePoolOptions;

    #[tokio::test]
    async fn stale_in_progress_items_reset_to_pending() {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let repository = Arc::new(SqliteOutboxRepository::new(pool));
        repository.init_schema().await.unwrap();

        // Stuck two hours ago with a 600s timeout
        let stale = OutboxItem {
            id: "i-7".to_string(),
            item_type: OutboxItemType::Event,
            message_group: None,
            payload: serde_json::json!({}),
            status: OutboxStatus::InProgress,
            retry_count: 2,
            max_retries: 3,
            error_message: None,
            created_at: Utc::now() - ChronoDuration::hours(3),
            updated_at: Some(Utc::now() - ChronoDuration::hours(2)),
        };
        repository.insert_item(&stale).await.unwrap();

        // Freshly in progress, must not be touched
        let fresh = OutboxItem {
            id: "i-8".to_string(),
            updated_at: Some(Utc::now()),
            ..stale.clone()
        };
        repository.insert_item(&fresh).await.unwrap();

        let task = RecoveryTask::new(
            repository.clone(),
            RecoveryConfig {
                processing_timeout: Duration::from_secs(600),
                ..Default::default()
            },
        );

        let recovered = task.recover_once().await;
        assert_eq!(recovered, 1);

        let stale_after = repository
            .get_item(OutboxItemType::Event, "i-7")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stale_after.status, OutboxStatus::Pending);
        // Recovery is not a retry
        assert_eq!(stale_after.retry_count, 2);

        let fresh_after = repository
            .get_item(OutboxItemType::Event, "i-8")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fresh_after.status, OutboxStatus::InProgress);
    }
}
