//! Bounded global buffer between the poller and the group distributor.
//!
//! A full buffer rejects rather than drops: the rejected item is already
//! IN_PROGRESS in the database and the recovery sweep returns it to
//! PENDING after the processing timeout.

use std::collections::VecDeque;
use std::fmt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use rp_common::OutboxItem;

#[derive(Debug, Clone)]
pub struct BufferFullError {
    pub item_id: String,
}

impl fmt::Display for BufferFullError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "global buffer full, item {} rejected (stays IN_PROGRESS until recovery)",
            self.item_id
        )
    }
}

impl std::error::Error for BufferFullError {}

#[derive(Debug, Clone)]
pub struct GlobalBufferConfig {
    pub max_size: usize,
    pub drain_batch_size: usize,
}

impl Default for GlobalBufferConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            drain_batch_size: 100,
        }
    }
}

pub struct GlobalBuffer {
    config: GlobalBufferConfig,
    items: Mutex<VecDeque<OutboxItem>>,
}

impl GlobalBuffer {
    pub fn new(config: GlobalBufferConfig) -> Self {
        Self {
            config,
            items: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn push(&self, item: OutboxItem) -> Result<(), BufferFullError> {
        let mut items = self.items.lock().await;
        if items.len() >= self.config.max_size {
            warn!(
                capacity = self.config.max_size,
                item_id = %item.id,
                "Global buffer full, rejecting item"
            );
            return Err(BufferFullError { item_id: item.id });
        }
        items.push_back(item);
        Ok(())
    }

    pub async fn drain_batch(&self) -> Vec<OutboxItem> {
        let mut items = self.items.lock().await;
        let count = items.len().min(self.config.drain_batch_size);
        let batch: Vec<OutboxItem> = items.drain(..count).collect();
        if !batch.is_empty() {
            debug!(count = batch.len(), "Drained items from global buffer");
        }
        batch
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rp_common::{OutboxItemType, OutboxStatus};

    fn item(id: &str) -> OutboxItem {
        OutboxItem {
            id: id.to_string(),
            item_type: OutboxItemType::Event,
            message_group: None,
            payload: serde_json::json!({}),
            status: OutboxStatus::InProgress,
            retry_count: 0,
            max_retries: 3,
            error_message: None,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn push_and_drain_in_order() {
        let buffer = GlobalBuffer::new(GlobalBufferConfig {
            max_size: 100,
            drain_batch_size: 10,
        });

        for i in 0..25 {
            buffer.push(item(&format!("i-{i}"))).await.unwrap();
        }
        assert_eq!(buffer.len().await, 25);

        let batch = buffer.drain_batch().await;
        assert_eq!(batch.len(), 10);
        assert_eq!(batch[0].id, "i-0");
        assert_eq!(buffer.len().await, 15);
    }

    #[tokio::test]
    async fn overflow_rejects() {
        let buffer = GlobalBuffer::new(GlobalBufferConfig {
            max_size: 3,
            drain_batch_size: 2,
        });

        for i in 0..3 {
            buffer.push(item(&format!("i-{i}"))).await.unwrap();
        }
        let err = buffer.push(item("overflow")).await.unwrap_err();
        assert_eq!(err.item_id, "overflow");
    }
}
