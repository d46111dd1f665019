//! Customer-side outbox processor.
//!
//! Polls customer-owned outbox tables, groups items by (type, group),
//! batches them to the platform endpoints with at most one in-flight batch
//! per group, and drives retry and terminal status transitions with crash
//! recovery.

pub mod buffer;
pub mod dispatcher;
pub mod distributor;
pub mod group_processor;
pub mod processor;
pub mod recovery;
pub mod repository;

#[cfg(feature = "sqlite")]
pub mod sqlite;
#[cfg(feature = "postgres")]
pub mod postgres;

use thiserror::Error;

pub use buffer::{BufferFullError, GlobalBuffer, GlobalBufferConfig};
pub use dispatcher::{
    BatchDispatcher, DispatchPanic, HttpBatchDispatcher, HttpBatchDispatcherConfig,
    OutboxDispatchResult,
};
pub use distributor::{DistributorStats, GroupDistributor, GroupDistributorConfig};
pub use group_processor::{GroupProcessorConfig, InFlightRelease, MessageGroupProcessor};
pub use processor::{OutboxProcessor, OutboxProcessorConfig, ProcessorMetrics};
pub use recovery::{RecoveryConfig, RecoveryTask};
pub use repository::{OutboxRepository, OutboxTableConfig};

#[derive(Error, Debug)]
pub enum OutboxError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("dispatch error: {0}")]
    Dispatch(String),

    #[error("configuration error: {0}")]
    Config(String),
}

#[cfg(any(feature = "sqlite", feature = "postgres"))]
impl From<sqlx::Error> for OutboxError {
    fn from(e: sqlx::Error) -> Self {
        OutboxError::Storage(e.to_string())
    }
}
