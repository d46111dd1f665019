//! Broker consumers and the embedded queue engine.
//!
//! Every broker exposes the same pull-based [`QueueConsumer`] surface:
//! poll a batch, then ack/nack/defer individual receipt handles. The
//! router's manager owns the poll loops; consumers only translate the
//! trait operations into broker calls.

use async_trait::async_trait;
use rp_common::{MessagePointer, QueuedMessage};

pub mod error;

#[cfg(feature = "embedded")]
pub mod embedded;

#[cfg(feature = "sqs")]
pub mod sqs;

#[cfg(feature = "jetstream")]
pub mod jetstream;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use error::QueueError;

pub type Result<T> = std::result::Result<T, QueueError>;

/// How long a consumer may go without a successful poll before it is
/// considered stale.
pub const STALE_POLL_THRESHOLD_SECS: u64 = 60;

/// Broker-side queue depth and throughput counters.
#[derive(Debug, Clone, Default)]
pub struct QueueMetrics {
    pub queue_identifier: String,
    /// Approximate visible (pending) messages.
    pub pending_messages: u64,
    /// Approximate messages dequeued but not yet acked/nacked.
    pub in_flight_messages: u64,
    pub total_polled: u64,
    pub total_acked: u64,
    pub total_nacked: u64,
    pub total_deferred: u64,
}

/// Result of publishing one message to the embedded queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishResult {
    pub success: bool,
    /// True when the message was suppressed by the dedup window or by a
    /// duplicate message id. A deduplicated publish is still a success.
    pub deduplicated: bool,
}

impl PublishResult {
    pub fn stored() -> Self {
        Self { success: true, deduplicated: false }
    }

    pub fn deduplicated() -> Self {
        Self { success: true, deduplicated: true }
    }
}

/// Pull-based queue consumer.
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    fn identifier(&self) -> &str;

    /// Fetch up to `max_messages`. An empty result is normal.
    async fn poll(&self, max_messages: u32) -> Result<Vec<QueuedMessage>>;

    /// Remove a message from the queue.
    async fn ack(&self, receipt_handle: &str) -> Result<()>;

    /// Return a message for redelivery after the optional delay. Counted
    /// as a failure in metrics.
    async fn nack(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()>;

    /// Same broker operation as `nack` but for backpressure (rate limits,
    /// capacity, deferrals) — never counted as a failure.
    async fn defer(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()> {
        self.nack(receipt_handle, delay_seconds).await
    }

    /// Push the visibility deadline out for a long-running message.
    async fn extend_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()>;

    /// Healthy iff running and the last poll is recent (or no poll has
    /// happened yet since start).
    fn is_healthy(&self) -> bool;

    /// Stop delivering new batches. In-flight messages run to completion.
    async fn stop(&self);

    async fn get_metrics(&self) -> Result<Option<QueueMetrics>> {
        Ok(None)
    }
}

/// Queue publisher.
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    fn identifier(&self) -> &str;

    async fn publish(&self, pointer: MessagePointer) -> Result<String>;

    async fn publish_batch(&self, pointers: Vec<MessagePointer>) -> Result<Vec<String>>;
}

/// Liveness probe against a broker, used by the broker health monitor.
/// Implementations do the cheapest roundtrip the broker supports (list
/// queues, connect and drain, connect and close).
#[async_trait]
pub trait BrokerProbe: Send + Sync {
    async fn probe(&self) -> std::result::Result<(), BrokerProbeError>;
}

/// Probe failure classification.
#[derive(Debug, thiserror::Error)]
pub enum BrokerProbeError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("probe timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("probe failed: {0}")]
    Unknown(String),
}

/// Combined consumer + publisher, used by the embedded/dev broker.
#[async_trait]
pub trait EmbeddedBroker: QueueConsumer + QueuePublisher {
    async fn init_schema(&self) -> Result<()>;
}

/// Shared last-poll tracking for the staleness half of the health contract.
#[derive(Debug, Default)]
pub(crate) struct PollClock {
    last_poll: parking_lot::Mutex<Option<std::time::Instant>>,
}

impl PollClock {
    pub(crate) fn mark(&self) {
        *self.last_poll.lock() = Some(std::time::Instant::now());
    }

    /// True when no poll has happened yet, or the last one is recent.
    pub(crate) fn is_fresh(&self) -> bool {
        match *self.last_poll.lock() {
            None => true,
            Some(t) => t.elapsed().as_secs() < STALE_POLL_THRESHOLD_SECS,
        }
    }
}
