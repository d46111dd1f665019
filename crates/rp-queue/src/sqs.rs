//! Cloud pull consumer backed by AWS SQS.
//!
//! Ack deletes the message; nack and defer rewrite its visibility timeout.

use async_trait::async_trait;
use aws_sdk_sqs::types::{Message as SqsMessage, MessageSystemAttributeName, QueueAttributeName};
use aws_sdk_sqs::Client;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, info};

use crate::{
    BrokerProbe, BrokerProbeError, PollClock, QueueConsumer, QueueError, QueueMetrics,
    QueuePublisher, Result,
};
use rp_common::{MessagePointer, QueuedMessage};

pub struct SqsQueueConsumer {
    client: Client,
    queue_url: String,
    queue_name: String,
    visibility_timeout_seconds: i32,
    wait_time_seconds: i32,
    running: AtomicBool,
    poll_clock: PollClock,
    total_polled: AtomicU64,
    total_acked: AtomicU64,
    total_nacked: AtomicU64,
    total_deferred: AtomicU64,
}

impl SqsQueueConsumer {
    /// Long-poll wait. Five seconds keeps shutdown responsive; the SQS
    /// maximum is 20.
    pub const DEFAULT_WAIT_TIME_SECONDS: i32 = 5;

    pub fn new(
        client: Client,
        queue_url: String,
        queue_name: String,
        visibility_timeout_seconds: i32,
    ) -> Self {
        Self {
            client,
            queue_url,
            queue_name,
            visibility_timeout_seconds,
            wait_time_seconds: Self::DEFAULT_WAIT_TIME_SECONDS,
            running: AtomicBool::new(true),
            poll_clock: PollClock::default(),
            total_polled: AtomicU64::new(0),
            total_acked: AtomicU64::new(0),
            total_nacked: AtomicU64::new(0),
            total_deferred: AtomicU64::new(0),
        }
    }

    pub fn from_queue_url(client: Client, queue_url: String, visibility_timeout_seconds: i32) -> Self {
        let queue_name = queue_url.rsplit('/').next().unwrap_or("unknown").to_string();
        Self::new(client, queue_url, queue_name, visibility_timeout_seconds)
    }

    pub fn with_wait_time_seconds(mut self, seconds: i32) -> Self {
        self.wait_time_seconds = seconds.clamp(0, 20);
        self
    }

    fn parse_message(&self, sqs_msg: &SqsMessage) -> Result<QueuedMessage> {
        let body = sqs_msg
            .body()
            .ok_or_else(|| QueueError::Broker("message body is empty".to_string()))?;

        let pointer: MessagePointer = serde_json::from_str(body)?;

        let receipt_handle = sqs_msg
            .receipt_handle()
            .ok_or_else(|| QueueError::Broker("missing receipt handle".to_string()))?
            .to_string();

        let receive_count = sqs_msg
            .attributes()
            .and_then(|a| a.get(&MessageSystemAttributeName::ApproximateReceiveCount))
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);

        Ok(QueuedMessage {
            pointer,
            receipt_handle,
            broker_message_id: sqs_msg.message_id().map(String::from),
            queue_identifier: self.queue_name.clone(),
            receive_count,
        })
    }
}

#[async_trait]
impl QueueConsumer for SqsQueueConsumer {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn poll(&self, max_messages: u32) -> Result<Vec<QueuedMessage>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }

        let result = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages.min(10) as i32) // SQS batch cap
            .visibility_timeout(self.visibility_timeout_seconds)
            .wait_time_seconds(self.wait_time_seconds)
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;

        self.poll_clock.mark();

        let sqs_messages = result.messages.unwrap_or_default();
        let mut messages = Vec::with_capacity(sqs_messages.len());

        for sqs_msg in sqs_messages {
            match self.parse_message(&sqs_msg) {
                Ok(msg) => messages.push(msg),
                Err(e) => {
                    error!(queue = %self.queue_name, error = %e, "Unparseable SQS message, deleting");
                    // A malformed body would redeliver forever otherwise
                    if let Some(handle) = sqs_msg.receipt_handle() {
                        let _ = self.ack(handle).await;
                    }
                }
            }
        }

        if !messages.is_empty() {
            self.total_polled.fetch_add(messages.len() as u64, Ordering::Relaxed);
            debug!(queue = %self.queue_name, count = messages.len(), "Polled messages from SQS");
        }

        Ok(messages)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;

        self.total_acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(delay_seconds.unwrap_or(0) as i32)
            .send()
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;

        self.total_nacked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn defer(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(delay_seconds.unwrap_or(0) as i32)
            .send()
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;

        self.total_deferred.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn extend_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(seconds as i32)
            .send()
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.poll_clock.is_fresh()
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(queue = %self.queue_name, "SQS consumer stopped");
    }

    async fn get_metrics(&self) -> Result<Option<QueueMetrics>> {
        let result = self
            .client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
            .send()
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;

        let attributes = result.attributes();

        let pending_messages = attributes
            .and_then(|attrs| attrs.get(&QueueAttributeName::ApproximateNumberOfMessages))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let in_flight_messages = attributes
            .and_then(|attrs| attrs.get(&QueueAttributeName::ApproximateNumberOfMessagesNotVisible))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        Ok(Some(QueueMetrics {
            queue_identifier: self.queue_name.clone(),
            pending_messages,
            in_flight_messages,
            total_polled: self.total_polled.load(Ordering::Relaxed),
            total_acked: self.total_acked.load(Ordering::Relaxed),
            total_nacked: self.total_nacked.load(Ordering::Relaxed),
            total_deferred: self.total_deferred.load(Ordering::Relaxed),
        }))
    }
}

/// Publisher companion to the consumer. FIFO queues get the group and
/// dedup keys from the pointer.
pub struct SqsQueuePublisher {
    client: Client,
    queue_url: String,
}

impl SqsQueuePublisher {
    pub fn new(client: Client, queue_url: String) -> Self {
        Self { client, queue_url }
    }
}

#[async_trait]
impl QueuePublisher for SqsQueuePublisher {
    fn identifier(&self) -> &str {
        &self.queue_url
    }

    async fn publish(&self, pointer: MessagePointer) -> Result<String> {
        let message_id = pointer.id.clone();
        let body = serde_json::to_string(&pointer)?;

        let mut request = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body);

        if self.queue_url.ends_with(".fifo") {
            let group_id = pointer
                .message_group_id
                .clone()
                .unwrap_or_else(|| "default".to_string());
            let dedup_id = pointer
                .message_deduplication_id
                .clone()
                .unwrap_or_else(|| message_id.clone());
            request = request.message_group_id(group_id).message_deduplication_id(dedup_id);
        }

        request
            .send()
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;

        Ok(message_id)
    }

    async fn publish_batch(&self, pointers: Vec<MessagePointer>) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(pointers.len());
        for pointer in pointers {
            ids.push(self.publish(pointer).await?);
        }
        Ok(ids)
    }
}

/// Probe that lists queue attributes; the cheapest authenticated roundtrip.
pub struct SqsBrokerProbe {
    client: Client,
    queue_url: String,
}

impl SqsBrokerProbe {
    pub fn new(client: Client, queue_url: String) -> Self {
        Self { client, queue_url }
    }
}

#[async_trait]
impl BrokerProbe for SqsBrokerProbe {
    async fn probe(&self) -> std::result::Result<(), BrokerProbeError> {
        let result = self
            .client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let text = e.to_string();
                if text.contains("403") || text.contains("AccessDenied") {
                    Err(BrokerProbeError::AuthFailed(text))
                } else if text.contains("timed out") || text.contains("timeout") {
                    Err(BrokerProbeError::Timeout(std::time::Duration::from_secs(0)))
                } else {
                    Err(BrokerProbeError::Unreachable(text))
                }
            }
        }
    }
}
