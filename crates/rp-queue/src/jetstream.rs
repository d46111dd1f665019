//! JetStream pull consumer.
//!
//! Durable consumer with explicit acks. `ack_wait` plays the visibility
//! window: an unacked message redelivers after it elapses, and the stream
//! dead-letters after `max_deliver` attempts. Stream sequences whose ack
//! failed are remembered and terminated on redelivery so a lost ack does
//! not cause a reprocess.

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, PullConsumer},
    AckKind,
};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::{
    BrokerProbe, BrokerProbeError, PollClock, QueueConsumer, QueueError, QueueMetrics,
    QueuePublisher, Result,
};
use rp_common::{MessagePointer, QueuedMessage};

#[derive(Debug, Clone)]
pub struct JetStreamConsumerConfig {
    pub url: String,
    pub stream: String,
    pub subject: String,
    pub durable_name: String,
    /// Cap on unacked deliveries outstanding at once.
    pub max_ack_pending: i64,
    /// Deliveries before the stream dead-letters the message.
    pub max_deliver: i64,
    /// The visibility window.
    pub ack_wait: Duration,
    pub fetch_expires: Duration,
}

impl Default for JetStreamConsumerConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            stream: "RELAYPOINT".to_string(),
            subject: "relaypoint.pointers".to_string(),
            durable_name: "rp-router".to_string(),
            max_ack_pending: 1000,
            max_deliver: 5,
            ack_wait: Duration::from_secs(120),
            fetch_expires: Duration::from_millis(500),
        }
    }
}

pub struct JetStreamQueueConsumer {
    config: JetStreamConsumerConfig,
    consumer: PullConsumer,
    running: AtomicBool,
    poll_clock: PollClock,
    /// receipt handle → undisposed delivery
    deliveries: DashMap<String, jetstream::Message>,
    /// Stream sequences whose ack failed; terminated on redelivery.
    failed_acks: DashSet<u64>,
    total_polled: AtomicU64,
    total_acked: AtomicU64,
    total_nacked: AtomicU64,
    total_deferred: AtomicU64,
}

impl JetStreamQueueConsumer {
    pub async fn connect(config: JetStreamConsumerConfig) -> Result<Self> {
        info!(
            url = %config.url,
            stream = %config.stream,
            durable = %config.durable_name,
            "Connecting JetStream pull consumer"
        );

        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| QueueError::Broker(format!("NATS connect failed: {e}")))?;
        let context = jetstream::new(client);

        let stream = context
            .get_or_create_stream(jetstream::stream::Config {
                name: config.stream.clone(),
                subjects: vec![config.subject.clone()],
                ..Default::default()
            })
            .await
            .map_err(|e| QueueError::Broker(format!("stream setup failed: {e}")))?;

        let consumer = stream
            .get_or_create_consumer(
                &config.durable_name,
                pull::Config {
                    durable_name: Some(config.durable_name.clone()),
                    ack_policy: AckPolicy::Explicit,
                    max_ack_pending: config.max_ack_pending,
                    max_deliver: config.max_deliver,
                    ack_wait: config.ack_wait,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| QueueError::Broker(format!("consumer setup failed: {e}")))?;

        Ok(Self {
            config,
            consumer,
            running: AtomicBool::new(true),
            poll_clock: PollClock::default(),
            deliveries: DashMap::new(),
            failed_acks: DashSet::new(),
            total_polled: AtomicU64::new(0),
            total_acked: AtomicU64::new(0),
            total_nacked: AtomicU64::new(0),
            total_deferred: AtomicU64::new(0),
        })
    }

    fn take_delivery(&self, receipt_handle: &str) -> Result<jetstream::Message> {
        self.deliveries
            .remove(receipt_handle)
            .map(|(_, msg)| msg)
            .ok_or_else(|| QueueError::NotFound(receipt_handle.to_string()))
    }
}

#[async_trait]
impl QueueConsumer for JetStreamQueueConsumer {
    fn identifier(&self) -> &str {
        &self.config.stream
    }

    async fn poll(&self, max_messages: u32) -> Result<Vec<QueuedMessage>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }

        let mut fetched = self
            .consumer
            .fetch()
            .max_messages(max_messages as usize)
            .expires(self.config.fetch_expires)
            .messages()
            .await
            .map_err(|e| QueueError::Broker(format!("fetch failed: {e}")))?;

        self.poll_clock.mark();

        let mut messages = Vec::new();

        while let Some(result) = fetched.next().await {
            let msg = match result {
                Ok(m) => m,
                Err(e) => {
                    error!(stream = %self.config.stream, error = %e, "Error receiving JetStream message");
                    break;
                }
            };

            let info = match msg.info() {
                Ok(i) => i,
                Err(e) => {
                    error!(error = %e, "JetStream delivery without metadata, terminating it");
                    let _ = msg.ack_with(AckKind::Term).await;
                    continue;
                }
            };
            let sequence = info.stream_sequence;
            let receive_count = info.delivered.max(1) as u32;

            // An earlier delivery of this sequence was processed but its
            // ack never landed. Finish the ack now instead of reprocessing.
            if self.failed_acks.remove(&sequence).is_some() {
                info!(sequence = sequence, "Redelivery of a processed message, acking");
                if let Err(e) = msg.double_ack().await {
                    warn!(sequence = sequence, error = %e, "Ack retry failed, will try again");
                    self.failed_acks.insert(sequence);
                }
                continue;
            }

            let pointer: MessagePointer = match serde_json::from_slice(&msg.payload) {
                Ok(p) => p,
                Err(e) => {
                    error!(sequence = sequence, error = %e, "Unparseable JetStream payload, terminating");
                    let _ = msg.ack_with(AckKind::Term).await;
                    continue;
                }
            };

            let receipt_handle = uuid::Uuid::new_v4().to_string();
            self.deliveries.insert(receipt_handle.clone(), msg);

            messages.push(QueuedMessage {
                pointer,
                receipt_handle,
                broker_message_id: Some(sequence.to_string()),
                queue_identifier: self.config.stream.clone(),
                receive_count,
            });
        }

        if !messages.is_empty() {
            self.total_polled.fetch_add(messages.len() as u64, Ordering::Relaxed);
            debug!(stream = %self.config.stream, count = messages.len(), "Fetched JetStream batch");
        }

        Ok(messages)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let msg = self.take_delivery(receipt_handle)?;
        let sequence = msg.info().map(|i| i.stream_sequence).unwrap_or(0);

        if let Err(e) = msg.double_ack().await {
            if sequence > 0 {
                self.failed_acks.insert(sequence);
            }
            return Err(QueueError::Broker(format!("ack failed: {e}")));
        }

        self.total_acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()> {
        let msg = self.take_delivery(receipt_handle)?;
        let delay = delay_seconds.map(|s| Duration::from_secs(s as u64));

        msg.ack_with(AckKind::Nak(delay))
            .await
            .map_err(|e| QueueError::Broker(format!("nak failed: {e}")))?;

        self.total_nacked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn defer(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()> {
        let msg = self.take_delivery(receipt_handle)?;
        let delay = delay_seconds.map(|s| Duration::from_secs(s as u64));

        msg.ack_with(AckKind::Nak(delay))
            .await
            .map_err(|e| QueueError::Broker(format!("nak failed: {e}")))?;

        self.total_deferred.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn extend_visibility(&self, receipt_handle: &str, _seconds: u32) -> Result<()> {
        // Progress resets ack_wait; JetStream does not take an explicit
        // duration. Clone out of the map so no shard lock spans the await.
        let msg = self
            .deliveries
            .get(receipt_handle)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| QueueError::NotFound(receipt_handle.to_string()))?;

        msg.ack_with(AckKind::Progress)
            .await
            .map_err(|e| QueueError::Broker(format!("progress ack failed: {e}")))?;
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.poll_clock.is_fresh()
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(stream = %self.config.stream, "JetStream consumer stopped");
    }

    async fn get_metrics(&self) -> Result<Option<QueueMetrics>> {
        let mut consumer = self.consumer.clone();
        let info = consumer
            .info()
            .await
            .map_err(|e| QueueError::Broker(format!("consumer info failed: {e}")))?;

        Ok(Some(QueueMetrics {
            queue_identifier: self.config.stream.clone(),
            pending_messages: info.num_pending,
            in_flight_messages: info.num_ack_pending as u64,
            total_polled: self.total_polled.load(Ordering::Relaxed),
            total_acked: self.total_acked.load(Ordering::Relaxed),
            total_nacked: self.total_nacked.load(Ordering::Relaxed),
            total_deferred: self.total_deferred.load(Ordering::Relaxed),
        }))
    }
}

/// Publisher onto the consumer's subject. The pointer id rides in the
/// `Nats-Msg-Id` header so the stream's dedup window suppresses repeats.
pub struct JetStreamQueuePublisher {
    context: jetstream::Context,
    subject: String,
    identifier: String,
}

impl JetStreamQueuePublisher {
    pub async fn connect(url: &str, subject: String) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| QueueError::Broker(format!("NATS connect failed: {e}")))?;
        Ok(Self {
            context: jetstream::new(client),
            identifier: subject.clone(),
            subject,
        })
    }
}

#[async_trait]
impl QueuePublisher for JetStreamQueuePublisher {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn publish(&self, pointer: MessagePointer) -> Result<String> {
        let message_id = pointer.id.clone();
        let body = serde_json::to_vec(&pointer)?;

        let mut headers = async_nats::HeaderMap::new();
        let dedup_key = pointer
            .message_deduplication_id
            .clone()
            .unwrap_or_else(|| message_id.clone());
        headers.insert("Nats-Msg-Id", dedup_key.as_str());

        self.context
            .publish_with_headers(self.subject.clone(), headers, body.into())
            .await
            .map_err(|e| QueueError::Broker(format!("publish failed: {e}")))?
            .await
            .map_err(|e| QueueError::Broker(format!("publish ack failed: {e}")))?;

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

/// Probe that connects and drains immediately.
pub struct JetStreamBrokerProbe {
    url: String,
}

impl JetStreamBrokerProbe {
    pub fn new(url: String) -> Self {
        Self { url }
    }
}

#[async_trait]
impl BrokerProbe for JetStreamBrokerProbe {
    async fn probe(&self) -> std::result::Result<(), BrokerProbeError> {
        let timeout = Duration::from_secs(5);
        let connect = async_nats::connect(&self.url);

        match tokio::time::timeout(timeout, connect).await {
            Err(_) => Err(BrokerProbeError::Timeout(timeout)),
            Ok(Err(e)) => {
                let text = e.to_string();
                if text.contains("authorization") || text.contains("authentication") {
                    Err(BrokerProbeError::AuthFailed(text))
                } else {
                    Err(BrokerProbeError::Unreachable(text))
                }
            }
            Ok(Ok(client)) => {
                let _ = client.drain().await;
                Ok(())
            }
        }
    }
}
