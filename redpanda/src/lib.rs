//! Redpanda message bus for the message correlator.
//!
//! This crate provides a Redpanda-based [`MessageBus`] using rdkafka, plus
//! [`TopicChannel`], an output channel publishing released commands to a
//! topic. Any Kafka-compatible broker works.
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - An offset is committed only after its delivery is acknowledged, and
//!   offsets are committed in order, so a crash redelivers everything that
//!   was not yet acknowledged
//! - [`Acknowledgement::Requeue`] republishes the record to its topic, then
//!   commits it
//! - [`Acknowledgement::Reject`] publishes the record to the dead-letter
//!   topic (if configured), then commits it
//! - A record that cannot be decoded is yielded as a stream error and
//!   settled in its place in the order: its raw value and headers go to the
//!   dead-letter topic with a `decodeError` header, then it is committed
//! - Up to `max_in_flight` deliveries are outstanding at once
//!
//! # Example
//!
//! ```no_run
//! use correlator_redpanda::RedpandaMessageBus;
//! use correlator_core::message_bus::{Acknowledgement, MessageBus};
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedpandaMessageBus::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("message-correlator")
//!     .dead_letter_topic("messageEvents.dlq")
//!     .build()?;
//!
//! let mut stream = bus.subscribe(&["messageEvents"]).await?;
//! while let Some(delivery) = stream.next().await {
//!     delivery?.acknowledge(Acknowledgement::Ack);
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
mod consumer;
mod channel;

pub use channel::TopicChannel;

use correlator_core::message::Message;
use correlator_core::message_bus::{DeliveryStream, EventBusError, MessageBus};
#[cfg(doc)]
use correlator_core::message_bus::Acknowledgement;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Redpanda message bus.
///
/// # Configuration
///
/// - **Broker addresses**: Bootstrap servers (required)
/// - **Producer settings**: Acks, compression, timeout
/// - **Consumer group**: Explicit ID or derived from the topics
/// - **Buffer size**: Delivery buffer capacity (default: 1000)
/// - **In-flight limit**: Unacknowledged deliveries (default: 64)
/// - **Dead-letter topic**: Where rejected records go (default: none)
/// - **Offset reset**: Where new groups start reading (default: "latest")
pub struct RedpandaMessageBus {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
    consumer_group: Option<String>,
    buffer_size: usize,
    max_in_flight: usize,
    dead_letter_topic: Option<String>,
    auto_offset_reset: String,
}

impl RedpandaMessageBus {
    /// Create a bus with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the producer cannot be
    /// created.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the bus.
    #[must_use]
    pub fn builder() -> RedpandaMessageBusBuilder {
        RedpandaMessageBusBuilder::default()
    }

    /// Broker addresses.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// An output channel named `name` publishing to `topic` with this bus's
    /// producer.
    #[must_use]
    pub fn channel(&self, name: impl Into<String>, topic: impl Into<String>) -> TopicChannel {
        TopicChannel::new(name, topic, self.producer.clone(), self.timeout)
    }
}

/// Send `message` to `topic`.
pub(crate) async fn send(
    producer: &FutureProducer,
    topic: &str,
    message: &Message,
    timeout: Duration,
) -> Result<(), EventBusError> {
    let (payload, kafka_headers) = codec::encode(message)?;
    let key = codec::partition_key(message);
    let record = FutureRecord::to(topic)
        .payload(&payload)
        .key(&key)
        .headers(kafka_headers);

    match producer.send(record, Timeout::After(timeout)).await {
        Ok((partition, offset)) => {
            tracing::debug!(
                topic = %topic,
                partition = partition,
                offset = offset,
                message_id = %message.id(),
                "Message published"
            );
            metrics::counter!("correlator_redpanda_published_total", "topic" => topic.to_string())
                .increment(1);
            Ok(())
        }
        Err((kafka_error, _)) => {
            tracing::error!(topic = %topic, error = %kafka_error, "Failed to publish message");
            Err(EventBusError::PublishFailed {
                topic: topic.to_string(),
                reason: kafka_error.to_string(),
            })
        }
    }
}

/// Send an undecodable record to `topic` as it was received, with
/// `kafka_headers` in place of its original headers.
pub(crate) async fn send_raw(
    producer: &FutureProducer,
    topic: &str,
    record: &rdkafka::message::OwnedMessage,
    kafka_headers: rdkafka::message::OwnedHeaders,
    timeout: Duration,
) -> Result<(), EventBusError> {
    use rdkafka::message::Message as _;

    let mut outgoing: FutureRecord<'_, [u8], [u8]> = FutureRecord::to(topic).headers(kafka_headers);
    if let Some(payload) = record.payload() {
        outgoing = outgoing.payload(payload);
    }
    if let Some(key) = record.key() {
        outgoing = outgoing.key(key);
    }

    producer
        .send(outgoing, Timeout::After(timeout))
        .await
        .map(|(partition, offset)| {
            tracing::debug!(topic = %topic, partition, offset, "Raw record published");
        })
        .map_err(|(kafka_error, _)| EventBusError::PublishFailed {
            topic: topic.to_string(),
            reason: kafka_error.to_string(),
        })
}

/// Builder for a [`RedpandaMessageBus`].
#[derive(Default)]
pub struct RedpandaMessageBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    buffer_size: Option<usize>,
    max_in_flight: Option<usize>,
    dead_letter_topic: Option<String>,
    auto_offset_reset: Option<String>,
}

impl RedpandaMessageBusBuilder {
    /// Comma-separated broker addresses (e.g., "localhost:9092").
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Producer acknowledgment mode: "0", "1" or "all". Default: "all".
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec: "none", "gzip", "snappy", "lz4", "zstd". Default: "none".
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Producer send timeout. Default: 5 seconds.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Consumer group shared by every correlator instance.
    ///
    /// If not set, the group is derived from the subscribed topics.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Deliveries buffered between the consumer and the subscriber.
    ///
    /// Zero is raised to one.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size.max(1));
        self
    }

    /// Deliveries handed out but not yet acknowledged. Zero is raised to one.
    #[must_use]
    pub fn max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = Some(max_in_flight.max(1));
        self
    }

    /// Topic receiving rejected records.
    #[must_use]
    pub fn dead_letter_topic(mut self, topic: impl Into<String>) -> Self {
        self.dead_letter_topic = Some(topic.into());
        self
    }

    /// Where new consumer groups start: "earliest", "latest" or "error".
    /// Default: "latest".
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the [`RedpandaMessageBus`].
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if brokers are not set or
    /// the producer cannot be created.
    pub fn build(self) -> Result<RedpandaMessageBus, EventBusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| EventBusError::ConnectionFailed("Brokers not configured".to_string()))?;

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", self.producer_acks.as_deref().unwrap_or("all"))
            .set("compression.type", self.compression.as_deref().unwrap_or("none"))
            .create()
            .map_err(|e| EventBusError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        let bus = RedpandaMessageBus {
            producer,
            brokers,
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
            consumer_group: self.consumer_group,
            buffer_size: self.buffer_size.unwrap_or(1000),
            max_in_flight: self.max_in_flight.unwrap_or(64),
            dead_letter_topic: self.dead_letter_topic,
            auto_offset_reset: self.auto_offset_reset.unwrap_or_else(|| "latest".to_string()),
        };

        tracing::info!(
            brokers = %bus.brokers,
            buffer_size = bus.buffer_size,
            max_in_flight = bus.max_in_flight,
            dead_letter_topic = ?bus.dead_letter_topic,
            auto_offset_reset = %bus.auto_offset_reset,
            "RedpandaMessageBus created"
        );
        Ok(bus)
    }
}

impl MessageBus for RedpandaMessageBus {
    fn publish(
        &self,
        topic: &str,
        message: &Message,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let message = message.clone();
        Box::pin(async move { send(&self.producer, &topic, &message, self.timeout).await })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, EventBusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|s| (*s).to_string()).collect();

        Box::pin(async move {
            let consumer_group_id = self.consumer_group.clone().unwrap_or_else(|| {
                let mut sorted_topics = topics.clone();
                sorted_topics.sort();
                format!("message-correlator-{}", sorted_topics.join("-"))
            });

            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("group.id", &consumer_group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &self.auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| EventBusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| EventBusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to subscribe to topics: {e}"),
                })?;

            tracing::info!(
                topics = ?topics,
                consumer_group = %consumer_group_id,
                buffer_size = self.buffer_size,
                max_in_flight = self.max_in_flight,
                "Subscribed to topics"
            );

            let (tx, mut rx) = tokio::sync::mpsc::channel(self.buffer_size);
            let worker = consumer::ConsumerWorker {
                consumer,
                producer: self.producer.clone(),
                timeout: self.timeout,
                max_in_flight: self.max_in_flight,
                dead_letter_topic: self.dead_letter_topic.clone(),
            };
            tokio::spawn(worker.run(tx));

            let stream = async_stream::stream! {
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };
            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redpanda_message_bus_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaMessageBus>();
        assert_sync::<RedpandaMessageBus>();
    }

    #[test]
    fn build_requires_brokers() {
        let result = RedpandaMessageBus::builder().build();
        assert!(matches!(result, Err(EventBusError::ConnectionFailed(_))));
    }
}
