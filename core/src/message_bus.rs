//! Message bus abstraction for inbound lifecycle events.
//!
//! The correlator consumes events from a broker through [`MessageBus`] and
//! publishes released commands back to it. Each consumed event arrives as a
//! [`Delivery`] that must be acknowledged once handling finishes.
//!
//! # Delivery Semantics
//!
//! - **At-least-once**: An event may be delivered more than once
//! - **Explicit acknowledgement**: [`Acknowledgement::Ack`] commits,
//!   [`Acknowledgement::Requeue`] asks for redelivery,
//!   [`Acknowledgement::Reject`] dead-letters the event
//! - **Drop means requeue**: A delivery dropped without acknowledgement is
//!   treated as `Requeue`
//!
//! # Implementations
//!
//! - `InMemoryMessageBus` (`correlator-testing`) - for tests
//! - `RedpandaMessageBus` (`correlator-redpanda`) - Kafka-compatible brokers
//!
//! # Example
//!
//! ```rust,ignore
//! use futures::StreamExt;
//!
//! let mut stream = bus.subscribe(&["message-events"]).await?;
//! while let Some(result) = stream.next().await {
//!     match result {
//!         Ok(delivery) => {
//!             let ack = handle(delivery.message()).await;
//!             delivery.acknowledge(ack);
//!         }
//!         Err(e) => tracing::error!("Stream error: {}", e),
//!     }
//! }
//! ```

use crate::message::Message;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors that can occur during message bus operations.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a message to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Failed to decode a consumed message
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Failed to encode a message for publishing
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Failed to commit or seek after acknowledgement
    #[error("Acknowledgement failed: {0}")]
    AcknowledgementFailed(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Outcome reported back to the bus for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    /// Handled; commit the delivery
    Ack,
    /// Transient failure; deliver again
    Requeue,
    /// Permanent failure; route to the dead-letter destination
    Reject,
}

/// One consumed message awaiting acknowledgement.
#[derive(Debug)]
pub struct Delivery {
    message: Message,
    acknowledger: Option<oneshot::Sender<Acknowledgement>>,
}

impl Delivery {
    /// A delivery whose acknowledgement is reported through `acknowledger`.
    #[must_use]
    pub const fn new(message: Message, acknowledger: oneshot::Sender<Acknowledgement>) -> Self {
        Self {
            message,
            acknowledger: Some(acknowledger),
        }
    }

    /// A delivery from a transport without acknowledgements.
    #[must_use]
    pub const fn unacknowledged(message: Message) -> Self {
        Self {
            message,
            acknowledger: None,
        }
    }

    /// The consumed message.
    #[must_use]
    pub const fn message(&self) -> &Message {
        &self.message
    }

    /// Report the handling outcome to the bus.
    pub fn acknowledge(mut self, acknowledgement: Acknowledgement) {
        if let Some(acknowledger) = self.acknowledger.take() {
            // The bus may have shut down; nothing is left to acknowledge to.
            let _ = acknowledger.send(acknowledgement);
        }
    }
}

/// Stream of deliveries from a subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, EventBusError>> + Send>>;

/// Trait for message bus implementations.
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of
/// `async fn` so it can be used as `Arc<dyn MessageBus>`.
pub trait MessageBus: Send + Sync {
    /// Publish a message to a topic.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the publish operation fails.
    fn publish(
        &self,
        topic: &str,
        message: &Message,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;

    /// Subscribe to one or more topics and receive a stream of deliveries.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if subscription fails.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, EventBusError>> + Send + '_>>;
}
