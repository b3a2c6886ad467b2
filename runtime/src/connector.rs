//! The message connector: the inbound flow in front of the aggregator.
//!
//! ```text
//! bus ─► filter ─► aggregator ─► router ─► channel
//!          │
//!          ▼
//!       Filtered
//! ```
//!
//! Duplicate detection lives in the aggregator, under the per-key lock.
//!
//! [`MessageConnector::run`] drives the flow from a [`MessageBus`]
//! subscription, handling deliveries concurrently, retrying transient
//! faults and acknowledging each delivery with the final outcome.
//! [`MessageConnector::run_until`] stops taking deliveries on shutdown and
//! drains the ones in flight.

use crate::aggregator::{AggregatorError, CorrelatingAggregator, HandleOutcome};
use crate::metrics::AggregatorMetrics;
use crate::retry::{retry, RetryPolicy};
use correlator_core::message::Message;
use correlator_core::message_bus::{Acknowledgement, Delivery, EventBusError, MessageBus};
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;

/// Filter and aggregation for inbound events.
pub struct MessageConnector {
    aggregator: Arc<CorrelatingAggregator>,
    retry_policy: RetryPolicy,
    concurrency: usize,
}

impl MessageConnector {
    /// Connector feeding `aggregator`.
    #[must_use]
    pub fn new(aggregator: Arc<CorrelatingAggregator>) -> Self {
        Self {
            aggregator,
            retry_policy: RetryPolicy::default(),
            concurrency: 16,
        }
    }

    /// Backoff used for retryable faults.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Maximum deliveries handled at once by [`run`](Self::run).
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Maximum deliveries handled at once.
    #[must_use]
    pub const fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// The aggregator behind this connector.
    #[must_use]
    pub const fn aggregator(&self) -> &Arc<CorrelatingAggregator> {
        &self.aggregator
    }

    /// Handle one inbound event once.
    ///
    /// # Errors
    ///
    /// Returns [`AggregatorError`] if aggregation fails.
    pub async fn handle(&self, message: Message) -> Result<HandleOutcome, AggregatorError> {
        if message.event_type().is_none() {
            tracing::warn!(
                message_id = %message.id(),
                "Discarding message without a recognised event type"
            );
            AggregatorMetrics::record_discard("filtered");
            return Ok(HandleOutcome::Filtered);
        }

        self.aggregator.handle(message).await
    }

    /// Handle one inbound event, retrying retryable faults.
    ///
    /// # Errors
    ///
    /// Returns the last [`AggregatorError`] once it is permanent or the
    /// retry policy is exhausted.
    pub async fn handle_with_retry(&self, message: &Message) -> Result<HandleOutcome, AggregatorError> {
        retry(self.retry_policy.clone(), || self.handle(message.clone())).await
    }

    /// Handle one delivery and acknowledge it.
    pub async fn process_delivery(&self, delivery: Delivery) -> Acknowledgement {
        let acknowledgement = match self.handle_with_retry(delivery.message()).await {
            Ok(outcome) => {
                tracing::debug!(message_id = %delivery.message().id(), ?outcome, "Delivery handled");
                Acknowledgement::Ack
            }
            Err(e) if e.is_retryable() => {
                tracing::error!(
                    message_id = %delivery.message().id(),
                    error = %e,
                    "Delivery failed after retries, requeueing"
                );
                Acknowledgement::Requeue
            }
            Err(e) => {
                tracing::error!(
                    message_id = %delivery.message().id(),
                    error = %e,
                    "Delivery failed permanently, rejecting"
                );
                Acknowledgement::Reject
            }
        };
        delivery.acknowledge(acknowledgement);
        acknowledgement
    }

    /// Consume `topics` from `bus` until the subscription ends.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError`] if the subscription cannot be established.
    pub async fn run(&self, bus: &dyn MessageBus, topics: &[&str]) -> Result<(), EventBusError> {
        self.run_until(bus, topics, std::future::pending::<()>()).await
    }

    /// Consume `topics` from `bus` until the subscription ends or `shutdown`
    /// resolves. On shutdown no further delivery is taken and the call
    /// returns once every delivery in flight is handled and acknowledged.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError`] if the subscription cannot be established.
    pub async fn run_until(
        &self,
        bus: &dyn MessageBus,
        topics: &[&str],
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<(), EventBusError> {
        let stream = bus.subscribe(topics).await?;
        tracing::info!(?topics, concurrency = self.concurrency, "Message connector consuming");

        stream
            .take_until(shutdown)
            .for_each_concurrent(self.concurrency, |item| async move {
                match item {
                    Ok(delivery) => {
                        self.process_delivery(delivery).await;
                    }
                    Err(e) => tracing::warn!(error = %e, "Message stream error"),
                }
            })
            .await;

        tracing::info!(?topics, "Message connector stopped");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryLockRegistry, InMemoryMessageGroupStore};
    use correlator_core::channel::{MessageChannel, SendFuture};
    use correlator_core::headers;
    use correlator_core::message::EventType;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    #[derive(Default)]
    struct Counting {
        sent: Mutex<usize>,
    }

    impl MessageChannel for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn send(&self, _message: Message) -> SendFuture<'_> {
            if let Ok(mut sent) = self.sent.lock() {
                *sent += 1;
            }
            Box::pin(async { Ok(()) })
        }
    }

    fn connector(output: Arc<Counting>) -> MessageConnector {
        let aggregator = CorrelatingAggregator::builder()
            .store(Arc::new(InMemoryMessageGroupStore::new()))
            .lock_registry(Arc::new(InMemoryLockRegistry::new()))
            .output(output)
            .build()
            .expect("all required parts are set");
        MessageConnector::new(Arc::new(aggregator)).with_retry_policy(RetryPolicy::no_retry())
    }

    fn event(event_type: EventType, event_id: &str) -> Message {
        Message::builder(json!({ "name": "order" }))
            .event_type(event_type)
            .header(headers::APP_NAME, "rb")
            .header(headers::MESSAGE_EVENT_NAME, "order")
            .header(headers::MESSAGE_EVENT_ID, event_id)
            .build()
    }

    #[tokio::test]
    async fn message_without_event_type_is_filtered() {
        let connector = connector(Arc::new(Counting::default()));
        let message = Message::builder(json!({ "name": "order" })).build();

        let outcome = connector.handle(message).await;

        assert_eq!(outcome.ok(), Some(HandleOutcome::Filtered));
    }

    #[tokio::test]
    async fn redelivered_event_is_duplicate() {
        let output = Arc::new(Counting::default());
        let connector = connector(Arc::clone(&output));
        connector
            .handle(event(EventType::StartMessageDeployed, "deployed-1"))
            .await
            .expect("handled");

        let first = connector.handle(event(EventType::MessageSent, "sent-1")).await;
        let again = connector.handle(event(EventType::MessageSent, "sent-1")).await;

        assert!(matches!(first, Ok(HandleOutcome::Released { dispatched: 1, .. })));
        assert_eq!(again.ok(), Some(HandleOutcome::Duplicate));
        assert_eq!(output.sent.lock().map(|s| *s).unwrap_or_default(), 1);
    }

    #[tokio::test]
    async fn permanent_fault_rejects_delivery() {
        let connector = connector(Arc::new(Counting::default()));
        let malformed = Message::builder(json!("not an object"))
            .event_type(EventType::MessageSent)
            .header(headers::APP_NAME, "rb")
            .header(headers::MESSAGE_EVENT_NAME, "order")
            .build();
        let (tx, rx) = oneshot::channel();

        let acknowledgement = connector.process_delivery(Delivery::new(malformed, tx)).await;

        assert_eq!(acknowledgement, Acknowledgement::Reject);
        assert_eq!(rx.await.ok(), Some(Acknowledgement::Reject));
    }

    #[tokio::test]
    async fn stopped_aggregator_rejects_delivery() {
        let connector = connector(Arc::new(Counting::default()));
        connector.aggregator().stop();
        let (tx, rx) = oneshot::channel();

        connector
            .process_delivery(Delivery::new(event(EventType::MessageSent, "s"), tx))
            .await;

        assert_eq!(rx.await.ok(), Some(Acknowledgement::Reject));
    }
}
