//! Advices for lifecycle events that are not aggregated.
//!
//! `MESSAGE_RECEIVED` and `MESSAGE_SUBSCRIPTION_CANCELLED` close out a
//! waiting catch event. Instead of being buffered they remove the matching
//! `MESSAGE_WAITING` events from the group, under the same per-key lock the
//! aggregator holds for every other mutation.

use crate::predicates::EventTypeFilter;
use correlator_core::correlation::CorrelationKey;
use correlator_core::message::{EventType, Message, MessageId};
use correlator_core::store::{MessageGroupStore, StoreFuture};
use std::sync::Arc;

/// Group mutation applied in place of aggregation.
pub trait AggregatorAdvice: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Whether this advice handles `message`.
    fn applies_to(&self, message: &Message) -> bool;

    /// Apply the advice to the group for `key`, returning the messages it
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](correlator_core::store::StoreError) if the
    /// store fails.
    fn apply<'a>(&'a self, key: &'a CorrelationKey, message: &'a Message) -> StoreFuture<'a, Vec<Message>>;
}

/// A `MESSAGE_RECEIVED` consumes the oldest `MESSAGE_WAITING` in its group.
pub struct MessageReceivedAdvice {
    store: Arc<dyn MessageGroupStore>,
}

impl MessageReceivedAdvice {
    /// Advice mutating `store`.
    #[must_use]
    pub fn new(store: Arc<dyn MessageGroupStore>) -> Self {
        Self { store }
    }
}

impl AggregatorAdvice for MessageReceivedAdvice {
    fn name(&self) -> &'static str {
        "MessageReceivedAdvice"
    }

    fn applies_to(&self, message: &Message) -> bool {
        message.is_event_type(EventType::MessageReceived)
    }

    fn apply<'a>(&'a self, key: &'a CorrelationKey, _message: &'a Message) -> StoreFuture<'a, Vec<Message>> {
        Box::pin(async move {
            let group = self.store.get_group(key).await?;
            match EventTypeFilter::MESSAGE_WAITING.oldest(&group) {
                Some(waiting) => self.store.remove_messages(key, &[waiting.id()]).await,
                None => Ok(Vec::new()),
            }
        })
    }
}

/// A `MESSAGE_SUBSCRIPTION_CANCELLED` drops every `MESSAGE_WAITING` in its
/// group. Buffered `MESSAGE_SENT` events stay for the next subscriber.
pub struct SubscriptionCancelledAdvice {
    store: Arc<dyn MessageGroupStore>,
}

impl SubscriptionCancelledAdvice {
    /// Advice mutating `store`.
    #[must_use]
    pub fn new(store: Arc<dyn MessageGroupStore>) -> Self {
        Self { store }
    }
}

impl AggregatorAdvice for SubscriptionCancelledAdvice {
    fn name(&self) -> &'static str {
        "SubscriptionCancelledAdvice"
    }

    fn applies_to(&self, message: &Message) -> bool {
        message.is_event_type(EventType::MessageSubscriptionCancelled)
    }

    fn apply<'a>(&'a self, key: &'a CorrelationKey, _message: &'a Message) -> StoreFuture<'a, Vec<Message>> {
        Box::pin(async move {
            let group = self.store.get_group(key).await?;
            let waiting: Vec<MessageId> = EventTypeFilter::MESSAGE_WAITING
                .select(&group)
                .iter()
                .map(|m| m.id())
                .collect();
            if waiting.is_empty() {
                return Ok(Vec::new());
            }
            self.store.remove_messages(key, &waiting).await
        })
    }
}

/// The advices installed by default.
#[must_use]
pub fn default_advices(store: &Arc<dyn MessageGroupStore>) -> Vec<Arc<dyn AggregatorAdvice>> {
    vec![
        Arc::new(MessageReceivedAdvice::new(Arc::clone(store))),
        Arc::new(SubscriptionCancelledAdvice::new(Arc::clone(store))),
    ]
}
