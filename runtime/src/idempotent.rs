//! Duplicate detection for redelivered lifecycle events.

use correlator_core::headers;
use correlator_core::message::Message;
use correlator_core::store::{MetadataStore, StoreError};
use serde_json::Value;
use std::sync::Arc;

/// Recognises events that were already handled.
///
/// The idempotency key is the `messageEventId` header, falling back to the
/// message id. A key is claimed atomically before the event changes any
/// group and released again when handling fails on a retryable fault, so
/// the redelivery of a failed event is not mistaken for a duplicate.
#[derive(Clone)]
pub struct IdempotentReceiver {
    store: Arc<dyn MetadataStore>,
}

impl IdempotentReceiver {
    /// Receiver recording keys in `store`.
    #[must_use]
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    /// Idempotency key of `message`.
    #[must_use]
    pub fn key_for(message: &Message) -> String {
        match message.header(headers::MESSAGE_EVENT_ID) {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(value) if !value.is_null() => value.to_string(),
            _ => message.id().to_string(),
        }
    }

    /// Claim the key of `message`. Returns `false` if it was already claimed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the metadata store fails.
    pub async fn claim(&self, message: &Message) -> Result<bool, StoreError> {
        self.store
            .put_if_absent(&Self::key_for(message), &message.timestamp().to_string())
            .await
    }

    /// Give up the claim on `message` so a redelivery is handled again.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the metadata store fails.
    pub async fn release(&self, message: &Message) -> Result<(), StoreError> {
        let key = Self::key_for(message);
        tracing::debug!(idempotency_key = %key, "Releasing idempotency claim");
        self.store.remove(&key).await
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::memory::InMemoryMetadataStore;
    use serde_json::json;

    #[test]
    fn key_prefers_message_event_id() {
        let message = Message::builder(json!({}))
            .header(headers::MESSAGE_EVENT_ID, "evt-1")
            .build();
        assert_eq!(IdempotentReceiver::key_for(&message), "evt-1");
    }

    #[test]
    fn key_falls_back_to_message_id() {
        let message = Message::builder(json!({}))
            .header(headers::MESSAGE_EVENT_ID, Value::Null)
            .build();
        assert_eq!(IdempotentReceiver::key_for(&message), message.id().to_string());
    }

    fn with_event_id(id: &str) -> Message {
        Message::builder(json!({}))
            .header(headers::MESSAGE_EVENT_ID, id)
            .build()
    }

    #[tokio::test]
    async fn second_claim_of_same_event_fails() {
        let receiver = IdempotentReceiver::new(Arc::new(InMemoryMetadataStore::new()));

        assert!(receiver.claim(&with_event_id("evt-1")).await.expect("claim"));
        assert!(!receiver.claim(&with_event_id("evt-1")).await.expect("reclaim"));
        assert!(receiver.claim(&with_event_id("evt-2")).await.expect("other"));
    }

    #[tokio::test]
    async fn released_claim_can_be_taken_again() {
        let receiver = IdempotentReceiver::new(Arc::new(InMemoryMetadataStore::new()));
        let message = with_event_id("evt-1");

        assert!(receiver.claim(&message).await.expect("claim"));
        receiver.release(&message).await.expect("release");

        assert!(receiver.claim(&with_event_id("evt-1")).await.expect("reclaim"));
    }
}
