//! Bounded store calls.

use correlator_core::correlation::CorrelationKey;
use correlator_core::group::MessageGroup;
use correlator_core::message::{Message, MessageId};
use correlator_core::store::{MessageGroupStore, StoreError, StoreFuture};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Wraps a store so every call fails with [`StoreError::Timeout`] instead
/// of hanging past `timeout`.
///
/// A timed-out call is a retryable storage fault; it never feeds a release
/// decision.
#[derive(Clone)]
pub struct TimedMessageGroupStore {
    inner: Arc<dyn MessageGroupStore>,
    timeout: Duration,
}

impl TimedMessageGroupStore {
    /// Bound every call on `inner` by `timeout`.
    #[must_use]
    pub fn new(inner: Arc<dyn MessageGroupStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// Configured bound.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.timeout, call).await.unwrap_or_else(|_| {
            tracing::warn!(operation, timeout_ms = self.timeout_ms(), "Store call timed out");
            Err(StoreError::Timeout {
                operation,
                timeout_ms: self.timeout_ms(),
            })
        })
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

impl MessageGroupStore for TimedMessageGroupStore {
    fn add_message(&self, key: &CorrelationKey, message: Message) -> StoreFuture<'_, MessageGroup> {
        let call = self.inner.add_message(key, message);
        Box::pin(self.bounded("add_message", call))
    }

    fn remove_messages(&self, key: &CorrelationKey, ids: &[MessageId]) -> StoreFuture<'_, Vec<Message>> {
        let call = self.inner.remove_messages(key, ids);
        Box::pin(self.bounded("remove_messages", call))
    }

    fn get_group(&self, key: &CorrelationKey) -> StoreFuture<'_, MessageGroup> {
        let call = self.inner.get_group(key);
        Box::pin(self.bounded("get_group", call))
    }

    fn group_size(&self, key: &CorrelationKey) -> StoreFuture<'_, usize> {
        let call = self.inner.group_size(key);
        Box::pin(self.bounded("group_size", call))
    }

    fn complete_group(&self, key: &CorrelationKey) -> StoreFuture<'_, ()> {
        let call = self.inner.complete_group(key);
        Box::pin(self.bounded("complete_group", call))
    }

    fn remove_group(&self, key: &CorrelationKey) -> StoreFuture<'_, ()> {
        let call = self.inner.remove_group(key);
        Box::pin(self.bounded("remove_group", call))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::memory::InMemoryMessageGroupStore;

    struct Hanging;

    impl MessageGroupStore for Hanging {
        fn add_message(&self, _: &CorrelationKey, _: Message) -> StoreFuture<'_, MessageGroup> {
            Box::pin(std::future::pending())
        }

        fn remove_messages(&self, _: &CorrelationKey, _: &[MessageId]) -> StoreFuture<'_, Vec<Message>> {
            Box::pin(std::future::pending())
        }

        fn get_group(&self, _: &CorrelationKey) -> StoreFuture<'_, MessageGroup> {
            Box::pin(std::future::pending())
        }

        fn complete_group(&self, _: &CorrelationKey) -> StoreFuture<'_, ()> {
            Box::pin(std::future::pending())
        }

        fn remove_group(&self, _: &CorrelationKey) -> StoreFuture<'_, ()> {
            Box::pin(std::future::pending())
        }
    }

    #[tokio::test]
    async fn hanging_call_times_out_as_retryable_fault() {
        let store = TimedMessageGroupStore::new(Arc::new(Hanging), Duration::from_millis(10));

        let result = store.get_group(&CorrelationKey::new("k")).await;

        assert!(matches!(
            result,
            Err(StoreError::Timeout { operation: "get_group", timeout_ms: 10 })
        ));
        assert!(result.err().is_some_and(|e| e.is_retryable()));
    }

    #[tokio::test]
    async fn fast_calls_pass_through() {
        let store = TimedMessageGroupStore::new(
            Arc::new(InMemoryMessageGroupStore::new()),
            Duration::from_secs(1),
        );
        let key = CorrelationKey::new("k");

        let group = store
            .add_message(&key, Message::builder(serde_json::json!({})).build())
            .await
            .expect("add");

        assert_eq!(group.size(), 1);
        assert_eq!(store.group_size(&key).await.expect("size"), 1);
    }
}
