//! Group storage, per-group locking and idempotency metadata.
//!
//! The aggregator is written against three traits so the same correlation
//! logic runs on every backend:
//!
//! - [`MessageGroupStore`]: durable message groups
//! - [`LockRegistry`]: mutual exclusion per correlation key
//! - [`MetadataStore`]: processed-id bookkeeping for duplicate detection
//!
//! # Implementations
//!
//! - In-memory (`correlator_runtime::memory`) - single process, tests
//! - `PostgresMessageGroupStore` (`correlator-postgres`) - relational
//! - `RedisMessageGroupStore` (`correlator-redis`) - key-value
//!
//! # Contract
//!
//! - Adding a message already present (same id) is a no-op
//! - Removing ids that are not present is a no-op; callers learn what was
//!   actually removed from the return value
//! - Reading an unknown key yields an empty, open group
//! - Every operation is atomic per key

use crate::correlation::CorrelationKey;
use crate::group::MessageGroup;
use crate::message::{Message, MessageId};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors raised by stores and lock registries.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// The backend could not be reached or rejected the operation
    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),

    /// The operation did not finish within the configured bound
    #[error("Storage operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout {
        /// Operation name
        operation: &'static str,
        /// Configured bound in milliseconds
        timeout_ms: u64,
    },

    /// The group lock could not be obtained
    #[error("Failed to obtain lock for group '{key}': {reason}")]
    Lock {
        /// Group the lock was requested for
        key: CorrelationKey,
        /// The reason for failure
        reason: String,
    },

    /// Stored data could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    ///
    /// Corrupt data stays corrupt; everything else is transient.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Serialization(_))
    }
}

/// Boxed future returned by storage traits.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Durable storage of message groups keyed by correlation key.
///
/// This trait is dyn-compatible so the aggregator can hold an
/// `Arc<dyn MessageGroupStore>` and switch backends through configuration.
pub trait MessageGroupStore: Send + Sync {
    /// Append `message` to the group for `key`, creating the group if
    /// needed, and return the resulting snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn add_message(&self, key: &CorrelationKey, message: Message) -> StoreFuture<'_, MessageGroup>;

    /// Remove the listed messages from the group for `key`.
    ///
    /// Returns the messages that were actually present and removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn remove_messages(&self, key: &CorrelationKey, ids: &[MessageId]) -> StoreFuture<'_, Vec<Message>>;

    /// Read the group for `key`. Unknown keys yield an empty, open group.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn get_group(&self, key: &CorrelationKey) -> StoreFuture<'_, MessageGroup>;

    /// Number of messages buffered for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn group_size(&self, key: &CorrelationKey) -> StoreFuture<'_, usize> {
        let key = key.clone();
        Box::pin(async move { Ok(self.get_group(&key).await?.size()) })
    }

    /// Mark the group for `key` complete, creating an empty sentinel if the
    /// group does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn complete_group(&self, key: &CorrelationKey) -> StoreFuture<'_, ()>;

    /// Delete the group for `key` and every message it holds.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn remove_group(&self, key: &CorrelationKey) -> StoreFuture<'_, ()>;

    /// Append several messages in order, returning the final snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails. Messages appended before
    /// the failure stay appended.
    fn add_messages(&self, key: &CorrelationKey, messages: Vec<Message>) -> StoreFuture<'_, MessageGroup> {
        let key = key.clone();
        Box::pin(async move {
            let mut group = self.get_group(&key).await?;
            for message in messages {
                group = self.add_message(&key, message).await?;
            }
            Ok(group)
        })
    }
}

/// Exclusive hold on one correlation key.
///
/// The lock is released when the value is dropped.
pub struct GroupLock {
    key: CorrelationKey,
    _guard: Box<dyn Send>,
}

impl GroupLock {
    /// Wrap a backend-specific guard. The guard's `Drop` releases the lock.
    #[must_use]
    pub fn new(key: CorrelationKey, guard: impl Send + 'static) -> Self {
        Self {
            key,
            _guard: Box::new(guard),
        }
    }

    /// Key this lock protects.
    #[must_use]
    pub const fn key(&self) -> &CorrelationKey {
        &self.key
    }
}

impl fmt::Debug for GroupLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupLock").field("key", &self.key).finish_non_exhaustive()
    }
}

/// Mutual exclusion per correlation key.
///
/// Holding the lock for a key serializes every read-modify-write the
/// aggregator performs on that key's group. Different keys never contend.
pub trait LockRegistry: Send + Sync {
    /// Wait for and acquire the lock for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Lock`] if the lock cannot be obtained.
    fn obtain(&self, key: &CorrelationKey) -> StoreFuture<'_, GroupLock>;
}

/// Key/value bookkeeping used by the idempotent receiver.
pub trait MetadataStore: Send + Sync {
    /// Whether `key` has been recorded.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn contains(&self, key: &str) -> StoreFuture<'_, bool>;

    /// Record `key` unless present. Returns `true` if it was inserted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn put_if_absent(&self, key: &str, value: &str) -> StoreFuture<'_, bool>;

    /// Forget `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn remove(&self, key: &str) -> StoreFuture<'_, ()>;
}
