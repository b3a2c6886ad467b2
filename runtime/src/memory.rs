//! In-memory backend: group store, lock registry and metadata store.
//!
//! Everything lives in process memory behind Tokio locks. This is the
//! reference implementation of the storage contract and the default for
//! tests and single-instance deployments.

use correlator_core::correlation::CorrelationKey;
use correlator_core::environment::{Clock, SystemClock};
use correlator_core::group::MessageGroup;
use correlator_core::message::{Message, MessageId};
use correlator_core::store::{GroupLock, LockRegistry, MessageGroupStore, MetadataStore, StoreFuture};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Message groups held in a map keyed by correlation key.
///
/// # Example
///
/// ```
/// use correlator_runtime::memory::InMemoryMessageGroupStore;
/// use correlator_core::correlation::CorrelationKey;
/// use correlator_core::message::Message;
/// use correlator_core::store::MessageGroupStore;
///
/// # tokio_test::block_on(async {
/// let store = InMemoryMessageGroupStore::new();
/// let key = CorrelationKey::new("rb:order");
///
/// let group = store.add_message(&key, Message::builder(serde_json::json!({})).build()).await?;
/// assert_eq!(group.size(), 1);
/// # Ok::<(), correlator_core::store::StoreError>(())
/// # });
/// ```
#[derive(Clone)]
pub struct InMemoryMessageGroupStore {
    groups: Arc<RwLock<HashMap<CorrelationKey, MessageGroup>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryMessageGroupStore {
    /// Empty store using the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Empty store stamping groups with `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            groups: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    /// Number of groups currently held, including empty and completed ones.
    pub async fn group_count(&self) -> usize {
        self.groups.read().await.len()
    }
}

impl Default for InMemoryMessageGroupStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageGroupStore for InMemoryMessageGroupStore {
    fn add_message(&self, key: &CorrelationKey, message: Message) -> StoreFuture<'_, MessageGroup> {
        let key = key.clone();
        Box::pin(async move {
            let now = self.clock.now();
            let mut groups = self.groups.write().await;
            let group = groups
                .entry(key.clone())
                .or_insert_with(|| MessageGroup::new(key, now));
            group.push(message, now);
            Ok(group.clone())
        })
    }

    fn remove_messages(&self, key: &CorrelationKey, ids: &[MessageId]) -> StoreFuture<'_, Vec<Message>> {
        let key = key.clone();
        let ids = ids.to_vec();
        Box::pin(async move {
            let now = self.clock.now();
            let mut groups = self.groups.write().await;
            Ok(groups
                .get_mut(&key)
                .map(|group| group.remove(&ids, now))
                .unwrap_or_default())
        })
    }

    fn get_group(&self, key: &CorrelationKey) -> StoreFuture<'_, MessageGroup> {
        let key = key.clone();
        Box::pin(async move {
            let groups = self.groups.read().await;
            Ok(match groups.get(&key) {
                Some(group) => group.clone(),
                None => MessageGroup::new(key, self.clock.now()),
            })
        })
    }

    fn group_size(&self, key: &CorrelationKey) -> StoreFuture<'_, usize> {
        let key = key.clone();
        Box::pin(async move {
            Ok(self
                .groups
                .read()
                .await
                .get(&key)
                .map_or(0, MessageGroup::size))
        })
    }

    fn complete_group(&self, key: &CorrelationKey) -> StoreFuture<'_, ()> {
        let key = key.clone();
        Box::pin(async move {
            let now = self.clock.now();
            let mut groups = self.groups.write().await;
            groups
                .entry(key.clone())
                .or_insert_with(|| MessageGroup::new(key, now))
                .mark_complete(now);
            Ok(())
        })
    }

    fn remove_group(&self, key: &CorrelationKey) -> StoreFuture<'_, ()> {
        let key = key.clone();
        Box::pin(async move {
            self.groups.write().await.remove(&key);
            Ok(())
        })
    }
}

/// One Tokio mutex per live correlation key.
///
/// Entries nobody holds or waits on are pruned whenever a lock is
/// obtained, so the registry only grows with the number of keys in flight.
#[derive(Default)]
pub struct InMemoryLockRegistry {
    locks: Mutex<HashMap<CorrelationKey, Arc<Mutex<()>>>>,
}

impl InMemoryLockRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with a live mutex.
    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }

    /// Whether no key has a live mutex.
    pub async fn is_empty(&self) -> bool {
        self.locks.lock().await.is_empty()
    }
}

impl LockRegistry for InMemoryLockRegistry {
    fn obtain(&self, key: &CorrelationKey) -> StoreFuture<'_, GroupLock> {
        let key = key.clone();
        Box::pin(async move {
            let mutex = {
                let mut locks = self.locks.lock().await;
                // Only the map holds an idle entry's Arc.
                locks.retain(|k, m| k == &key || Arc::strong_count(m) > 1);
                Arc::clone(locks.entry(key.clone()).or_default())
            };
            let guard = mutex.lock_owned().await;
            Ok(GroupLock::new(key, guard))
        })
    }
}

/// Idempotency keys held in a map.
#[derive(Clone, Default)]
pub struct InMemoryMetadataStore {
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl InMemoryMetadataStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for InMemoryMetadataStore {
    fn contains(&self, key: &str) -> StoreFuture<'_, bool> {
        let key = key.to_string();
        Box::pin(async move { Ok(self.entries.read().await.contains_key(&key)) })
    }

    fn put_if_absent(&self, key: &str, value: &str) -> StoreFuture<'_, bool> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            let mut entries = self.entries.write().await;
            if entries.contains_key(&key) {
                return Ok(false);
            }
            entries.insert(key, value);
            Ok(true)
        })
    }

    fn remove(&self, key: &str) -> StoreFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            self.entries.write().await.remove(&key);
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use correlator_core::message::EventType;
    use serde_json::json;
    use std::time::Duration;

    fn message() -> Message {
        Message::builder(json!({ "name": "x" }))
            .event_type(EventType::MessageSent)
            .build()
    }

    mod store_tests {
        use super::*;

        #[tokio::test]
        async fn unknown_key_reads_as_empty_open_group() {
            let store = InMemoryMessageGroupStore::new();
            let group = store.get_group(&CorrelationKey::new("nope")).await.expect("get");
            assert!(group.is_empty());
            assert!(!group.is_complete());
            assert_eq!(store.group_count().await, 0);
        }

        #[tokio::test]
        async fn add_is_idempotent() {
            let store = InMemoryMessageGroupStore::new();
            let key = CorrelationKey::new("k");
            let m = message();

            store.add_message(&key, m.clone()).await.expect("add");
            let group = store.add_message(&key, m).await.expect("add");

            assert_eq!(group.size(), 1);
        }

        #[tokio::test]
        async fn remove_is_set_difference() {
            let store = InMemoryMessageGroupStore::new();
            let key = CorrelationKey::new("k");
            let a = message();
            let b = message();
            store.add_messages(&key, vec![a.clone(), b.clone()]).await.expect("add");

            let first = store.remove_messages(&key, &[a.id()]).await.expect("remove");
            let second = store.remove_messages(&key, &[a.id()]).await.expect("remove");

            assert_eq!(first, vec![a]);
            assert!(second.is_empty());
            assert_eq!(store.group_size(&key).await.expect("size"), 1);
        }

        #[tokio::test]
        async fn complete_creates_sentinel_and_remove_deletes_it() {
            let store = InMemoryMessageGroupStore::new();
            let key = CorrelationKey::new("k");

            store.complete_group(&key).await.expect("complete");
            assert!(store.get_group(&key).await.expect("get").is_complete());

            store.remove_group(&key).await.expect("remove");
            assert!(!store.get_group(&key).await.expect("get").is_complete());
        }
    }

    mod lock_tests {
        use super::*;

        #[tokio::test]
        async fn same_key_is_exclusive() {
            let registry = Arc::new(InMemoryLockRegistry::new());
            let key = CorrelationKey::new("k");
            let held = registry.obtain(&key).await.expect("obtain");

            let contender = {
                let registry = Arc::clone(&registry);
                let key = key.clone();
                tokio::spawn(async move { registry.obtain(&key).await.map(|_| ()) })
            };
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(!contender.is_finished());

            drop(held);
            let result = tokio::time::timeout(Duration::from_secs(1), contender).await;
            assert!(matches!(result, Ok(Ok(Ok(())))));
        }

        #[tokio::test]
        async fn different_keys_do_not_contend() {
            let registry = InMemoryLockRegistry::new();
            let _a = registry.obtain(&CorrelationKey::new("a")).await.expect("obtain");
            let b = tokio::time::timeout(
                Duration::from_millis(100),
                registry.obtain(&CorrelationKey::new("b")),
            )
            .await;
            assert!(matches!(b, Ok(Ok(_))));
        }

        #[tokio::test]
        async fn idle_entries_are_pruned() {
            let registry = InMemoryLockRegistry::new();
            for i in 0..10 {
                drop(registry.obtain(&CorrelationKey::new(format!("k{i}"))).await.expect("obtain"));
            }
            let _last = registry.obtain(&CorrelationKey::new("last")).await.expect("obtain");
            assert_eq!(registry.len().await, 1);
        }
    }

    mod metadata_tests {
        use super::*;

        #[tokio::test]
        async fn put_if_absent_inserts_once() {
            let store = InMemoryMetadataStore::new();
            assert!(store.put_if_absent("evt", "1").await.expect("put"));
            assert!(!store.put_if_absent("evt", "2").await.expect("put"));
            assert!(store.contains("evt").await.expect("contains"));

            store.remove("evt").await.expect("remove");
            assert!(!store.contains("evt").await.expect("contains"));
        }
    }
}
