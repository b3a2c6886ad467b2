//! Storage fault injection.

use correlator_core::correlation::CorrelationKey;
use correlator_core::group::MessageGroup;
use correlator_core::message::{Message, MessageId};
use correlator_core::store::{MessageGroupStore, StoreError, StoreFuture};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Group store operation a fault can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    /// `add_message`
    Add,
    /// `remove_messages`
    Remove,
    /// `get_group`
    Get,
    /// `complete_group`
    Complete,
    /// `remove_group`
    RemoveGroup,
}

/// Wraps a store and fails selected calls with [`StoreError::Unavailable`].
///
/// Faults are either permanent ([`set_unavailable`](Self::set_unavailable))
/// or a countdown: the next `n` calls to one operation fail, later calls
/// pass through. A countdown set with
/// [`fail_next_after_commit`](Self::fail_next_after_commit) lets the call
/// reach the inner store and fails only the reply.
#[derive(Clone)]
pub struct FaultyStore {
    inner: Arc<dyn MessageGroupStore>,
    unavailable: Arc<AtomicBool>,
    target: Arc<std::sync::Mutex<Option<StoreOperation>>>,
    remaining: Arc<AtomicUsize>,
    after_commit: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
}

impl FaultyStore {
    /// Pass-through wrapper around `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn MessageGroupStore>) -> Self {
        Self {
            inner,
            unavailable: Arc::default(),
            target: Arc::default(),
            remaining: Arc::default(),
            after_commit: Arc::default(),
            calls: Arc::default(),
        }
    }

    /// Fail every call while `unavailable` is set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `times` calls to `operation`.
    pub fn fail_next(&self, operation: StoreOperation, times: usize) {
        self.target_next(operation, times, false);
    }

    /// Apply the next `times` calls to `operation`, then fail them.
    pub fn fail_next_after_commit(&self, operation: StoreOperation, times: usize) {
        self.target_next(operation, times, true);
    }

    fn target_next(&self, operation: StoreOperation, times: usize, after_commit: bool) {
        if let Ok(mut target) = self.target.lock() {
            *target = Some(operation);
        }
        self.after_commit.store(after_commit, Ordering::SeqCst);
        self.remaining.store(times, Ordering::SeqCst);
    }

    /// Number of calls made through the wrapper.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self, operation: StoreOperation) -> Fault {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Fault::Before(StoreError::Unavailable("injected outage".to_string()));
        }
        let targeted = self.target.lock().map(|t| *t == Some(operation)).unwrap_or(false);
        if targeted
            && self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            let error = StoreError::Unavailable(format!("injected {operation:?} fault"));
            if self.after_commit.load(Ordering::SeqCst) {
                return Fault::After(error);
            }
            return Fault::Before(error);
        }
        Fault::None
    }

    fn guard<'a, T: Send + 'a>(
        &self,
        operation: StoreOperation,
        call: impl FnOnce() -> StoreFuture<'a, T>,
    ) -> StoreFuture<'a, T> {
        match self.check(operation) {
            Fault::None => call(),
            Fault::Before(e) => Box::pin(async move { Err(e) }),
            Fault::After(e) => {
                let call = call();
                Box::pin(async move {
                    call.await?;
                    Err(e)
                })
            }
        }
    }
}

enum Fault {
    None,
    Before(StoreError),
    After(StoreError),
}

impl MessageGroupStore for FaultyStore {
    fn add_message(&self, key: &CorrelationKey, message: Message) -> StoreFuture<'_, MessageGroup> {
        self.guard(StoreOperation::Add, || self.inner.add_message(key, message))
    }

    fn remove_messages(&self, key: &CorrelationKey, ids: &[MessageId]) -> StoreFuture<'_, Vec<Message>> {
        self.guard(StoreOperation::Remove, || self.inner.remove_messages(key, ids))
    }

    fn get_group(&self, key: &CorrelationKey) -> StoreFuture<'_, MessageGroup> {
        self.guard(StoreOperation::Get, || self.inner.get_group(key))
    }

    fn complete_group(&self, key: &CorrelationKey) -> StoreFuture<'_, ()> {
        self.guard(StoreOperation::Complete, || self.inner.complete_group(key))
    }

    fn remove_group(&self, key: &CorrelationKey) -> StoreFuture<'_, ()> {
        self.guard(StoreOperation::RemoveGroup, || self.inner.remove_group(key))
    }
}
