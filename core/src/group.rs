//! Message group snapshots.

use crate::correlation::CorrelationKey;
use crate::message::{Message, MessageId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A snapshot of the messages buffered under one correlation key.
///
/// Messages are kept in arrival order and are unique by id. A group that is
/// marked complete is a sentinel: the aggregator discards any message that
/// correlates to it.
///
/// Snapshots are values. Mutating one does not touch the store it was read
/// from; the mutation helpers exist for store implementations that keep
/// groups as whole values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageGroup {
    key: CorrelationKey,
    messages: Vec<Message>,
    complete: bool,
    created_at: DateTime<Utc>,
    last_modified: DateTime<Utc>,
}

impl MessageGroup {
    /// An empty, open group.
    #[must_use]
    pub const fn new(key: CorrelationKey, created_at: DateTime<Utc>) -> Self {
        Self {
            key,
            messages: Vec::new(),
            complete: false,
            created_at,
            last_modified: created_at,
        }
    }

    /// Reassemble a group read back from storage.
    #[must_use]
    pub const fn from_parts(
        key: CorrelationKey,
        messages: Vec<Message>,
        complete: bool,
        created_at: DateTime<Utc>,
        last_modified: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            messages,
            complete,
            created_at,
            last_modified,
        }
    }

    /// Group identity.
    #[must_use]
    pub const fn key(&self) -> &CorrelationKey {
        &self.key
    }

    /// Buffered messages in arrival order.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of buffered messages.
    #[must_use]
    pub fn size(&self) -> usize {
        self.messages.len()
    }

    /// Whether the group buffers nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Whether the group has been completed.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.complete
    }

    /// Whether a message with `id` is buffered.
    #[must_use]
    pub fn contains(&self, id: MessageId) -> bool {
        self.messages.iter().any(|m| m.id() == id)
    }

    /// When the group was first created.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// When the group was last mutated.
    #[must_use]
    pub const fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    /// Append `message` unless a message with the same id is present.
    ///
    /// Returns whether the message was appended.
    pub fn push(&mut self, message: Message, at: DateTime<Utc>) -> bool {
        if self.contains(message.id()) {
            return false;
        }
        self.messages.push(message);
        self.last_modified = at;
        true
    }

    /// Remove the messages whose ids are listed, returning those that were
    /// actually present in arrival order.
    pub fn remove(&mut self, ids: &[MessageId], at: DateTime<Utc>) -> Vec<Message> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.messages)
            .into_iter()
            .partition(|m| ids.contains(&m.id()));
        self.messages = kept;
        if !removed.is_empty() {
            self.last_modified = at;
        }
        removed
    }

    /// Mark the group complete.
    pub fn mark_complete(&mut self, at: DateTime<Utc>) {
        self.complete = true;
        self.last_modified = at;
    }
}
