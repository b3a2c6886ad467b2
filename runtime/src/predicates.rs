//! Event-type selection over message groups.

use correlator_core::group::MessageGroup;
use correlator_core::message::{EventType, Message};
use std::cmp::Ordering;

/// Selects the messages of one lifecycle event type.
///
/// # Examples
///
/// ```
/// use correlator_runtime::predicates::EventTypeFilter;
/// use correlator_core::message::{EventType, Message};
///
/// let sent = Message::builder(serde_json::json!({}))
///     .event_type(EventType::MessageSent)
///     .build();
///
/// assert!(EventTypeFilter::MESSAGE_SENT.matches(&sent));
/// assert!(!EventTypeFilter::MESSAGE_WAITING.matches(&sent));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventTypeFilter(EventType);

impl EventTypeFilter {
    /// `MESSAGE_SENT` events.
    pub const MESSAGE_SENT: Self = Self(EventType::MessageSent);
    /// `MESSAGE_WAITING` events.
    pub const MESSAGE_WAITING: Self = Self(EventType::MessageWaiting);
    /// `START_MESSAGE_DEPLOYED` events.
    pub const START_MESSAGE_DEPLOYED: Self = Self(EventType::StartMessageDeployed);

    /// Filter for `event_type`.
    #[must_use]
    pub const fn new(event_type: EventType) -> Self {
        Self(event_type)
    }

    /// Event type this filter selects.
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        self.0
    }

    /// Whether `message` is of the selected type.
    #[must_use]
    pub fn matches(&self, message: &Message) -> bool {
        message.is_event_type(self.0)
    }

    /// Whether `group` buffers at least one message of the selected type.
    #[must_use]
    pub fn any(&self, group: &MessageGroup) -> bool {
        group.messages().iter().any(|m| self.matches(m))
    }

    /// Matching messages in arrival order.
    #[must_use]
    pub fn select<'a>(&self, group: &'a MessageGroup) -> Vec<&'a Message> {
        group.messages().iter().filter(|m| self.matches(m)).collect()
    }

    /// Oldest matching message. Ties on timestamp go to the earlier arrival.
    #[must_use]
    pub fn oldest<'a>(&self, group: &'a MessageGroup) -> Option<&'a Message> {
        group
            .messages()
            .iter()
            .filter(|m| self.matches(m))
            .min_by(|a, b| by_timestamp(a, b))
    }
}

/// Ascending timestamp order.
///
/// Use with a stable sort so equal timestamps keep arrival order.
#[must_use]
pub fn by_timestamp(a: &Message, b: &Message) -> Ordering {
    a.timestamp().cmp(&b.timestamp())
}
