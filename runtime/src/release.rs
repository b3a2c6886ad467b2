//! Release strategies: when is a group ready to be drained?
//!
//! Strategies are pure functions of the stored group. The aggregator
//! re-evaluates them after every arrival, so a group that is not releasable
//! now simply keeps accumulating.

use crate::predicates::EventTypeFilter;
use correlator_core::group::MessageGroup;
use std::sync::Arc;

/// Decides whether a group can be released.
pub trait ReleaseStrategy: Send + Sync {
    /// Whether `group` is releasable. Must be `false` for empty groups.
    fn can_release(&self, group: &MessageGroup) -> bool;
}

impl<F> ReleaseStrategy for F
where
    F: Fn(&MessageGroup) -> bool + Send + Sync,
{
    fn can_release(&self, group: &MessageGroup) -> bool {
        self(group)
    }
}

/// Releasable when the group holds a `MESSAGE_SENT` together with a
/// consumer for it: a `START_MESSAGE_DEPLOYED` or a `MESSAGE_WAITING`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageSentReleaseHandler;

impl ReleaseStrategy for MessageSentReleaseHandler {
    fn can_release(&self, group: &MessageGroup) -> bool {
        EventTypeFilter::MESSAGE_SENT.any(group)
            && (EventTypeFilter::START_MESSAGE_DEPLOYED.any(group)
                || EventTypeFilter::MESSAGE_WAITING.any(group))
    }
}

/// Releasable when any member strategy says so.
#[derive(Clone, Default)]
pub struct ReleaseStrategyChain {
    handlers: Vec<Arc<dyn ReleaseStrategy>>,
}

impl ReleaseStrategyChain {
    /// Start a chain with its first handler.
    #[must_use]
    pub fn first(handler: impl ReleaseStrategy + 'static) -> Self {
        Self {
            handlers: vec![Arc::new(handler)],
        }
    }

    /// Append a handler.
    #[must_use]
    pub fn then(mut self, handler: impl ReleaseStrategy + 'static) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Number of handlers in the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the chain has no handlers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for ReleaseStrategyChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseStrategyChain")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl ReleaseStrategy for ReleaseStrategyChain {
    fn can_release(&self, group: &MessageGroup) -> bool {
        !group.is_empty() && self.handlers.iter().any(|h| h.can_release(group))
    }
}

/// The chain used by default: message-sent release only.
#[must_use]
pub fn default_release_chain() -> ReleaseStrategyChain {
    ReleaseStrategyChain::first(MessageSentReleaseHandler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use correlator_core::correlation::CorrelationKey;
    use correlator_core::message::{EventType, Message};
    use correlator_core::Utc;
    use serde_json::json;

    fn group_of(types: &[EventType]) -> MessageGroup {
        let now = Utc::now();
        let mut group = MessageGroup::new(CorrelationKey::new("rb:x"), now);
        for t in types {
            group.push(Message::builder(json!({ "name": "x" })).event_type(*t).build(), now);
        }
        group
    }

    #[test]
    fn sent_with_deployed_is_releasable() {
        let group = group_of(&[EventType::StartMessageDeployed, EventType::MessageSent]);
        assert!(MessageSentReleaseHandler.can_release(&group));
    }

    #[test]
    fn sent_with_waiting_is_releasable() {
        let group = group_of(&[EventType::MessageSent, EventType::MessageWaiting]);
        assert!(MessageSentReleaseHandler.can_release(&group));
    }

    #[test]
    fn sent_alone_is_not_releasable() {
        let group = group_of(&[EventType::MessageSent, EventType::MessageSent]);
        assert!(!MessageSentReleaseHandler.can_release(&group));
    }

    #[test]
    fn consumers_alone_are_not_releasable() {
        let group = group_of(&[EventType::StartMessageDeployed, EventType::MessageWaiting]);
        assert!(!MessageSentReleaseHandler.can_release(&group));
    }

    #[test]
    fn chain_releases_when_any_handler_does() {
        let chain = ReleaseStrategyChain::first(|_: &MessageGroup| false).then(MessageSentReleaseHandler);
        let group = group_of(&[EventType::MessageWaiting, EventType::MessageSent]);
        assert!(chain.can_release(&group));
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn chain_never_releases_empty_group() {
        let chain = ReleaseStrategyChain::first(|_: &MessageGroup| true);
        assert!(!chain.can_release(&group_of(&[])));
    }
}
