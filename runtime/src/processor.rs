//! Group processors: drain a releasable group into commands.
//!
//! A processor selects the `MESSAGE_SENT` events it consumes, converts them,
//! removes them from the store and returns one [`TransformedMessage`] per
//! event it actually removed. Conversion runs before removal so a malformed
//! event never leaves the store half drained.
//!
//! When two deliveries race on the same group, only one of them removes a
//! given event; the other gets an empty result instead of a duplicate.

use crate::predicates::{by_timestamp, EventTypeFilter};
use correlator_core::group::MessageGroup;
use correlator_core::message::{Message, MessageId};
use correlator_core::payload::{
    CommandPayload, ConversionError, ReceiveMessagePayload, StartMessagePayload,
};
use correlator_core::store::{MessageGroupStore, StoreError};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while processing a group.
#[derive(Error, Debug, Clone)]
pub enum ProcessorError {
    /// Removing the drained events failed. The store may or may not have
    /// applied the removal, so `selected` holds every event the call tried
    /// to drain.
    #[error("{error}")]
    Store {
        /// The store failure
        #[source]
        error: StoreError,
        /// Events selected for draining
        selected: Vec<Message>,
    },

    /// An event could not be converted into a command
    #[error(transparent)]
    Conversion(#[from] ConversionError),
}

/// A released command together with the event it was derived from.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformedMessage {
    source: Message,
    output: Message,
}

impl TransformedMessage {
    /// Pair a source event with its command.
    #[must_use]
    pub const fn new(source: Message, output: Message) -> Self {
        Self { source, output }
    }

    /// Event the command was derived from.
    #[must_use]
    pub const fn source(&self) -> &Message {
        &self.source
    }

    /// Outbound command.
    #[must_use]
    pub const fn output(&self) -> &Message {
        &self.output
    }

    /// Split into `(source, output)`.
    #[must_use]
    pub fn into_parts(self) -> (Message, Message) {
        (self.source, self.output)
    }
}

/// Boxed future returned by [`GroupProcessor::process`].
pub type ProcessFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<TransformedMessage>, ProcessorError>> + Send + 'a>>;

/// Turns a releasable group into commands.
pub trait GroupProcessor: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Whether this processor handles `group`.
    fn can_process(&self, group: &MessageGroup) -> bool;

    /// Drain `group` and return the commands in dispatch order.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError`] if conversion or removal fails. Nothing
    /// is removed when conversion fails.
    fn process<'a>(&'a self, group: &'a MessageGroup) -> ProcessFuture<'a>;
}

/// Runs the first processor that can handle the group.
#[derive(Clone, Default)]
pub struct GroupProcessorChain {
    processors: Vec<Arc<dyn GroupProcessor>>,
}

impl GroupProcessorChain {
    /// Start a chain with its first processor.
    #[must_use]
    pub fn first(processor: impl GroupProcessor + 'static) -> Self {
        Self {
            processors: vec![Arc::new(processor)],
        }
    }

    /// Append a processor.
    #[must_use]
    pub fn then(mut self, processor: impl GroupProcessor + 'static) -> Self {
        self.processors.push(Arc::new(processor));
        self
    }

    /// The standard chain: start messages first, then receive messages.
    #[must_use]
    pub fn standard(store: Arc<dyn MessageGroupStore>) -> Self {
        Self::first(StartMessagePayloadGroupProcessor::new(Arc::clone(&store)))
            .then(ReceiveMessagePayloadGroupProcessor::new(store))
    }

    fn select(&self, group: &MessageGroup) -> Option<&Arc<dyn GroupProcessor>> {
        self.processors.iter().find(|p| p.can_process(group))
    }
}

impl std::fmt::Debug for GroupProcessorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.processors.iter().map(|p| p.name()))
            .finish()
    }
}

impl GroupProcessor for GroupProcessorChain {
    fn name(&self) -> &'static str {
        "GroupProcessorChain"
    }

    fn can_process(&self, group: &MessageGroup) -> bool {
        self.select(group).is_some()
    }

    fn process<'a>(&'a self, group: &'a MessageGroup) -> ProcessFuture<'a> {
        Box::pin(async move {
            match self.select(group) {
                Some(processor) => {
                    tracing::debug!(
                        processor = processor.name(),
                        correlation_key = %group.key(),
                        "Processing group"
                    );
                    processor.process(group).await
                }
                None => Ok(Vec::new()),
            }
        })
    }
}

/// Convert `sources`, remove them from the store and keep the commands
/// whose source this call actually removed.
async fn drain(
    store: &dyn MessageGroupStore,
    group: &MessageGroup,
    sources: Vec<&Message>,
    convert: impl Fn(&Message) -> Result<CommandPayload, ConversionError>,
) -> Result<Vec<TransformedMessage>, ProcessorError> {
    if sources.is_empty() {
        return Ok(Vec::new());
    }

    let mut transformed = sources
        .into_iter()
        .map(|source| {
            let output = convert(source)?.to_message(source)?;
            Ok(TransformedMessage::new(source.clone(), output))
        })
        .collect::<Result<Vec<_>, ConversionError>>()?;

    let ids: Vec<MessageId> = transformed.iter().map(|t| t.source.id()).collect();
    let removed: HashSet<MessageId> = match store.remove_messages(group.key(), &ids).await {
        Ok(removed) => removed.iter().map(Message::id).collect(),
        Err(error) => {
            return Err(ProcessorError::Store {
                error,
                selected: transformed.into_iter().map(|t| t.source).collect(),
            })
        }
    };

    if removed.len() < ids.len() {
        tracing::debug!(
            correlation_key = %group.key(),
            selected = ids.len(),
            removed = removed.len(),
            "Concurrent drain removed some events first"
        );
    }

    transformed.retain(|t| removed.contains(&t.source.id()));
    transformed.sort_by(|a, b| by_timestamp(&a.source, &b.source));
    Ok(transformed)
}

/// Starts one process instance per buffered `MESSAGE_SENT` when a
/// `START_MESSAGE_DEPLOYED` is in the group.
///
/// Every sent event is drained; the deployed event stays so later sends are
/// released too.
pub struct StartMessagePayloadGroupProcessor {
    store: Arc<dyn MessageGroupStore>,
}

impl StartMessagePayloadGroupProcessor {
    /// Processor draining from `store`.
    #[must_use]
    pub fn new(store: Arc<dyn MessageGroupStore>) -> Self {
        Self { store }
    }
}

impl GroupProcessor for StartMessagePayloadGroupProcessor {
    fn name(&self) -> &'static str {
        "StartMessagePayloadGroupProcessor"
    }

    fn can_process(&self, group: &MessageGroup) -> bool {
        EventTypeFilter::START_MESSAGE_DEPLOYED.any(group)
    }

    fn process<'a>(&'a self, group: &'a MessageGroup) -> ProcessFuture<'a> {
        Box::pin(async move {
            let sent = EventTypeFilter::MESSAGE_SENT.select(group);
            drain(self.store.as_ref(), group, sent, |m| {
                StartMessagePayload::try_from(m).map(CommandPayload::from)
            })
            .await
        })
    }
}

/// Delivers the oldest buffered `MESSAGE_SENT` to a `MESSAGE_WAITING`
/// catch event.
///
/// Exactly one sent event is drained per release. The waiting event stays
/// until its `MESSAGE_RECEIVED` arrives.
pub struct ReceiveMessagePayloadGroupProcessor {
    store: Arc<dyn MessageGroupStore>,
}

impl ReceiveMessagePayloadGroupProcessor {
    /// Processor draining from `store`.
    #[must_use]
    pub fn new(store: Arc<dyn MessageGroupStore>) -> Self {
        Self { store }
    }
}

impl GroupProcessor for ReceiveMessagePayloadGroupProcessor {
    fn name(&self) -> &'static str {
        "ReceiveMessagePayloadGroupProcessor"
    }

    fn can_process(&self, group: &MessageGroup) -> bool {
        EventTypeFilter::MESSAGE_WAITING.any(group)
    }

    fn process<'a>(&'a self, group: &'a MessageGroup) -> ProcessFuture<'a> {
        Box::pin(async move {
            let oldest = EventTypeFilter::MESSAGE_SENT.oldest(group).into_iter().collect();
            drain(self.store.as_ref(), group, oldest, |m| {
                ReceiveMessagePayload::try_from(m).map(CommandPayload::from)
            })
            .await
        })
    }
}
