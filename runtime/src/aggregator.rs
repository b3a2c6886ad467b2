//! The correlating aggregator.
//!
//! For every inbound lifecycle event the aggregator:
//!
//! 1. derives the correlation key, takes the per-key lock and claims the
//!    event's idempotency key (a redelivered event stops here)
//! 2. applies an advice (`MESSAGE_RECEIVED`, `MESSAGE_SUBSCRIPTION_CANCELLED`)
//!    or validates and buffers the event
//! 3. evaluates the release strategy on the stored group
//! 4. runs the processor chain once and dispatches the commands
//! 5. completes (and optionally expires) a group drained to zero
//!
//! Steps 2 to 5 form one critical section per key. Different keys never
//! wait on each other.
//!
//! # Failure handling
//!
//! - A malformed event is rejected before any store mutation.
//! - A buffered event that fails conversion during release is quarantined
//!   (removed and counted) so it cannot block the group forever.
//! - When dispatch fails, the sources of undispatched commands are put back
//!   and an inbound event added by this call is withdrawn, so redelivery
//!   replays cleanly.
//! - When draining fails in the store, the selected events are put back.
//!   Adding is idempotent by id, so this holds whether or not the removal
//!   was applied.
//! - A retryable failure releases the idempotency claim so the redelivery
//!   is handled again.

use crate::advice::{default_advices, AggregatorAdvice};
use crate::config::AggregatorConfig;
use crate::idempotent::IdempotentReceiver;
use crate::memory::InMemoryMetadataStore;
use crate::metrics::AggregatorMetrics;
use crate::processor::{GroupProcessor, GroupProcessorChain, ProcessorError, TransformedMessage};
use crate::release::{default_release_chain, ReleaseStrategy};
use crate::retry::Retryable;
use correlator_core::channel::{ChannelError, MessageChannel};
use correlator_core::correlation::{CorrelationKey, CorrelationStrategy, MessageEventCorrelationStrategy};
use correlator_core::message::{Message, MessageId};
use correlator_core::payload::{ConversionError, MessageEventPayload};
use correlator_core::store::{LockRegistry, MessageGroupStore, StoreError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use thiserror::Error;

/// Errors returned by [`CorrelatingAggregator::handle`].
#[derive(Error, Debug, Clone)]
pub enum AggregatorError {
    /// The group store or lock registry failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// An event payload could not be converted
    #[error(transparent)]
    Conversion(#[from] ConversionError),

    /// A released command could not be delivered
    #[error(transparent)]
    Dispatch(#[from] ChannelError),

    /// The event carries no correlation information
    #[error("Message {message_id} carries no correlation information")]
    MissingCorrelation {
        /// The offending message
        message_id: MessageId,
    },

    /// The aggregator has been stopped
    #[error("Aggregator is stopped")]
    Stopped,
}

impl AggregatorError {
    /// Whether redelivering the same event may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
            Self::Dispatch(e) => e.is_retryable(),
            Self::Conversion(_) | Self::MissingCorrelation { .. } | Self::Stopped => false,
        }
    }
}

impl Retryable for AggregatorError {
    fn is_retryable(&self) -> bool {
        Self::is_retryable(self)
    }
}

impl From<ProcessorError> for AggregatorError {
    fn from(error: ProcessorError) -> Self {
        match error {
            ProcessorError::Store { error, .. } => Self::Store(error),
            ProcessorError::Conversion(e) => Self::Conversion(e),
        }
    }
}

/// What happened to one inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Buffered; the group is not releasable yet
    Accumulated {
        /// Group key
        key: CorrelationKey,
        /// Group size after buffering
        size: usize,
    },
    /// The group was released and commands were dispatched
    Released {
        /// Group key
        key: CorrelationKey,
        /// Commands dispatched
        dispatched: usize,
    },
    /// An advice removed waiting events
    Advised {
        /// Group key
        key: CorrelationKey,
        /// Events removed
        removed: usize,
    },
    /// The group is complete; the event was dropped
    Discarded {
        /// Group key
        key: CorrelationKey,
    },
    /// The event has no recognised type and never reached the aggregator
    Filtered,
    /// The event's idempotency key was already claimed
    Duplicate,
}

/// Missing component when building an aggregator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Aggregator requires a {0}")]
pub struct BuildError(&'static str);

/// Groups lifecycle events by correlation key and releases commands.
///
/// # Example
///
/// ```ignore
/// let aggregator = CorrelatingAggregator::builder()
///     .store(store)
///     .lock_registry(locks)
///     .output(Arc::new(DestinationRouter::new(resolver)))
///     .config(AggregatorConfig::default())
///     .build()?;
///
/// match aggregator.handle(message).await? {
///     HandleOutcome::Released { dispatched, .. } => println!("{dispatched} commands"),
///     other => println!("{other:?}"),
/// }
/// ```
pub struct CorrelatingAggregator {
    store: Arc<dyn MessageGroupStore>,
    locks: Arc<dyn LockRegistry>,
    output: Arc<dyn MessageChannel>,
    correlation: Arc<dyn CorrelationStrategy>,
    release: Arc<dyn ReleaseStrategy>,
    processor: Arc<dyn GroupProcessor>,
    advices: Vec<Arc<dyn AggregatorAdvice>>,
    receiver: IdempotentReceiver,
    config: AggregatorConfig,
    running: AtomicBool,
}

impl CorrelatingAggregator {
    /// Start building an aggregator.
    #[must_use]
    pub fn builder() -> CorrelatingAggregatorBuilder {
        CorrelatingAggregatorBuilder::default()
    }

    /// Accept messages again after [`stop`](Self::stop).
    pub fn start(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            tracing::info!(output = self.output.name(), "Aggregator started");
        }
    }

    /// Reject every message until [`start`](Self::start) is called.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            tracing::info!(output = self.output.name(), "Aggregator stopped");
        }
    }

    /// Whether messages are accepted.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> AggregatorConfig {
        self.config
    }

    /// Backing group store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn MessageGroupStore> {
        &self.store
    }

    /// Handle one inbound event.
    ///
    /// # Errors
    ///
    /// Returns [`AggregatorError`]; see [`AggregatorError::is_retryable`]
    /// for how the caller should treat the delivery.
    pub async fn handle(&self, message: Message) -> Result<HandleOutcome, AggregatorError> {
        if !self.is_running() {
            return Err(AggregatorError::Stopped);
        }

        let started = Instant::now();
        let event_type = message.event_type().map_or("UNKNOWN", |t| t.as_str());
        let result = self.handle_correlated(message).await;

        if matches!(result, Err(AggregatorError::Store(_))) {
            AggregatorMetrics::record_store_error();
        }
        AggregatorMetrics::record_handled(event_type, started.elapsed());
        result
    }

    async fn handle_correlated(&self, message: Message) -> Result<HandleOutcome, AggregatorError> {
        let key = self
            .correlation
            .correlation_key(&message)
            .ok_or(AggregatorError::MissingCorrelation {
                message_id: message.id(),
            })?;

        let _lock = self.locks.obtain(&key).await?;

        if !self.receiver.claim(&message).await? {
            tracing::warn!(
                correlation_key = %key,
                message_id = %message.id(),
                idempotency_key = %IdempotentReceiver::key_for(&message),
                "Discarding duplicate message"
            );
            AggregatorMetrics::record_discard("duplicate");
            return Ok(HandleOutcome::Duplicate);
        }

        let result = self.handle_claimed(key, &message).await;

        if result.as_ref().is_err_and(AggregatorError::is_retryable) {
            if let Err(e) = self.receiver.release(&message).await {
                tracing::error!(
                    message_id = %message.id(),
                    error = %e,
                    "Failed to release idempotency claim"
                );
            }
        }
        result
    }

    /// Steps 2 to 5 for an event whose idempotency key this call holds.
    async fn handle_claimed(
        &self,
        key: CorrelationKey,
        message: &Message,
    ) -> Result<HandleOutcome, AggregatorError> {
        if let Some(advice) = self.advices.iter().find(|a| a.applies_to(message)) {
            let removed = advice.apply(&key, message).await?;
            tracing::debug!(
                correlation_key = %key,
                message_id = %message.id(),
                advice = advice.name(),
                removed = removed.len(),
                "Applied advice"
            );
            if !removed.is_empty() {
                self.complete_if_empty(&key).await?;
            }
            return Ok(HandleOutcome::Advised {
                key,
                removed: removed.len(),
            });
        }

        MessageEventPayload::try_from(message)?;

        let current = self.store.get_group(&key).await?;
        if current.is_complete() {
            tracing::warn!(
                correlation_key = %key,
                message_id = %message.id(),
                "Discarding message for completed group"
            );
            AggregatorMetrics::record_discard("completed_group");
            return Ok(HandleOutcome::Discarded { key });
        }

        let newly_added = !current.contains(message.id());
        let mut group = self.store.add_message(&key, message.clone()).await?;

        let released = loop {
            if !self.release.can_release(&group) {
                tracing::debug!(
                    correlation_key = %key,
                    message_id = %message.id(),
                    size = group.size(),
                    "Message buffered"
                );
                return Ok(HandleOutcome::Accumulated {
                    size: group.size(),
                    key,
                });
            }

            match self.processor.process(&group).await {
                Ok(released) => break released,
                Err(ProcessorError::Conversion(e)) => {
                    let offender = e.message_id().unwrap_or_else(|| message.id());
                    self.quarantine(&key, offender, &e).await?;
                    if offender == message.id() {
                        return Err(e.into());
                    }
                    group = self.store.get_group(&key).await?;
                }
                Err(ProcessorError::Store { error, selected }) => {
                    tracing::warn!(
                        correlation_key = %key,
                        message_id = %message.id(),
                        selected = selected.len(),
                        error = %error,
                        "Drain failed, restoring selected messages"
                    );
                    self.restore(&key, selected).await;
                    return Err(error.into());
                }
            }
        };

        let mut dispatched = 0;
        for transformed in &released {
            if let Err(e) = self.output.send(transformed.output().clone()).await {
                tracing::warn!(
                    correlation_key = %key,
                    message_id = %message.id(),
                    dispatched,
                    pending = released.len() - dispatched,
                    error = %e,
                    "Dispatch failed, compensating"
                );
                self.compensate(&key, message, newly_added, &released, dispatched)
                    .await;
                return Err(e.into());
            }
            dispatched += 1;
        }

        if !released.is_empty() {
            tracing::info!(correlation_key = %key, outputs = dispatched, "Released group");
            AggregatorMetrics::record_release(dispatched);
            self.complete_if_empty(&key).await?;
        }

        Ok(HandleOutcome::Released { key, dispatched })
    }

    async fn complete_if_empty(&self, key: &CorrelationKey) -> Result<(), StoreError> {
        if !self.config.complete_groups_when_empty || self.store.group_size(key).await? > 0 {
            return Ok(());
        }

        self.store.complete_group(key).await?;
        if self.config.expire_groups_upon_completion {
            self.store.remove_group(key).await?;
            tracing::debug!(correlation_key = %key, "Group completed and expired");
        } else {
            tracing::debug!(correlation_key = %key, "Group completed");
        }
        Ok(())
    }

    /// Remove an unconvertible buffered event so it cannot block its group.
    async fn quarantine(
        &self,
        key: &CorrelationKey,
        offender: MessageId,
        error: &ConversionError,
    ) -> Result<(), StoreError> {
        let removed = self.store.remove_messages(key, &[offender]).await?;
        if !removed.is_empty() {
            tracing::error!(
                correlation_key = %key,
                message_id = %offender,
                error = %error,
                "Quarantined unconvertible message"
            );
            AggregatorMetrics::record_quarantine();
        }
        Ok(())
    }

    /// Put `messages` back into the group. Messages still present are left
    /// as they are.
    async fn restore(&self, key: &CorrelationKey, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let count = messages.len();
        if let Err(e) = self.store.add_messages(key, messages).await {
            tracing::error!(
                correlation_key = %key,
                messages = count,
                error = %e,
                "Failed to restore drained messages"
            );
        }
    }

    /// Undo the drain of commands that were not dispatched.
    async fn compensate(
        &self,
        key: &CorrelationKey,
        inbound: &Message,
        newly_added: bool,
        released: &[TransformedMessage],
        dispatched: usize,
    ) {
        let (sent, pending) = released.split_at(dispatched);
        let inbound_sent = sent.iter().any(|t| t.source().id() == inbound.id());

        let restore: Vec<Message> = pending
            .iter()
            .map(TransformedMessage::source)
            .filter(|m| !(newly_added && m.id() == inbound.id()))
            .cloned()
            .collect();

        self.restore(key, restore).await;

        if newly_added && !inbound_sent {
            if let Err(e) = self.store.remove_messages(key, &[inbound.id()]).await {
                tracing::error!(
                    correlation_key = %key,
                    message_id = %inbound.id(),
                    error = %e,
                    "Failed to withdraw inbound message"
                );
            }
        }
    }
}

impl std::fmt::Debug for CorrelatingAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelatingAggregator")
            .field("output", &self.output.name())
            .field("processor", &self.processor.name())
            .field("advices", &self.advices.len())
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// Builder for [`CorrelatingAggregator`].
///
/// Store, lock registry and output are required. Correlation defaults to
/// [`MessageEventCorrelationStrategy`], release to the message-sent chain,
/// processing to the start/receive chain and advices to the received and
/// cancelled advices, all bound to the configured store.
#[derive(Default)]
pub struct CorrelatingAggregatorBuilder {
    store: Option<Arc<dyn MessageGroupStore>>,
    locks: Option<Arc<dyn LockRegistry>>,
    output: Option<Arc<dyn MessageChannel>>,
    correlation: Option<Arc<dyn CorrelationStrategy>>,
    release: Option<Arc<dyn ReleaseStrategy>>,
    processor: Option<Arc<dyn GroupProcessor>>,
    advices: Option<Vec<Arc<dyn AggregatorAdvice>>>,
    receiver: Option<IdempotentReceiver>,
    config: AggregatorConfig,
}

impl CorrelatingAggregatorBuilder {
    /// Group store.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn MessageGroupStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Per-key lock registry.
    #[must_use]
    pub fn lock_registry(mut self, locks: Arc<dyn LockRegistry>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Channel receiving released commands.
    #[must_use]
    pub fn output(mut self, output: Arc<dyn MessageChannel>) -> Self {
        self.output = Some(output);
        self
    }

    /// Replace the correlation strategy.
    #[must_use]
    pub fn correlation_strategy(mut self, strategy: impl CorrelationStrategy + 'static) -> Self {
        self.correlation = Some(Arc::new(strategy));
        self
    }

    /// Replace the release strategy.
    #[must_use]
    pub fn release_strategy(mut self, strategy: impl ReleaseStrategy + 'static) -> Self {
        self.release = Some(Arc::new(strategy));
        self
    }

    /// Replace the group processor.
    #[must_use]
    pub fn processor(mut self, processor: impl GroupProcessor + 'static) -> Self {
        self.processor = Some(Arc::new(processor));
        self
    }

    /// Replace the advices.
    #[must_use]
    pub fn advices(mut self, advices: Vec<Arc<dyn AggregatorAdvice>>) -> Self {
        self.advices = Some(advices);
        self
    }

    /// Duplicate detection. Defaults to an in-memory metadata store, which
    /// only recognises redeliveries seen by this process.
    #[must_use]
    pub fn idempotent_receiver(mut self, receiver: IdempotentReceiver) -> Self {
        self.receiver = Some(receiver);
        self
    }

    /// Group lifecycle settings.
    #[must_use]
    pub const fn config(mut self, config: AggregatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Build a running aggregator.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError`] if the store, lock registry or output is
    /// missing.
    pub fn build(self) -> Result<CorrelatingAggregator, BuildError> {
        let store = self.store.ok_or(BuildError("group store"))?;
        let locks = self.locks.ok_or(BuildError("lock registry"))?;
        let output = self.output.ok_or(BuildError("output channel"))?;

        let processor = self
            .processor
            .unwrap_or_else(|| Arc::new(GroupProcessorChain::standard(Arc::clone(&store))));
        let advices = self.advices.unwrap_or_else(|| default_advices(&store));

        Ok(CorrelatingAggregator {
            correlation: self
                .correlation
                .unwrap_or_else(|| Arc::new(MessageEventCorrelationStrategy)),
            release: self
                .release
                .unwrap_or_else(|| Arc::new(default_release_chain())),
            processor,
            advices,
            receiver: self
                .receiver
                .unwrap_or_else(|| IdempotentReceiver::new(Arc::new(InMemoryMetadataStore::new()))),
            store,
            locks,
            output,
            config: self.config,
            running: AtomicBool::new(true),
        })
    }
}
