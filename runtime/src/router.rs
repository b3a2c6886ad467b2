//! Destination routing for released commands.
//!
//! Each released command carries the `messageEventOutputDestination` header
//! of the event it was derived from. The router resolves that name to a
//! channel and forwards the command. There is no default channel: a command
//! without a resolvable destination is a routing fault.

use correlator_core::channel::{
    ChannelError, ChannelResolver, MessageChannel, RoutingError, SendFuture,
};
use correlator_core::message::Message;
use std::collections::HashMap;
use std::sync::Arc;

/// Routes messages to the channel named by their output destination.
pub struct DestinationRouter {
    resolver: Arc<dyn ChannelResolver>,
}

impl DestinationRouter {
    /// Router resolving destinations through `resolver`.
    #[must_use]
    pub fn new(resolver: Arc<dyn ChannelResolver>) -> Self {
        Self { resolver }
    }

    /// Channels `message` should be sent to.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError`] when the destination header is absent or
    /// names no known channel.
    pub fn resolve_destinations(
        &self,
        message: &Message,
    ) -> Result<Vec<Arc<dyn MessageChannel>>, RoutingError> {
        let destination = message
            .output_destination()
            .ok_or_else(|| RoutingError::new(None))?;

        self.resolver
            .resolve(destination)
            .map(|channel| vec![channel])
            .ok_or_else(|| RoutingError::new(Some(destination.to_string())))
    }
}

impl MessageChannel for DestinationRouter {
    fn name(&self) -> &str {
        "destinationRouter"
    }

    fn send(&self, message: Message) -> SendFuture<'_> {
        Box::pin(async move {
            let channels = self.resolve_destinations(&message).map_err(|e| {
                tracing::warn!(
                    message_id = %message.id(),
                    destination = e.destination().unwrap_or("<none>"),
                    "Unable to determine target channel for message"
                );
                ChannelError::from(e)
            })?;

            for channel in channels {
                tracing::debug!(
                    message_id = %message.id(),
                    channel = channel.name(),
                    "Routing message"
                );
                channel.send(message.clone()).await?;
            }
            Ok(())
        })
    }
}

/// Fixed destination-to-channel table.
#[derive(Clone, Default)]
pub struct StaticChannelResolver {
    channels: HashMap<String, Arc<dyn MessageChannel>>,
}

impl StaticChannelResolver {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `channel` under `destination`.
    #[must_use]
    pub fn channel(mut self, destination: impl Into<String>, channel: Arc<dyn MessageChannel>) -> Self {
        self.channels.insert(destination.into(), channel);
        self
    }

    /// Registered destination names.
    pub fn destinations(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }
}

impl ChannelResolver for StaticChannelResolver {
    fn resolve(&self, destination: &str) -> Option<Arc<dyn MessageChannel>> {
        self.channels.get(destination).cloned()
    }
}
