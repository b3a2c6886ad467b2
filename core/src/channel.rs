//! Outbound channels and destination resolution.
//!
//! Released commands leave the aggregator through a [`MessageChannel`]. The
//! destination router is itself a channel that picks the concrete target
//! through a [`ChannelResolver`].

use crate::message::Message;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// A released message names no destination, or one nobody serves.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unable to determine target channel for message")]
pub struct RoutingError {
    destination: Option<String>,
}

impl RoutingError {
    /// Routing failed for `destination` (`None` when the header is absent).
    #[must_use]
    pub const fn new(destination: Option<String>) -> Self {
        Self { destination }
    }

    /// Destination the message asked for, if any.
    #[must_use]
    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }
}

/// Errors raised when sending to a channel.
#[derive(Error, Debug, Clone)]
pub enum ChannelError {
    /// The channel could not accept the message
    #[error("Send to channel '{channel}' failed: {reason}")]
    SendFailed {
        /// Channel name
        channel: String,
        /// The reason for failure
        reason: String,
    },

    /// The channel is closed
    #[error("Channel '{0}' is closed")]
    Closed(String),

    /// No channel serves the message's destination
    #[error(transparent)]
    Routing(#[from] RoutingError),
}

impl ChannelError {
    /// Whether resending may succeed. Routing faults are permanent.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Routing(_))
    }
}

/// Boxed future returned by [`MessageChannel::send`].
pub type SendFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ChannelError>> + Send + 'a>>;

/// Destination for outbound messages.
pub trait MessageChannel: Send + Sync {
    /// Channel name, used in logs and errors.
    fn name(&self) -> &str;

    /// Send `message`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] if the message was not accepted.
    fn send(&self, message: Message) -> SendFuture<'_>;
}

/// Maps destination names to channels.
pub trait ChannelResolver: Send + Sync {
    /// Channel serving `destination`, if any.
    fn resolve(&self, destination: &str) -> Option<Arc<dyn MessageChannel>>;
}
