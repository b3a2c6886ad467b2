//! Correlation keys and the strategies that derive them.
//!
//! Every message that reaches the aggregator is mapped to a
//! [`CorrelationKey`]. Messages that share a key share a group.

use crate::headers;
use crate::message::Message;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for `CorrelationKey` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid correlation key: {0}")]
pub struct ParseCorrelationKeyError(String);

/// Identity of a message group.
///
/// For lifecycle events the key is composed as
/// `{appName}:{messageEventName}[:{messageEventCorrelationKey}]`.
///
/// # Validation
///
/// - `FromStr::from_str()`: Rejects empty strings
/// - `From::from()` and `new()`: No validation (trusted input)
///
/// # Examples
///
/// ```
/// use correlator_core::correlation::CorrelationKey;
///
/// let key = CorrelationKey::new("rb:order:42");
/// assert_eq!(key.as_str(), "rb:order:42");
///
/// assert!("".parse::<CorrelationKey>().is_err());
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationKey(String);

impl CorrelationKey {
    /// Create a new `CorrelationKey` from a string.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the key and return the inner string.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CorrelationKey {
    type Err = ParseCorrelationKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseCorrelationKeyError(
                "Correlation key cannot be empty".to_string(),
            ));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for CorrelationKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CorrelationKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for CorrelationKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Derives the group a message belongs to.
///
/// Returning `None` means the message cannot be correlated; the aggregator
/// rejects it instead of guessing a group.
pub trait CorrelationStrategy: Send + Sync {
    /// Compute the correlation key of `message`.
    fn correlation_key(&self, message: &Message) -> Option<CorrelationKey>;
}

impl<F> CorrelationStrategy for F
where
    F: Fn(&Message) -> Option<CorrelationKey> + Send + Sync,
{
    fn correlation_key(&self, message: &Message) -> Option<CorrelationKey> {
        self(message)
    }
}

/// Reads the key verbatim from a single header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderCorrelationStrategy {
    header: String,
}

impl HeaderCorrelationStrategy {
    /// Correlate on the given header.
    #[must_use]
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }
}

impl Default for HeaderCorrelationStrategy {
    fn default() -> Self {
        Self::new(headers::CORRELATION_ID)
    }
}

impl CorrelationStrategy for HeaderCorrelationStrategy {
    fn correlation_key(&self, message: &Message) -> Option<CorrelationKey> {
        message
            .header_str(&self.header)
            .filter(|s| !s.is_empty())
            .map(CorrelationKey::from)
    }
}

/// Strategy used for workflow lifecycle events.
///
/// An explicit `correlationId` header wins. Otherwise the key is composed
/// from `appName`, `messageEventName` and, when present and non-null,
/// `messageEventCorrelationKey`, joined with `:`. A missing event name makes
/// the message uncorrelatable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageEventCorrelationStrategy;

impl CorrelationStrategy for MessageEventCorrelationStrategy {
    fn correlation_key(&self, message: &Message) -> Option<CorrelationKey> {
        if let Some(id) = message
            .header_str(headers::CORRELATION_ID)
            .filter(|s| !s.is_empty())
        {
            return Some(CorrelationKey::from(id));
        }

        let name = message
            .header_str(headers::MESSAGE_EVENT_NAME)
            .filter(|s| !s.is_empty())?;

        let parts: Vec<&str> = [
            message.header_str(headers::APP_NAME),
            Some(name),
            message.header_str(headers::MESSAGE_EVENT_CORRELATION_KEY),
        ]
        .into_iter()
        .flatten()
        .collect();

        Some(CorrelationKey::new(parts.join(":")))
    }
}
