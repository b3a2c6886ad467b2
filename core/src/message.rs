//! Immutable messages and lifecycle event types.
//!
//! A [`Message`] is a JSON payload plus a header map. Messages are never
//! mutated after construction; the correlator derives new messages (the
//! released commands) instead of editing inbound ones.

use crate::headers;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Header map of a message.
pub type Headers = BTreeMap<String, Value>;

/// Error type for `MessageId` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid message ID: {0}")]
pub struct ParseMessageIdError(String);

/// Unique identifier of a message.
///
/// Identity is what the group store deduplicates on: adding the same id to
/// a group twice keeps a single copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generate a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ParseMessageIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ParseMessageIdError(format!("{s}: {e}")))
    }
}

/// Error returned when a string names no known lifecycle event type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown message event type: {0}")]
pub struct UnknownEventType(String);

/// Lifecycle events emitted by workflow runtimes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// A process published a message.
    MessageSent,
    /// A process instance is waiting on an intermediate catch event.
    MessageWaiting,
    /// The waiting catch event consumed its message.
    MessageReceived,
    /// The waiting catch event's subscription was cancelled.
    MessageSubscriptionCancelled,
    /// A process definition with a message start event was deployed.
    StartMessageDeployed,
}

impl EventType {
    /// Every event type, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::MessageSent,
        Self::MessageWaiting,
        Self::MessageReceived,
        Self::MessageSubscriptionCancelled,
        Self::StartMessageDeployed,
    ];

    /// Wire representation used in the `messageEventType` header.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::MessageSent => "MESSAGE_SENT",
            Self::MessageWaiting => "MESSAGE_WAITING",
            Self::MessageReceived => "MESSAGE_RECEIVED",
            Self::MessageSubscriptionCancelled => "MESSAGE_SUBSCRIPTION_CANCELLED",
            Self::StartMessageDeployed => "START_MESSAGE_DEPLOYED",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownEventType(s.to_string()))
    }
}

/// An immutable message: JSON payload plus headers.
///
/// # Examples
///
/// ```
/// use correlator_core::message::{EventType, Message};
///
/// let message = Message::builder(serde_json::json!({ "name": "order" }))
///     .event_type(EventType::MessageSent)
///     .timestamp(1_000)
///     .build();
///
/// assert_eq!(message.event_type(), Some(EventType::MessageSent));
/// assert_eq!(message.timestamp(), 1_000);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: MessageId,
    timestamp: i64,
    headers: Headers,
    payload: Value,
}

impl Message {
    /// Start building a message around `payload`.
    #[must_use]
    pub fn builder(payload: Value) -> MessageBuilder {
        MessageBuilder::new(payload)
    }

    /// Message identity.
    #[must_use]
    pub const fn id(&self) -> MessageId {
        self.id
    }

    /// Creation time in epoch milliseconds.
    #[must_use]
    pub const fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// All headers.
    #[must_use]
    pub const fn headers(&self) -> &Headers {
        &self.headers
    }

    /// JSON payload.
    #[must_use]
    pub const fn payload(&self) -> &Value {
        &self.payload
    }

    /// Raw header value.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name)
    }

    /// Header value when it is a JSON string. Null and non-string values
    /// read as absent.
    #[must_use]
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(Value::as_str)
    }

    /// Lifecycle event type, if the header is present and recognised.
    #[must_use]
    pub fn event_type(&self) -> Option<EventType> {
        self.header_str(headers::MESSAGE_EVENT_TYPE)
            .and_then(|s| s.parse().ok())
    }

    /// Whether this message is a lifecycle event of type `event_type`.
    #[must_use]
    pub fn is_event_type(&self, event_type: EventType) -> bool {
        self.event_type() == Some(event_type)
    }

    /// Logical output destination requested by the emitter.
    #[must_use]
    pub fn output_destination(&self) -> Option<&str> {
        self.header_str(headers::MESSAGE_EVENT_OUTPUT_DESTINATION)
    }

    /// Consume the message, returning its payload.
    #[must_use]
    pub fn into_payload(self) -> Value {
        self.payload
    }
}

/// Builder for [`Message`].
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    id: Option<MessageId>,
    timestamp: Option<i64>,
    headers: Headers,
    payload: Value,
}

impl MessageBuilder {
    fn new(payload: Value) -> Self {
        Self {
            id: None,
            timestamp: None,
            headers: Headers::new(),
            payload,
        }
    }

    /// Use an explicit id instead of a random one.
    #[must_use]
    pub const fn id(mut self, id: MessageId) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the creation time in epoch milliseconds.
    #[must_use]
    pub const fn timestamp(mut self, millis: i64) -> Self {
        self.timestamp = Some(millis);
        self
    }

    /// Set a header. `None` values are stored as JSON null.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Copy every header from `headers`, overwriting existing entries.
    #[must_use]
    pub fn copy_headers(mut self, headers: &Headers) -> Self {
        self.headers
            .extend(headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Set the `messageEventType` header.
    #[must_use]
    pub fn event_type(self, event_type: EventType) -> Self {
        self.header(headers::MESSAGE_EVENT_TYPE, event_type.as_str())
    }

    /// Finish the message.
    ///
    /// The timestamp resolves to the explicit value, else a numeric
    /// `timestamp` header, else the current time. The `timestamp` header is
    /// rewritten to the resolved value so both views agree.
    #[must_use]
    pub fn build(mut self) -> Message {
        let timestamp = self
            .timestamp
            .or_else(|| {
                self.headers
                    .get(headers::TIMESTAMP)
                    .and_then(Value::as_i64)
            })
            .unwrap_or_else(|| Utc::now().timestamp_millis());
        self.headers
            .insert(headers::TIMESTAMP.to_string(), Value::from(timestamp));

        Message {
            id: self.id.unwrap_or_default(),
            timestamp,
            headers: self.headers,
            payload: self.payload,
        }
    }
}
