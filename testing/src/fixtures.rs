//! Lifecycle event fixtures.
//!
//! Events carry the headers and payload shape a process engine emits:
//! `messageEventType`, `messageEventName`, `messageEventCorrelationKey`,
//! `appName`, `messageEventOutputDestination` and `messageEventId` headers,
//! with a `{name, businessKey, correlationKey, variables}` payload.

use correlator_core::headers;
use correlator_core::message::{EventType, Message, MessageBuilder};
use serde_json::{Map, Value, json};
use uuid::Uuid;

/// Application name used when none is set.
pub const DEFAULT_APP_NAME: &str = "rb";

/// Builder for one lifecycle event.
#[derive(Debug, Clone)]
#[must_use]
pub struct EventFixture {
    event_type: EventType,
    app_name: String,
    name: String,
    correlation_key: Option<String>,
    business_key: Option<String>,
    variables: Map<String, Value>,
    destination: Option<String>,
    event_id: Option<String>,
    timestamp: Option<i64>,
    raw_headers: Vec<(String, Value)>,
}

impl EventFixture {
    /// Event of `event_type` for message `name` in the default application.
    pub fn new(event_type: EventType, name: impl Into<String>) -> Self {
        Self {
            event_type,
            app_name: DEFAULT_APP_NAME.to_string(),
            name: name.into(),
            correlation_key: None,
            business_key: None,
            variables: Map::new(),
            destination: None,
            event_id: None,
            timestamp: None,
            raw_headers: Vec::new(),
        }
    }

    /// Emitting application; also the default output destination.
    pub fn app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    /// Correlation key, set in both the header and the payload.
    pub fn correlation_key(mut self, key: impl Into<String>) -> Self {
        self.correlation_key = Some(key.into());
        self
    }

    /// Business key carried in the payload.
    pub fn business_key(mut self, key: impl Into<String>) -> Self {
        self.business_key = Some(key.into());
        self
    }

    /// Add one payload variable.
    pub fn variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// Output destination header, overriding the application name.
    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Stable `messageEventId`, as a redelivery would carry.
    pub fn event_id(mut self, id: impl Into<String>) -> Self {
        self.event_id = Some(id.into());
        self
    }

    /// Creation time in epoch milliseconds.
    pub fn timestamp(mut self, millis: i64) -> Self {
        self.timestamp = Some(millis);
        self
    }

    /// Set an arbitrary header after the standard ones.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.raw_headers.push((name.into(), value.into()));
        self
    }

    /// Build the event.
    #[must_use]
    pub fn build(self) -> Message {
        let payload = json!({
            "name": self.name,
            "businessKey": self.business_key,
            "correlationKey": self.correlation_key,
            "variables": self.variables,
        });

        let mut builder: MessageBuilder = Message::builder(payload)
            .event_type(self.event_type)
            .header(headers::APP_NAME, self.app_name.clone())
            .header(headers::MESSAGE_EVENT_NAME, self.name)
            .header(
                headers::MESSAGE_EVENT_OUTPUT_DESTINATION,
                self.destination.unwrap_or(self.app_name),
            )
            .header(
                headers::MESSAGE_EVENT_ID,
                self.event_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            );
        if let Some(key) = self.correlation_key {
            builder = builder.header(headers::MESSAGE_EVENT_CORRELATION_KEY, key);
        }
        if let Some(ts) = self.timestamp {
            builder = builder.timestamp(ts);
        }
        for (name, value) in self.raw_headers {
            builder = builder.header(name, value);
        }
        builder.build()
    }
}

/// A `MESSAGE_SENT` event.
pub fn message_sent(name: impl Into<String>) -> EventFixture {
    EventFixture::new(EventType::MessageSent, name)
}

/// A `START_MESSAGE_DEPLOYED` event.
pub fn start_message_deployed(name: impl Into<String>) -> EventFixture {
    EventFixture::new(EventType::StartMessageDeployed, name)
}

/// A `MESSAGE_WAITING` event.
pub fn message_waiting(name: impl Into<String>) -> EventFixture {
    EventFixture::new(EventType::MessageWaiting, name)
}

/// A `MESSAGE_RECEIVED` event.
pub fn message_received(name: impl Into<String>) -> EventFixture {
    EventFixture::new(EventType::MessageReceived, name)
}

/// A `MESSAGE_SUBSCRIPTION_CANCELLED` event.
pub fn subscription_cancelled(name: impl Into<String>) -> EventFixture {
    EventFixture::new(EventType::MessageSubscriptionCancelled, name)
}
