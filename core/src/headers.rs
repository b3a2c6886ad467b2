//! Header names carried by lifecycle events and released commands.
//!
//! Workflow runtimes stamp these headers on every message event they emit.
//! The correlator reads them to classify, correlate and route messages.

/// Lifecycle event type, one of [`EventType`](crate::message::EventType).
pub const MESSAGE_EVENT_TYPE: &str = "messageEventType";

/// Message name declared in the process definition.
pub const MESSAGE_EVENT_NAME: &str = "messageEventName";

/// Business correlation key. May be absent or null.
pub const MESSAGE_EVENT_CORRELATION_KEY: &str = "messageEventCorrelationKey";

/// Unique id of the lifecycle event, used for duplicate detection.
pub const MESSAGE_EVENT_ID: &str = "messageEventId";

/// Name of the emitting application.
pub const APP_NAME: &str = "appName";

/// Logical destination the released command is routed to.
pub const MESSAGE_EVENT_OUTPUT_DESTINATION: &str = "messageEventOutputDestination";

/// Payload type stamped on released commands.
pub const MESSAGE_PAYLOAD_TYPE: &str = "messagePayloadType";

/// Explicit correlation id. Takes precedence over the composed key.
pub const CORRELATION_ID: &str = "correlationId";

/// Creation time of the message in epoch milliseconds.
pub const TIMESTAMP: &str = "timestamp";
