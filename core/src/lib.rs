//! # Correlator Core
//!
//! Core types and traits for the message correlator.
//!
//! The correlator consumes lifecycle events emitted by workflow runtimes
//! (message sent, message waiting, start message deployed, ...), groups them
//! by a correlation key and releases command payloads once a group holds a
//! matching producer/consumer pair.
//!
//! ## Core Concepts
//!
//! - **Message**: Immutable payload plus headers ([`message::Message`])
//! - **Correlation Key**: Identity of a group ([`correlation::CorrelationKey`])
//! - **Message Group**: Snapshot of buffered messages ([`group::MessageGroup`])
//! - **Group Store**: Durable group storage ([`store::MessageGroupStore`])
//! - **Channel**: Outbound delivery target ([`channel::MessageChannel`])
//! - **Message Bus**: Inbound transport ([`message_bus::MessageBus`])
//!
//! ## Example
//!
//! ```
//! use correlator_core::correlation::{CorrelationStrategy, MessageEventCorrelationStrategy};
//! use correlator_core::message::{EventType, Message};
//! use correlator_core::headers;
//!
//! let message = Message::builder(serde_json::json!({ "name": "order" }))
//!     .event_type(EventType::MessageSent)
//!     .header(headers::APP_NAME, "rb")
//!     .header(headers::MESSAGE_EVENT_NAME, "order")
//!     .header(headers::MESSAGE_EVENT_CORRELATION_KEY, "42")
//!     .build();
//!
//! let key = MessageEventCorrelationStrategy.correlation_key(&message);
//! assert_eq!(key.map(|k| k.into_inner()), Some("rb:order:42".to_string()));
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod channel;
pub mod correlation;
pub mod group;
pub mod headers;
pub mod message;
pub mod message_bus;
pub mod payload;
pub mod store;

/// Environment module - Injected dependencies
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// Group stores stamp `created_at` / `last_modified` through this trait so
    /// tests can pin time with a fixed clock.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
