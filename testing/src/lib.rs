//! # Correlator Testing
//!
//! Testing utilities for the message correlator.
//!
//! This crate provides:
//! - A fixed clock for deterministic timestamps
//! - Lifecycle event fixtures shaped like the ones process engines emit
//! - Recording and failing output channels
//! - A store wrapper that injects storage faults
//! - An in-memory message bus that records acknowledgements
//! - proptest strategies for event batches
//!
//! ## Example
//!
//! ```
//! use correlator_testing::fixtures::message_sent;
//! use correlator_core::message::EventType;
//!
//! let event = message_sent("order").correlation_key("42").build();
//! assert_eq!(event.event_type(), Some(EventType::MessageSent));
//! ```

use chrono::{DateTime, Utc};
use correlator_core::environment::Clock;

pub mod bus;
pub mod channels;
pub mod faulty;
pub mod fixtures;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use correlator_testing::mocks::FixedClock;
    /// use correlator_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }

        /// The fixed time as epoch milliseconds, the unit message timestamps use.
        #[must_use]
        pub fn millis(&self) -> i64 {
            self.time.timestamp_millis()
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// Panics if the hardcoded timestamp fails to parse, which never
    /// happens in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Test helpers.
pub mod helpers {
    use tracing_subscriber::EnvFilter;

    /// Route `tracing` output to the test harness, filtered by `RUST_LOG`.
    ///
    /// Safe to call from every test; only the first call installs the
    /// subscriber.
    pub fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing strategies using proptest.
pub mod properties {
    use crate::fixtures::{message_sent, message_waiting};
    use correlator_core::message::{EventType, Message};
    use proptest::prelude::*;

    /// Any lifecycle event type.
    pub fn arb_event_type() -> impl Strategy<Value = EventType> {
        proptest::sample::select(EventType::ALL.to_vec())
    }

    /// A short lowercase identifier usable as an app, message or key name.
    pub fn arb_name() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9]{0,7}"
    }

    /// Epoch-millisecond timestamps in a narrow window, so collisions occur.
    pub fn arb_timestamp() -> impl Strategy<Value = i64> {
        1_735_689_600_000_i64..1_735_689_600_050_i64
    }

    /// Between one and `max` `MESSAGE_SENT` events for `name` with
    /// correlation key `key`, in arbitrary timestamp order.
    pub fn arb_sent_batch(name: &'static str, key: &'static str, max: usize) -> impl Strategy<Value = Vec<Message>> {
        proptest::collection::vec(arb_timestamp(), 1..=max.max(1)).prop_map(move |timestamps| {
            timestamps
                .into_iter()
                .map(|ts| message_sent(name).correlation_key(key).timestamp(ts).build())
                .collect()
        })
    }

    /// Between one and `max` `MESSAGE_WAITING` events for `name` with
    /// correlation key `key`.
    pub fn arb_waiting_batch(name: &'static str, key: &'static str, max: usize) -> impl Strategy<Value = Vec<Message>> {
        proptest::collection::vec(arb_timestamp(), 1..=max.max(1)).prop_map(move |timestamps| {
            timestamps
                .into_iter()
                .map(|ts| message_waiting(name).correlation_key(key).timestamp(ts).build())
                .collect()
        })
    }
}

// Re-export commonly used items
pub use bus::InMemoryMessageBus;
pub use channels::{FailingChannel, RecordingChannel};
pub use faulty::FaultyStore;
pub use mocks::{FixedClock, test_clock};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
        assert_eq!(clock.millis(), 1_735_689_600_000);
    }
}
