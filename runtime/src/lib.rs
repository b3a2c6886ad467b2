//! # Correlator Runtime
//!
//! The correlating aggregator and everything it is assembled from.
//!
//! ## Core Components
//!
//! - **Release strategies**: decide when a group holds a matching pair
//!   ([`release`])
//! - **Group processors**: drain a releasable group into commands
//!   ([`processor`])
//! - **Advices**: handle `MESSAGE_RECEIVED` / `MESSAGE_SUBSCRIPTION_CANCELLED`
//!   bookkeeping ([`advice`])
//! - **Aggregator**: per-key critical section tying it together
//!   ([`aggregator`])
//! - **Destination router**: routes commands to their target channel
//!   ([`router`])
//! - **Idempotent receiver**: claims each event's `messageEventId` inside
//!   the aggregator's critical section ([`idempotent`])
//! - **Connector**: filter, retries and the consumer loop with graceful
//!   drain ([`connector`])
//! - **In-memory backend**: reference store, lock registry and metadata
//!   store ([`memory`])
//!
//! ## Example
//!
//! ```ignore
//! use correlator_runtime::aggregator::CorrelatingAggregator;
//! use correlator_runtime::memory::{InMemoryLockRegistry, InMemoryMessageGroupStore};
//! use std::sync::Arc;
//!
//! let store = Arc::new(InMemoryMessageGroupStore::new());
//! let aggregator = CorrelatingAggregator::builder()
//!     .store(store)
//!     .lock_registry(Arc::new(InMemoryLockRegistry::new()))
//!     .output(router)
//!     .build()?;
//!
//! let outcome = aggregator.handle(message).await?;
//! ```

pub mod advice;
pub mod aggregator;
pub mod config;
pub mod connector;
pub mod idempotent;
pub mod memory;
pub mod metrics;
pub mod predicates;
pub mod processor;
pub mod release;
pub mod retry;
pub mod router;
pub mod timeout;

pub use aggregator::{AggregatorError, CorrelatingAggregator, HandleOutcome};
pub use config::AggregatorConfig;
pub use connector::MessageConnector;
pub use router::DestinationRouter;
