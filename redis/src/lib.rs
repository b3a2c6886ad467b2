//! Redis storage for the message correlator.
//!
//! # Architecture
//!
//! Every key lives under a configurable prefix (default `correlator`):
//! - **Messages**: `{prefix}:group:{key}:messages` (Hash) → message id to JSON
//! - **Order**: `{prefix}:group:{key}:order` (Sorted set) → message id by arrival sequence
//! - **Group state**: `{prefix}:group:{key}:meta` (Hash) → `complete`, `created_at`, `last_modified`
//! - **Sequence**: `{prefix}:seq` → arrival counter shared by all groups
//! - **Locks**: `{prefix}:lock:{key}` → holder token with a lease
//! - **Idempotency keys**: `{prefix}:processed:{key}`
//!
//! # Example
//!
//! ```no_run
//! use correlator_redis::{RedisMessageGroupStore, connect};
//!
//! # async fn example() -> Result<(), correlator_core::store::StoreError> {
//! let conn = connect("redis://127.0.0.1:6379").await?;
//! let store = RedisMessageGroupStore::new(conn);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod group_store;
mod lock;
mod metadata;

pub use group_store::RedisMessageGroupStore;
pub use lock::RedisLockRegistry;
pub use metadata::RedisMetadataStore;

use correlator_core::store::StoreError;
use redis::Client;
use redis::aio::ConnectionManager;

/// Key prefix used when none is configured.
pub const DEFAULT_PREFIX: &str = "correlator";

/// Open a reconnecting connection.
///
/// # Errors
///
/// Returns [`StoreError::Unavailable`] if the URL is invalid or Redis
/// cannot be reached.
pub async fn connect(redis_url: &str) -> Result<ConnectionManager, StoreError> {
    let client = Client::open(redis_url)
        .map_err(|e| StoreError::Unavailable(format!("Failed to create Redis client: {e}")))?;
    let conn = ConnectionManager::new(client).await.map_err(|e| {
        StoreError::Unavailable(format!("Failed to create Redis connection manager: {e}"))
    })?;
    tracing::info!("Redis connection manager created");
    Ok(conn)
}

pub(crate) fn redis_error(error: &redis::RedisError) -> StoreError {
    StoreError::Unavailable(error.to_string())
}
