//! `PostgreSQL` storage for the message correlator.
//!
//! This crate provides the durable backend shared by every correlator
//! instance:
//!
//! - [`PostgresMessageGroupStore`]: groups and their buffered messages
//! - [`PgAdvisoryLockRegistry`]: per-key session advisory locks
//! - [`PostgresMetadataStore`]: idempotency keys
//!
//! # Example
//!
//! ```no_run
//! use correlator_postgres::{PostgresMessageGroupStore, connect, migrate};
//!
//! # async fn example() -> Result<(), correlator_core::store::StoreError> {
//! let pool = connect("postgres://localhost/correlator", 10).await?;
//! migrate(&pool).await?;
//! let store = PostgresMessageGroupStore::new(pool);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod group_store;
mod lock;
mod metadata;

pub use group_store::PostgresMessageGroupStore;
pub use lock::PgAdvisoryLockRegistry;
pub use metadata::PostgresMetadataStore;

use correlator_core::store::StoreError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

/// Open a connection pool.
///
/// # Errors
///
/// Returns [`StoreError::Unavailable`] if the database cannot be reached.
pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(url)
        .await
        .map_err(db_error)?;
    tracing::info!(max_connections, "PostgreSQL pool created");
    Ok(pool)
}

/// Apply the bundled schema migrations.
///
/// # Errors
///
/// Returns [`StoreError::Unavailable`] if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Unavailable(format!("migration failed: {e}")))
}

/// Map a driver error onto the storage taxonomy.
pub(crate) fn db_error(error: sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::TypeNotFound { .. } => {
            StoreError::Serialization(error.to_string())
        }
        other => {
            metrics::counter!("correlator_postgres_errors_total").increment(1);
            StoreError::Unavailable(other.to_string())
        }
    }
}
