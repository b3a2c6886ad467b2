//! Idempotency keys in `correlator_metadata`.

use crate::db_error;
use correlator_core::store::{MetadataStore, StoreFuture};
use sqlx::PgPool;

/// `PostgreSQL`-backed [`MetadataStore`].
#[derive(Clone, Debug)]
pub struct PostgresMetadataStore {
    pool: PgPool,
}

impl PostgresMetadataStore {
    /// Store using `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl MetadataStore for PostgresMetadataStore {
    fn contains(&self, key: &str) -> StoreFuture<'_, bool> {
        let key = key.to_string();
        Box::pin(async move {
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM correlator_metadata WHERE key = $1)")
                .bind(key)
                .fetch_one(&self.pool)
                .await
                .map_err(db_error)
        })
    }

    fn put_if_absent(&self, key: &str, value: &str) -> StoreFuture<'_, bool> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            let result = sqlx::query(
                "INSERT INTO correlator_metadata (key, value) VALUES ($1, $2) ON CONFLICT (key) DO NOTHING",
            )
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
            Ok(result.rows_affected() == 1)
        })
    }

    fn remove(&self, key: &str) -> StoreFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            sqlx::query("DELETE FROM correlator_metadata WHERE key = $1")
                .bind(key)
                .execute(&self.pool)
                .await
                .map_err(db_error)?;
            Ok(())
        })
    }
}
