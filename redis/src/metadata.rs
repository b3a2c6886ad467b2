//! Idempotency keys as plain Redis strings.

use crate::{DEFAULT_PREFIX, redis_error};
use correlator_core::store::{MetadataStore, StoreFuture};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::time::Duration;

/// Redis-backed [`MetadataStore`].
///
/// Keys can be given a time to live so the processed set does not grow
/// without bound; a redelivery after expiry is handled again.
#[derive(Clone)]
pub struct RedisMetadataStore {
    conn: ConnectionManager,
    prefix: String,
    ttl: Option<Duration>,
}

impl RedisMetadataStore {
    /// Store on `conn` with the default prefix and no expiry.
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            prefix: DEFAULT_PREFIX.to_string(),
            ttl: None,
        }
    }

    /// Use `prefix` for every key.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Expire recorded keys after `ttl`.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    fn key(&self, key: &str) -> String {
        format!("{}:processed:{key}", self.prefix)
    }
}

impl MetadataStore for RedisMetadataStore {
    fn contains(&self, key: &str) -> StoreFuture<'_, bool> {
        let key = self.key(key);
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let exists: bool = conn.exists(&key).await.map_err(|e| redis_error(&e))?;
            Ok(exists)
        })
    }

    fn put_if_absent(&self, key: &str, value: &str) -> StoreFuture<'_, bool> {
        let key = self.key(key);
        let value = value.to_string();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let mut cmd = redis::cmd("SET");
            cmd.arg(&key).arg(value).arg("NX");
            if let Some(ttl) = self.ttl {
                cmd.arg("PX").arg(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
            }
            let reply: Option<String> = cmd.query_async(&mut conn).await.map_err(|e| redis_error(&e))?;
            Ok(reply.is_some())
        })
    }

    fn remove(&self, key: &str) -> StoreFuture<'_, ()> {
        let key = self.key(key);
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let _: () = conn.del(&key).await.map_err(|e| redis_error(&e))?;
            Ok(())
        })
    }
}
