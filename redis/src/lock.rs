//! Per-key leases held as Redis strings.

use crate::DEFAULT_PREFIX;
use correlator_core::correlation::CorrelationKey;
use correlator_core::store::{GroupLock, LockRegistry, StoreError, StoreFuture};
use redis::aio::ConnectionManager;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

const RELEASE_SCRIPT: &str = r"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    end
    return 0
";

/// [`LockRegistry`] using `SET NX PX` leases.
///
/// A holder owns the lock until it drops the [`GroupLock`] or the lease
/// expires. The lease must exceed the longest critical section; a lock
/// whose lease ran out can be taken by another instance. Release deletes
/// the key only if it still holds this holder's token.
#[derive(Clone)]
pub struct RedisLockRegistry {
    conn: ConnectionManager,
    prefix: String,
    lease: Duration,
    wait: Duration,
    poll: Duration,
}

impl RedisLockRegistry {
    /// Registry on `conn` with a 30s lease, waiting up to 10s for a lock.
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            prefix: DEFAULT_PREFIX.to_string(),
            lease: Duration::from_secs(30),
            wait: Duration::from_secs(10),
            poll: Duration::from_millis(10),
        }
    }

    /// Use `prefix` for every key.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Lease length of an obtained lock.
    #[must_use]
    pub const fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Longest time [`obtain`](LockRegistry::obtain) waits before failing.
    #[must_use]
    pub const fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    fn lock_key(&self, key: &CorrelationKey) -> String {
        format!("{}:lock:{key}", self.prefix)
    }

    async fn try_acquire(&self, lock_key: &str, token: &str) -> Result<bool, redis::RedisError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(lock_key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(u64::try_from(self.lease.as_millis()).unwrap_or(u64::MAX))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }
}

struct LeaseGuard {
    conn: ConnectionManager,
    lock_key: String,
    token: String,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(lock_key = %self.lock_key, "No runtime to release lock; it expires with its lease");
            return;
        };
        let mut conn = self.conn.clone();
        let lock_key = std::mem::take(&mut self.lock_key);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            let released: Result<i64, _> = redis::Script::new(RELEASE_SCRIPT)
                .key(&lock_key)
                .arg(&token)
                .invoke_async(&mut conn)
                .await;
            match released {
                Ok(0) => tracing::warn!(%lock_key, "Lock lease expired before release"),
                Ok(_) => {}
                Err(e) => tracing::warn!(%lock_key, error = %e, "Failed to release lock"),
            }
        });
    }
}

impl LockRegistry for RedisLockRegistry {
    fn obtain(&self, key: &CorrelationKey) -> StoreFuture<'_, GroupLock> {
        let key = key.clone();
        Box::pin(async move {
            let lock_key = self.lock_key(&key);
            let token = Uuid::new_v4().to_string();
            let deadline = Instant::now() + self.wait;

            loop {
                match self.try_acquire(&lock_key, &token).await {
                    Ok(true) => break,
                    Ok(false) if Instant::now() < deadline => tokio::time::sleep(self.poll).await,
                    Ok(false) => {
                        return Err(StoreError::Lock {
                            key,
                            reason: format!("not released within {}ms", self.wait.as_millis()),
                        });
                    }
                    Err(e) => {
                        return Err(StoreError::Lock {
                            key,
                            reason: e.to_string(),
                        });
                    }
                }
            }

            tracing::trace!(correlation_key = %key, "Lock obtained");
            let guard = LeaseGuard {
                conn: self.conn.clone(),
                lock_key,
                token,
            };
            Ok(GroupLock::new(key, guard))
        })
    }
}
