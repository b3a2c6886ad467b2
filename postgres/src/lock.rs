//! Per-key locks built on session advisory locks.

use crate::db_error;
use correlator_core::correlation::CorrelationKey;
use correlator_core::store::{GroupLock, LockRegistry, StoreError, StoreFuture};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};

/// [`LockRegistry`] holding one pooled connection per lock.
///
/// The key is hashed with `hashtextextended` into the 64-bit advisory lock
/// space. The lock is released when the [`GroupLock`] is dropped; if the
/// unlock cannot be issued the connection is closed, which releases every
/// lock the session held.
#[derive(Clone, Debug)]
pub struct PgAdvisoryLockRegistry {
    pool: PgPool,
}

impl PgAdvisoryLockRegistry {
    /// Registry drawing lock connections from `pool`.
    ///
    /// Each held lock pins one connection, so size the pool for the
    /// expected number of keys in flight.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

struct AdvisoryGuard {
    key: CorrelationKey,
    conn: Option<PoolConnection<Postgres>>,
}

impl Drop for AdvisoryGuard {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        let key = self.key.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let unlocked = sqlx::query("SELECT pg_advisory_unlock(hashtextextended($1, 0))")
                        .bind(key.as_str())
                        .execute(&mut *conn)
                        .await;
                    if let Err(e) = unlocked {
                        tracing::warn!(correlation_key = %key, error = %e, "Advisory unlock failed, closing session");
                        let _ = conn.close().await;
                    }
                });
            }
            Err(_) => {
                // No runtime to unlock on; dropping the detached session releases the lock.
                drop(conn.detach());
            }
        }
    }
}

impl LockRegistry for PgAdvisoryLockRegistry {
    fn obtain(&self, key: &CorrelationKey) -> StoreFuture<'_, GroupLock> {
        let key = key.clone();
        Box::pin(async move {
            let mut conn = self.pool.acquire().await.map_err(|e| StoreError::Lock {
                key: key.clone(),
                reason: db_error(e).to_string(),
            })?;

            sqlx::query("SELECT pg_advisory_lock(hashtextextended($1, 0))")
                .bind(key.as_str())
                .execute(&mut *conn)
                .await
                .map_err(|e| StoreError::Lock {
                    key: key.clone(),
                    reason: e.to_string(),
                })?;

            tracing::trace!(correlation_key = %key, "Advisory lock obtained");
            let guard = AdvisoryGuard {
                key: key.clone(),
                conn: Some(conn),
            };
            Ok(GroupLock::new(key, guard))
        })
    }
}
