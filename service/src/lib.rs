//! # Correlator Service
//!
//! Assembles the correlator from configuration: picks the group store
//! backend, builds one topic channel per output destination and feeds the
//! inbound subscription through the [`MessageConnector`].

pub mod config;

use config::{CorrelatorConfig, StoreBackend};
use correlator_core::channel::MessageChannel;
use correlator_core::store::{LockRegistry, MessageGroupStore, MetadataStore, StoreError};
use correlator_redpanda::RedpandaMessageBus;
use correlator_runtime::aggregator::{BuildError, CorrelatingAggregator};
use correlator_runtime::idempotent::IdempotentReceiver;
use correlator_runtime::memory::{InMemoryLockRegistry, InMemoryMessageGroupStore, InMemoryMetadataStore};
use correlator_runtime::retry::RetryPolicy;
use correlator_runtime::router::{DestinationRouter, StaticChannelResolver};
use correlator_runtime::timeout::TimedMessageGroupStore;
use correlator_runtime::MessageConnector;
use std::sync::Arc;

/// The storage side of the correlator.
#[derive(Clone)]
pub struct Backend {
    /// Group store, bounded by the configured store timeout
    pub store: Arc<dyn MessageGroupStore>,
    /// Per-key lock registry
    pub locks: Arc<dyn LockRegistry>,
    /// Idempotency keys of handled events
    pub metadata: Arc<dyn MetadataStore>,
}

impl Backend {
    /// In-memory backend for a single instance.
    #[must_use]
    pub fn memory(config: &CorrelatorConfig) -> Self {
        Self::bounded(
            config,
            Arc::new(InMemoryMessageGroupStore::new()),
            Arc::new(InMemoryLockRegistry::new()),
            Arc::new(InMemoryMetadataStore::new()),
        )
    }

    /// Connect to the backend named by `config.store`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend cannot be reached or, for
    /// `PostgreSQL`, migrated.
    pub async fn connect(config: &CorrelatorConfig) -> Result<Self, StoreError> {
        match config.store {
            StoreBackend::Memory => Ok(Self::memory(config)),
            StoreBackend::Postgres => {
                let url = config
                    .database_url
                    .as_deref()
                    .ok_or_else(|| StoreError::Unavailable("DATABASE_URL is not set".to_string()))?;
                let pool = correlator_postgres::connect(url, config.postgres_max_connections).await?;
                correlator_postgres::migrate(&pool).await?;
                // Each held group lock pins a session, so locks get their own
                // pool with room for every delivery in flight.
                let lock_pool = correlator_postgres::connect(url, lock_pool_size(config)).await?;
                Ok(Self::bounded(
                    config,
                    Arc::new(correlator_postgres::PostgresMessageGroupStore::new(pool.clone())),
                    Arc::new(correlator_postgres::PgAdvisoryLockRegistry::new(lock_pool)),
                    Arc::new(correlator_postgres::PostgresMetadataStore::new(pool)),
                ))
            }
            StoreBackend::Redis => {
                let url = config
                    .redis_url
                    .as_deref()
                    .ok_or_else(|| StoreError::Unavailable("REDIS_URL is not set".to_string()))?;
                let conn = correlator_redis::connect(url).await?;
                Ok(Self::bounded(
                    config,
                    Arc::new(correlator_redis::RedisMessageGroupStore::new(conn.clone())),
                    Arc::new(correlator_redis::RedisLockRegistry::new(conn.clone())),
                    Arc::new(correlator_redis::RedisMetadataStore::new(conn)),
                ))
            }
        }
    }

    fn bounded(
        config: &CorrelatorConfig,
        store: Arc<dyn MessageGroupStore>,
        locks: Arc<dyn LockRegistry>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            store: Arc::new(TimedMessageGroupStore::new(store, config.store_timeout)),
            locks,
            metadata,
        }
    }
}

/// Connections needed so every concurrent delivery can hold its group lock.
#[must_use]
pub fn lock_pool_size(config: &CorrelatorConfig) -> u32 {
    u32::try_from(config.concurrency).unwrap_or(u32::MAX)
}

/// Router over one topic channel per configured destination.
#[must_use]
pub fn destination_router(config: &CorrelatorConfig, bus: &RedpandaMessageBus) -> DestinationRouter {
    let resolver = config
        .destinations
        .iter()
        .fold(StaticChannelResolver::new(), |resolver, destination| {
            tracing::info!(
                destination = %destination.name,
                topic = %destination.topic,
                "Registered output destination"
            );
            resolver.channel(
                destination.name.clone(),
                Arc::new(bus.channel(destination.name.clone(), destination.topic.clone())),
            )
        });
    DestinationRouter::new(Arc::new(resolver))
}

/// Aggregator and connector over `backend`, sending commands to `output`.
///
/// # Errors
///
/// Returns [`BuildError`] if the aggregator cannot be assembled.
pub fn build_connector(
    config: &CorrelatorConfig,
    backend: Backend,
    output: Arc<dyn MessageChannel>,
) -> Result<MessageConnector, BuildError> {
    let aggregator = CorrelatingAggregator::builder()
        .store(backend.store)
        .lock_registry(backend.locks)
        .output(output)
        .idempotent_receiver(IdempotentReceiver::new(backend.metadata))
        .config(config.aggregator)
        .build()?;

    Ok(MessageConnector::new(Arc::new(aggregator))
        .with_retry_policy(
            RetryPolicy::builder()
                .max_retries(config.max_retries)
                .jitter(true)
                .build(),
        )
        .with_concurrency(config.concurrency))
}
