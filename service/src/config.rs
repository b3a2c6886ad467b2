//! Service configuration loaded from environment variables.
//!
//! | variable | default |
//! |---|---|
//! | `CORRELATOR_STORE` | `memory` (`memory`, `postgres` or `redis`) |
//! | `DATABASE_URL` | required for `postgres` |
//! | `REDIS_URL` | required for `redis` |
//! | `CORRELATOR_BROKERS` | `localhost:9092` |
//! | `CORRELATOR_INPUT_TOPICS` | `message-events` |
//! | `CORRELATOR_CONSUMER_GROUP` | `correlator` |
//! | `CORRELATOR_DESTINATIONS` | required, `name=topic,...` |
//! | `CORRELATOR_STORE_TIMEOUT_MS` | `5000` |
//! | `CORRELATOR_COMPLETE_GROUPS_WHEN_EMPTY` | `true` |
//! | `CORRELATOR_EXPIRE_GROUPS_UPON_COMPLETION` | `true` |
//! | `CORRELATOR_MAX_RETRIES` | `3` |
//! | `CORRELATOR_CONCURRENCY` | `16` |
//! | `CORRELATOR_POSTGRES_MAX_CONNECTIONS` | `10` |
//! | `CORRELATOR_METRICS_ADDR` | `0.0.0.0:9090` |

use correlator_runtime::config::AggregatorConfig;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Invalid or missing configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is not set
    #[error("Missing required configuration: {0}")]
    Missing(&'static str),

    /// A variable could not be parsed
    #[error("Invalid value {value:?} for {variable}: {reason}")]
    Invalid {
        /// Variable name
        variable: &'static str,
        /// Raw value
        value: String,
        /// What was wrong with it
        reason: String,
    },
}

/// Group store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// Process memory, single instance only
    Memory,
    /// `PostgreSQL` tables with advisory locks
    Postgres,
    /// Redis hashes with lease locks
    Redis,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "redis" => Ok(Self::Redis),
            other => Err(format!("unknown store backend '{other}'")),
        }
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Memory => "memory",
            Self::Postgres => "postgres",
            Self::Redis => "redis",
        })
    }
}

/// An output destination and the topic its commands are published to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Value of the `messageEventOutputDestination` header
    pub name: String,
    /// Topic receiving the commands
    pub topic: String,
}

/// Complete service configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelatorConfig {
    /// Group store backend
    pub store: StoreBackend,
    /// `PostgreSQL` URL, set when `store` is [`StoreBackend::Postgres`]
    pub database_url: Option<String>,
    /// Redis URL, set when `store` is [`StoreBackend::Redis`]
    pub redis_url: Option<String>,
    /// Kafka-compatible broker list
    pub brokers: String,
    /// Topics carrying lifecycle events
    pub input_topics: Vec<String>,
    /// Consumer group of the inbound subscription
    pub consumer_group: String,
    /// Output destinations
    pub destinations: Vec<Destination>,
    /// Bound on each group store call
    pub store_timeout: Duration,
    /// Group lifecycle settings
    pub aggregator: AggregatorConfig,
    /// Retries for retryable faults before a delivery is requeued
    pub max_retries: usize,
    /// Deliveries handled at once, and so the number of group locks held
    pub concurrency: usize,
    /// `PostgreSQL` connections for store and metadata calls. Group locks
    /// draw from a separate pool of `concurrency` connections.
    pub postgres_max_connections: u32,
    /// Prometheus scrape address
    pub metrics_addr: SocketAddr,
}

impl CorrelatorConfig {
    /// Load from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a required variable is missing or a value
    /// does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a required variable is missing or a value
    /// does not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let store = parse_or(&var, "CORRELATOR_STORE", StoreBackend::Memory)?;
        let database_url = var("DATABASE_URL");
        let redis_url = var("REDIS_URL");
        match store {
            StoreBackend::Postgres if database_url.is_none() => {
                return Err(ConfigError::Missing("DATABASE_URL"));
            }
            StoreBackend::Redis if redis_url.is_none() => {
                return Err(ConfigError::Missing("REDIS_URL"));
            }
            _ => {}
        }

        let input_topics = split_list(
            &var("CORRELATOR_INPUT_TOPICS").unwrap_or_else(|| "message-events".to_string()),
        );
        if input_topics.is_empty() {
            return Err(ConfigError::Missing("CORRELATOR_INPUT_TOPICS"));
        }

        let destinations = parse_destinations(
            &var("CORRELATOR_DESTINATIONS").ok_or(ConfigError::Missing("CORRELATOR_DESTINATIONS"))?,
        )?;

        let store_timeout_ms: u64 = parse_or(&var, "CORRELATOR_STORE_TIMEOUT_MS", 5000)?;
        if store_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                variable: "CORRELATOR_STORE_TIMEOUT_MS",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        let concurrency: usize = parse_or(&var, "CORRELATOR_CONCURRENCY", 16)?;
        if concurrency == 0 {
            return Err(ConfigError::Invalid {
                variable: "CORRELATOR_CONCURRENCY",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        let postgres_max_connections: u32 = parse_or(&var, "CORRELATOR_POSTGRES_MAX_CONNECTIONS", 10)?;
        if postgres_max_connections == 0 {
            return Err(ConfigError::Invalid {
                variable: "CORRELATOR_POSTGRES_MAX_CONNECTIONS",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        let aggregator = AggregatorConfig::new()
            .with_complete_groups_when_empty(parse_bool_or(
                &var,
                "CORRELATOR_COMPLETE_GROUPS_WHEN_EMPTY",
                true,
            )?)
            .with_expire_groups_upon_completion(parse_bool_or(
                &var,
                "CORRELATOR_EXPIRE_GROUPS_UPON_COMPLETION",
                true,
            )?);

        Ok(Self {
            store,
            database_url,
            redis_url,
            brokers: var("CORRELATOR_BROKERS").unwrap_or_else(|| "localhost:9092".to_string()),
            input_topics,
            consumer_group: var("CORRELATOR_CONSUMER_GROUP").unwrap_or_else(|| "correlator".to_string()),
            destinations,
            store_timeout: Duration::from_millis(store_timeout_ms),
            aggregator,
            max_retries: parse_or(&var, "CORRELATOR_MAX_RETRIES", 3)?,
            concurrency,
            postgres_max_connections,
            metrics_addr: parse_or(
                &var,
                "CORRELATOR_METRICS_ADDR",
                SocketAddr::from(([0, 0, 0, 0], 9090)),
            )?,
        })
    }

    /// Input topics as string slices, ready for subscribing.
    #[must_use]
    pub fn input_topic_refs(&self) -> Vec<&str> {
        self.input_topics.iter().map(String::as_str).collect()
    }
}

fn parse_or<T>(
    var: &impl Fn(&str) -> Option<String>,
    variable: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    var(variable).map_or(Ok(default), |value| {
        value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            variable,
            reason: e.to_string(),
            value,
        })
    })
}

fn parse_bool_or(
    var: &impl Fn(&str) -> Option<String>,
    variable: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    let Some(value) = var(variable) else {
        return Ok(default);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            variable,
            value,
            reason: "expected a boolean".to_string(),
        }),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_destinations(raw: &str) -> Result<Vec<Destination>, ConfigError> {
    let destinations = split_list(raw)
        .into_iter()
        .map(|entry| match entry.split_once('=') {
            Some((name, topic)) if !name.trim().is_empty() && !topic.trim().is_empty() => {
                Ok(Destination {
                    name: name.trim().to_string(),
                    topic: topic.trim().to_string(),
                })
            }
            _ => Err(ConfigError::Invalid {
                variable: "CORRELATOR_DESTINATIONS",
                value: entry.clone(),
                reason: "expected name=topic".to_string(),
            }),
        })
        .collect::<Result<Vec<_>, _>>()?;

    if destinations.is_empty() {
        return Err(ConfigError::Missing("CORRELATOR_DESTINATIONS"));
    }
    Ok(destinations)
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<CorrelatorConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        CorrelatorConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_with_only_destinations() {
        let config = load(&[("CORRELATOR_DESTINATIONS", "rb=rb-commands")]).expect("valid");

        assert_eq!(config.store, StoreBackend::Memory);
        assert_eq!(config.brokers, "localhost:9092");
        assert_eq!(config.input_topic_refs(), vec!["message-events"]);
        assert_eq!(config.consumer_group, "correlator");
        assert_eq!(config.store_timeout, Duration::from_secs(5));
        assert_eq!(config.aggregator, AggregatorConfig::default());
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.concurrency, 16);
        assert_eq!(config.postgres_max_connections, 10);
        assert_eq!(config.metrics_addr.port(), 9090);
        assert_eq!(
            config.destinations,
            vec![Destination {
                name: "rb".to_string(),
                topic: "rb-commands".to_string()
            }]
        );
    }

    #[test]
    fn destinations_are_required() {
        assert_eq!(load(&[]), Err(ConfigError::Missing("CORRELATOR_DESTINATIONS")));
        assert_eq!(
            load(&[("CORRELATOR_DESTINATIONS", " , ")]),
            Err(ConfigError::Missing("CORRELATOR_DESTINATIONS"))
        );
    }

    #[test]
    fn malformed_destination_is_rejected() {
        let result = load(&[("CORRELATOR_DESTINATIONS", "rb=rb-commands,orphan")]);

        assert!(matches!(
            result,
            Err(ConfigError::Invalid { variable: "CORRELATOR_DESTINATIONS", ref value, .. }) if value == "orphan"
        ));
    }

    #[test]
    fn postgres_backend_needs_database_url() {
        let base = [("CORRELATOR_DESTINATIONS", "rb=t"), ("CORRELATOR_STORE", "postgres")];
        assert_eq!(load(&base), Err(ConfigError::Missing("DATABASE_URL")));

        let config = load(&[base[0], base[1], ("DATABASE_URL", "postgres://localhost/c")]).expect("valid");
        assert_eq!(config.store, StoreBackend::Postgres);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/c"));
    }

    #[test]
    fn redis_backend_needs_redis_url() {
        let result = load(&[("CORRELATOR_DESTINATIONS", "rb=t"), ("CORRELATOR_STORE", "Redis")]);
        assert_eq!(result, Err(ConfigError::Missing("REDIS_URL")));
    }

    #[test]
    fn unknown_backend_is_invalid() {
        let result = load(&[("CORRELATOR_DESTINATIONS", "rb=t"), ("CORRELATOR_STORE", "hazelcast")]);
        assert!(matches!(
            result,
            Err(ConfigError::Invalid { variable: "CORRELATOR_STORE", .. })
        ));
    }

    #[test]
    fn overrides_are_applied() {
        let config = load(&[
            ("CORRELATOR_DESTINATIONS", "rb=rb-commands, other = other-commands"),
            ("CORRELATOR_INPUT_TOPICS", "events-a,events-b"),
            ("CORRELATOR_STORE_TIMEOUT_MS", "250"),
            ("CORRELATOR_COMPLETE_GROUPS_WHEN_EMPTY", "false"),
            ("CORRELATOR_EXPIRE_GROUPS_UPON_COMPLETION", "0"),
            ("CORRELATOR_MAX_RETRIES", "7"),
            ("CORRELATOR_CONCURRENCY", "32"),
            ("CORRELATOR_POSTGRES_MAX_CONNECTIONS", "4"),
            ("CORRELATOR_METRICS_ADDR", "127.0.0.1:9100"),
        ])
        .expect("valid");

        assert_eq!(config.destinations.len(), 2);
        assert_eq!(config.destinations[1].name, "other");
        assert_eq!(config.input_topic_refs(), vec!["events-a", "events-b"]);
        assert_eq!(config.store_timeout, Duration::from_millis(250));
        assert!(!config.aggregator.complete_groups_when_empty);
        assert!(!config.aggregator.expire_groups_upon_completion);
        assert_eq!(config.max_retries, 7);
        assert_eq!(config.concurrency, 32);
        assert_eq!(config.postgres_max_connections, 4);
        assert_eq!(config.metrics_addr.to_string(), "127.0.0.1:9100");
    }

    #[test]
    fn bad_numbers_and_booleans_are_invalid() {
        let base = ("CORRELATOR_DESTINATIONS", "rb=t");

        assert!(matches!(
            load(&[base, ("CORRELATOR_MAX_RETRIES", "many")]),
            Err(ConfigError::Invalid { variable: "CORRELATOR_MAX_RETRIES", .. })
        ));
        assert!(matches!(
            load(&[base, ("CORRELATOR_STORE_TIMEOUT_MS", "0")]),
            Err(ConfigError::Invalid { variable: "CORRELATOR_STORE_TIMEOUT_MS", .. })
        ));
        assert!(matches!(
            load(&[base, ("CORRELATOR_CONCURRENCY", "0")]),
            Err(ConfigError::Invalid { variable: "CORRELATOR_CONCURRENCY", .. })
        ));
        assert!(matches!(
            load(&[base, ("CORRELATOR_COMPLETE_GROUPS_WHEN_EMPTY", "maybe")]),
            Err(ConfigError::Invalid { variable: "CORRELATOR_COMPLETE_GROUPS_WHEN_EMPTY", .. })
        ));
    }
}
