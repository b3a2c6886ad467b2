//! Prometheus metrics for the correlator.
//!
//! Counters and histograms are recorded with the `metrics` macros at the
//! call sites. [`MetricsServer`] installs the Prometheus recorder, registers
//! descriptions and serves the scrape endpoint.
//!
//! # Example
//!
//! ```rust,no_run
//! use correlator_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Messages that reached the aggregator.
pub const MESSAGES_RECEIVED: &str = "correlator_messages_received_total";
/// Groups whose release produced at least one command.
pub const GROUPS_RELEASED: &str = "correlator_groups_released_total";
/// Commands sent to the output channel.
pub const MESSAGES_DISPATCHED: &str = "correlator_messages_dispatched_total";
/// Messages dropped on purpose (filtered, duplicate, completed group).
pub const MESSAGES_DISCARDED: &str = "correlator_messages_discarded_total";
/// Buffered messages removed because they could not be converted.
pub const MESSAGES_QUARANTINED: &str = "correlator_messages_quarantined_total";
/// Failed store operations.
pub const STORE_ERRORS: &str = "correlator_store_errors_total";
/// Aggregator handling latency.
pub const HANDLE_DURATION: &str = "correlator_handle_duration_seconds";

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server bound to `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register descriptions, install the recorder and start the listener.
    ///
    /// Must run inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    /// An already installed recorder is tolerated so tests can start
    /// several servers.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let (recorder, exporter) = builder
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();

        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                tokio::spawn(async move {
                    if exporter.await.is_err() {
                        tracing::error!("Metrics exporter stopped");
                    }
                });
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics available at http://{}/metrics", self.addr);
                Ok(())
            }
            Err(_) => {
                tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                Ok(())
            }
        }
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(MESSAGES_RECEIVED, "Messages handled by the aggregator");
    describe_counter!(GROUPS_RELEASED, "Group releases that produced commands");
    describe_counter!(MESSAGES_DISPATCHED, "Commands sent to the output channel");
    describe_counter!(
        MESSAGES_DISCARDED,
        "Messages dropped as filtered, duplicate or late for a completed group"
    );
    describe_counter!(
        MESSAGES_QUARANTINED,
        "Buffered messages removed because their payload could not be converted"
    );
    describe_counter!(STORE_ERRORS, "Failed group store operations");
    describe_histogram!(HANDLE_DURATION, "Time taken to handle one message");
    describe_counter!("correlator_retry_attempts_total", "Retry attempts");
    describe_counter!("correlator_retry_successes_total", "Operations that succeeded after retrying");
    describe_counter!("correlator_retry_exhausted_total", "Operations that ran out of retries");
}

/// Aggregator metrics recorder.
pub struct AggregatorMetrics;

impl AggregatorMetrics {
    /// Record a handled message.
    pub fn record_handled(event_type: &'static str, duration: Duration) {
        counter!(MESSAGES_RECEIVED, "event_type" => event_type).increment(1);
        histogram!(HANDLE_DURATION).record(duration.as_secs_f64());
    }

    /// Record a release and the commands it dispatched.
    pub fn record_release(dispatched: usize) {
        counter!(GROUPS_RELEASED).increment(1);
        counter!(MESSAGES_DISPATCHED).increment(dispatched as u64);
    }

    /// Record a message dropped for `reason`.
    pub fn record_discard(reason: &'static str) {
        counter!(MESSAGES_DISCARDED, "reason" => reason).increment(1);
    }

    /// Record a quarantined buffered message.
    pub fn record_quarantine() {
        counter!(MESSAGES_QUARANTINED).increment(1);
    }

    /// Record a failed store operation.
    pub fn record_store_error() {
        counter!(STORE_ERRORS).increment(1);
    }
}
