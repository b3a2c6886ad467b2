//! Message correlator.
//!
//! Consumes process lifecycle events, correlates sent messages with the
//! start events and subscriptions waiting for them, and publishes the
//! resulting commands to their destinations.

use anyhow::Context;
use correlator_redpanda::RedpandaMessageBus;
use correlator_runtime::metrics::MetricsServer;
use correlator_service::config::CorrelatorConfig;
use correlator_service::{build_connector, destination_router, Backend};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = CorrelatorConfig::from_env().context("Invalid configuration")?;
    info!(
        store = %config.store,
        brokers = %config.brokers,
        input_topics = ?config.input_topics,
        destinations = config.destinations.len(),
        "Configuration loaded"
    );

    let mut metrics = MetricsServer::new(config.metrics_addr);
    metrics.start().context("Failed to start metrics exporter")?;

    let backend = Backend::connect(&config)
        .await
        .with_context(|| format!("Failed to connect to the {} backend", config.store))?;
    info!(store = %config.store, "Group store ready");

    let bus = RedpandaMessageBus::builder()
        .brokers(config.brokers.clone())
        .consumer_group(config.consumer_group.clone())
        .build()
        .context("Failed to create message bus")?;

    let router = Arc::new(destination_router(&config, &bus));
    let connector = build_connector(&config, backend, router)?;

    let topics = config.input_topic_refs();
    connector
        .run_until(&bus, &topics, shutdown_signal())
        .await
        .context("Inbound subscription failed")?;

    connector.aggregator().stop();
    info!("Correlator stopped");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
