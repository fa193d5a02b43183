//! stompd - STOMP message broker
//!
//! Accepts STOMP 1.2 clients over TCP and routes messages between queue and
//! topic destinations.

use std::sync::Arc;
use stompd_server::{Broker, Config, Metrics, Server, ServerConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if STOMPD_CONFIG is set, then env overrides)
    let config_path = std::env::var("STOMPD_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(ref path) = config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            // Otherwise fall back to defaults
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    tracing::info!("Starting stompd {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Max connections: {}", config.network.max_connections);
    tracing::info!(
        "  Heart-beat: expect >= {}ms, send >= {}ms, timeout x{}",
        config.heartbeat.min_expect_ms,
        config.heartbeat.min_send_ms,
        config.heartbeat.timeout_factor
    );
    tracing::info!(
        "  Byte limits: queue={} topic={}",
        config.broker.queue_byte_limit,
        config.broker.topic_byte_limit
    );

    let mut server_config = ServerConfig::from_config(&config);
    if config.metrics.enabled {
        server_config = server_config.with_metrics(Arc::new(Metrics::new()?));
        tracing::info!("  Metrics: enabled");
    } else {
        tracing::info!("  Metrics: disabled");
    }

    let server = Arc::new(Server::new(server_config, Broker::new(&config)));

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    tracing::info!("Server stopped");
    Ok(())
}
