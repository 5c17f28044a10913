//! Static Cache Server
//!
//! Loads configuration, sets up logging and metrics, and serves files until
//! interrupted.

use anyhow::Context;
use static_cache_server::{
    ContentCache, EventRecorder, FanoutRecorder, LogRecorder, MetricsEndpoint, Server,
    ServerConfig, ServerMetrics,
};
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

/// Main entry point
///
/// # Usage
/// ```bash
/// # Start with default configuration
/// static-cache-server
///
/// # Start with a configuration file
/// static-cache-server /path/to/config.yaml
/// ```
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting Static Cache Server");

    let config = match env::args().nth(1) {
        Some(path) => {
            info!("Loading configuration from: {}", path);
            ServerConfig::from_file(&path)
                .with_context(|| format!("failed to load configuration from {}", path))?
        }
        None => {
            info!("No configuration file given, using defaults");
            ServerConfig::default()
        }
    };

    info!("Configuration loaded successfully");
    info!("  - Listen address: {}", config.listen_address);
    info!("  - Document root: {}", config.document_root.display());
    info!("  - Cache enabled: {}", config.cache.enabled);
    info!("  - Cache TTL: {} seconds", config.cache.ttl);
    info!("  - Cache max entries: {}", config.cache.max_entries);
    info!("  - Chunk size: {} KB", config.chunk_size / 1024);
    info!("  - Keep-alive timeout: {} seconds", config.keep_alive_timeout);

    let metrics = Arc::new(ServerMetrics::new().context("failed to register metrics")?);
    let recorder: Arc<dyn EventRecorder> = Arc::new(
        FanoutRecorder::new()
            .with(Arc::new(LogRecorder))
            .with(Arc::clone(&metrics) as Arc<dyn EventRecorder>),
    );

    let cache = Arc::new(ContentCache::from_config(&config.cache));

    if let Some(endpoint_config) = config.metrics_endpoint.clone().filter(|c| c.enabled) {
        let addr = endpoint_config
            .address
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid metrics address {}", endpoint_config.address))?;
        let endpoint = MetricsEndpoint::new(Arc::clone(&metrics), Arc::clone(&cache), addr);
        tokio::spawn(async move {
            if let Err(e) = endpoint.start().await {
                error!("Metrics endpoint failed: {}", e);
            }
        });
    }

    let server = Server::bind_with_cache(config, cache, recorder)
        .await
        .context("failed to start server")?;

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    Ok(())
}
