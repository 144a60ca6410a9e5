//! Exchange Relay Binary
//!
//! Starts the fetch loop, the stream server, and the health server.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin exchange-relay
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `RELAY_SNAPSHOT_URL`: Base URL of the snapshot relay
//! - `RELAY_DIRECTORY_URL`: Instrument listing URL
//!
//! ## Optional
//! - `RELAY_DAILY_DETAIL_URL`, `RELAY_STATIC_DETAIL_URL`: Directory detail feeds
//! - `RELAY_FLOWS`: Market flows (default: 1,2,4,7)
//! - `RELAY_POLL_INTERVAL_SECS`: Poll interval (default: 60)
//! - `RELAY_EMPTY_RETRY_SECS`: First retry after an empty cycle (default: 5)
//! - `RELAY_HTTP_TIMEOUT_SECS`: Upstream request timeout (default: 30)
//! - `RELAY_METADATA_CUTOVER`: Daily directory refresh time (default: 08:00)
//! - `RELAY_UTC_OFFSET_MINUTES`: Exchange timezone (default: 210)
//! - `RELAY_STOCK_PUSH_INTERVAL_MS`, `RELAY_SUMMARY_PUSH_INTERVAL_MS`,
//!   `RELAY_EMPTY_CACHE_WAIT_MS`, `RELAY_SUMMARY_BATCH_SIZE`,
//!   `RELAY_BATCH_PAUSE_MS`, `RELAY_OUTBOUND_CAPACITY`: Push loop tuning
//! - `RELAY_STREAM_PORT`: WebSocket and query port (default: 8000)
//! - `RELAY_HEALTH_PORT`: Health check HTTP port (default: 8082)
//! - `OTEL_ENABLED`: Enable OpenTelemetry export (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: exchange-relay)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use exchange_relay::application::services::{Fetcher, MarketCache, MetadataResolver, QueryService};
use exchange_relay::infrastructure::broadcast::BroadcastHub;
use exchange_relay::infrastructure::health::{HealthServer, HealthServerState};
use exchange_relay::infrastructure::source::{self, HttpDirectorySource, RelaySnapshotSource};
use exchange_relay::infrastructure::stream::{StreamServer, StreamState};
use exchange_relay::infrastructure::telemetry;
use exchange_relay::{RelayConfig, init_metrics};
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Health reports degraded after this many missed poll intervals.
const STALE_POLL_INTERVALS: u32 = 3;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    // Initialize telemetry (tracing + optional OpenTelemetry)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Exchange Relay");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = RelayConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Upstream adapters share one HTTP client
    let http_client = source::build_client(config.source.http_timeout)?;
    let snapshot_source = Arc::new(RelaySnapshotSource::with_client(
        http_client.clone(),
        config.source.snapshot_url.clone(),
    ));
    let directory_source = Arc::new(
        HttpDirectorySource::with_client(http_client, config.source.directory_url.clone())
            .with_daily_details(config.source.daily_detail_url.clone())
            .with_static_details(config.source.static_detail_url.clone()),
    );

    // Core services
    let cache = Arc::new(MarketCache::new());
    let resolver = Arc::new(MetadataResolver::new(
        directory_source,
        config.metadata.schedule()?,
    ));
    let fetcher = Arc::new(Fetcher::new(
        snapshot_source,
        Arc::clone(&resolver),
        Arc::clone(&cache),
        config.fetch.fetcher_config(),
    ));
    let query = QueryService::new(Arc::clone(&cache), Arc::clone(&resolver));
    let broadcast_hub = Arc::new(BroadcastHub::new(Arc::clone(&cache), config.push.clone()));

    // Spawn fetch loop
    let fetch_shutdown = shutdown_token.clone();
    let fetch_task = tokio::spawn(async move {
        fetcher.run(fetch_shutdown).await;
    });

    // Spawn health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        config.fetch.poll_interval * STALE_POLL_INTERVALS,
        Arc::clone(&cache),
        Arc::clone(&resolver),
        Arc::clone(&broadcast_hub),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    let health_task = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    // Spawn stream server
    let stream_state = Arc::new(StreamState::new(
        broadcast_hub,
        query,
        shutdown_token.clone(),
    ));
    let stream_server = StreamServer::new(
        config.server.stream_port,
        stream_state,
        shutdown_token.clone(),
    );
    let stream_task = tokio::spawn(async move {
        if let Err(e) = stream_server.run().await {
            tracing::error!(error = %e, "Stream server error");
        }
    });

    tracing::info!("Exchange relay ready");

    await_shutdown(shutdown_token).await;
    drain([fetch_task, health_task, stream_task]).await;

    tracing::info!("Exchange relay stopped");
    Ok(())
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_err() {
        load_dotenv_from_ancestors();
    }
}

/// Log the parsed configuration.
fn log_config(config: &RelayConfig) {
    tracing::info!(
        flows = ?config.fetch.flows,
        poll_interval_secs = config.fetch.poll_interval.as_secs(),
        stream_port = config.server.stream_port,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        snapshot_url = %config.source.snapshot_url,
        directory_url = %config.source.directory_url,
        daily_detail_url = ?config.source.daily_detail_url,
        static_detail_url = ?config.source.static_detail_url,
        "Upstream endpoints"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv_from_ancestors() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}

/// Wait for background tasks, bounded by the shutdown timeout.
async fn drain<const N: usize>(tasks: [JoinHandle<()>; N]) {
    let all = futures::future::join_all(tasks);
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, all).await.is_err() {
        tracing::warn!("Shutdown timed out, abandoning remaining tasks");
    }
}
