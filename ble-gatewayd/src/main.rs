mod config;
mod registry;
mod presence;
mod radio;
mod reporter;
mod scanner;
mod api;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use crate::config::Config;
use crate::presence::{PresenceTracker, ReportQueue, TrackerSettings};
use crate::radio::RadioSource;
use crate::registry::{RegistryDb, RegistryHandle};
use crate::reporter::StatusReporter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ble_gatewayd=info"))
        )
        .init();

    tracing::info!("Starting ble-gatewayd");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/ble-gateway/gatewayd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    // Open SQLite registry and start its thread
    let db = RegistryDb::open(&config.registry.db_path)?;
    tracing::info!("Opened registry at {:?}", config.registry.db_path);

    let registry = RegistryHandle::spawn(db);

    if !config.registry.seed.is_empty() {
        let added = registry
            .seed(config.registry.seed.clone())
            .await
            .context("Failed to seed registry")?;
        tracing::info!("Seeded {} new identifiers", added);
    }

    let counts = registry.counts().await.context("Failed to count identifiers")?;
    tracing::info!(
        "Registry holds {} active and {} inactive identifiers",
        counts.active,
        counts.inactive
    );

    // Status reporter and presence tracker
    let reporter = StatusReporter::from_config(&config.reporter)?;
    if !reporter.is_enabled() {
        tracing::warn!("No status endpoint configured, transitions will only be logged");
    }

    let (reports, report_handle) = ReportQueue::spawn(reporter);

    let tracker = Arc::new(PresenceTracker::new(
        TrackerSettings::from(&config.presence),
        registry.clone(),
        reports,
    ));

    let source = open_radio(&config).await?;

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Spawn scan loop
    let scan_cancel = cancel.clone();
    let scan_tracker = tracker.clone();
    let scan_interval = config.presence.scan_interval();
    let scan_handle = tokio::spawn(async move {
        if let Err(e) = scanner::run(scan_tracker, source, scan_interval, scan_cancel).await {
            tracing::error!("Scan loop error: {}", e);
        }
    });

    // Build API router
    let app_state = api::routes::AppState {
        registry: registry.clone(),
        digest_rx: tracker.subscribe_digest(),
        tracker,
        presence: Arc::new(config.presence.clone()),
    };
    let app = api::routes::router(app_state);

    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    // Run server with graceful shutdown
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    cancel.cancel();

    let _ = tokio::join!(scan_handle, server_handle);

    // Every tracker handle is gone now, so the queue closes once its backlog is sent
    let drain_timeout = Duration::from_secs(config.reporter.timeout_secs);
    if tokio::time::timeout(drain_timeout, report_handle).await.is_err() {
        tracing::warn!("Dropping status reports still queued after {:?}", drain_timeout);
    }

    // Shutdown registry thread
    if let Err(e) = registry.shutdown().await {
        tracing::error!("Failed to shutdown registry: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Recorded cycles win over the adapter when both are available
async fn open_radio(config: &Config) -> Result<RadioSource> {
    if let Some(path) = &config.radio.replay_path {
        let source = radio::replay::ReplaySource::load(path)?;
        return Ok(RadioSource::Replay(source));
    }

    #[cfg(feature = "bluetooth")]
    return Ok(RadioSource::Btle(radio::btle::BtleSource::new(&config.radio).await?));

    #[cfg(not(feature = "bluetooth"))]
    anyhow::bail!("No radio configured: set radio.replay_path or build with the bluetooth feature");
}
