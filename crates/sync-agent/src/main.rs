//! Health Sync Agent - keeps device health data flowing to the collection service
//!
//! Runs periodic syncs from the exported data directory, drains the offline
//! queue on a timer and optionally streams accelerometer chunks.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use sync_agent::{api, config::AgentConfig};
use sync_core::{
    health::{Component, HealthRegistry},
    models::RecordType,
    observability::{StructuredLogger, SyncMetrics},
    sensor::select_source,
    session::{FileSessionStore, RefreshCoordinator, SessionStore},
    source::FileDataSource,
    sync::{
        build_http_client, parse_base_url, AuthClient, HttpTransport, OfflineQueue,
        SensorStreamer, SyncOptions, SyncOrchestrator, Transport,
    },
};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting health-sync-agent");

    let config = AgentConfig::load()?;
    let engine = config.engine.clone();
    info!(
        device_id = %engine.sensor.device_id,
        data_dir = %config.data_dir.display(),
        "Agent configured"
    );

    // Initialize health registry
    let health_registry = HealthRegistry::new();
    health_registry.register(Component::Transport).await;
    health_registry.register(Component::Queue).await;
    health_registry.register(Component::Orchestrator).await;
    if config.sensor_enabled {
        health_registry.register(Component::Sensor).await;
    }

    let metrics = SyncMetrics::new();
    let logger = StructuredLogger::new(engine.sensor.device_id.clone());
    logger.log_startup(AGENT_VERSION, &engine.transport.base_url);

    // Session and transport
    let store: Arc<dyn SessionStore> = Arc::new(
        FileSessionStore::open(&config.session_path)
            .await
            .context("failed to open session store")?,
    );
    if store.get().await.is_none() {
        warn!("No session stored, sign in with `hcs login` before syncing");
    }

    let client = build_http_client(&engine.transport)?;
    let base_url = parse_base_url(&engine.transport.base_url)?;
    let auth = Arc::new(AuthClient::new(client.clone(), base_url.clone(), store.clone()));
    let coordinator = Arc::new(RefreshCoordinator::new(store.clone(), auth));
    {
        let registry = health_registry.clone();
        coordinator.on_session_expired(Arc::new(move || {
            let registry = registry.clone();
            tokio::spawn(async move { registry.record_session_expired().await });
        }));
    }
    let transport: Arc<dyn Transport> =
        Arc::new(HttpTransport::with_client(client, base_url, coordinator));

    // Offline queue with timer-driven flushing
    let queue = Arc::new(
        OfflineQueue::open(engine.queue.clone(), engine.routing.clone(), transport.clone())
            .await
            .context("failed to open offline queue")?,
    );
    let flush_handle = queue.start_auto_processing(engine.queue.flush_interval());

    let orchestrator = Arc::new(
        SyncOrchestrator::new(
            engine.orchestrator.clone(),
            engine.routing.clone(),
            Arc::new(FileDataSource::new(&config.data_dir)),
            transport.clone(),
        )
        .with_queue(queue.clone())
        .with_logger(logger.clone()),
    );

    let mut stream_stats = None;
    let stream_handle = if config.sensor_enabled {
        let record_type = RecordType::parse("accelerometer")?;
        let streamer = Arc::new(SensorStreamer::new(
            engine.sensor.clone(),
            record_type,
            transport.clone(),
            queue.clone(),
        ));
        stream_stats = Some(streamer.stats_handle());
        Some(streamer.start(select_source(None, &engine.sensor)))
    } else {
        None
    };

    // Health and metrics server
    let app_state = Arc::new(
        api::AppState::new(health_registry.clone(), metrics.clone())
            .with_queue(queue.clone())
            .with_orchestrator(orchestrator.clone()),
    );
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    // Periodic sync
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let sync_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        let orchestrator = orchestrator.clone();
        let queue = queue.clone();
        let registry = health_registry.clone();
        let interval = Duration::from_secs(config.sync_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        let summary = orchestrator.sync_all(SyncOptions::default()).await;
                        registry.record_sync(&summary).await;
                        registry
                            .record_queue_depth(queue.pending_count().await, queue.config().max_queue_size)
                            .await;
                        if let Some(stats) = &stream_stats {
                            let stats = stats.read().await.clone();
                            registry.record_stream(&stats).await;
                        }
                    }
                }
            }
        })
    };

    health_registry.set_ready(true).await;

    // Wait for shutdown signal or an API server failure
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            logger.log_shutdown("SIGINT received");
        }
        result = api_handle => {
            match result {
                Ok(Ok(())) => logger.log_shutdown("API server stopped"),
                Ok(Err(e)) => warn!(error = %e, "API server failed"),
                Err(e) => warn!(error = %e, "API server task failed"),
            }
        }
    }

    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(());
    if let Err(e) = sync_handle.await {
        warn!(error = %e, "Sync task ended abnormally");
    }
    if let Some(handle) = stream_handle {
        let stats = handle.stop().await;
        info!(chunks = stats.chunks_sealed, queued = stats.chunks_queued, "Sensor stream closed");
    }
    flush_handle.stop().await;
    info!(pending = queue.pending_count().await, "Shutting down");

    Ok(())
}
