//! HTTP API for health checks, Prometheus metrics and device commands

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde_json::{json, Value};
use std::sync::Arc;
use sync_core::{
    health::{ComponentStatus, HealthRegistry},
    observability::SyncMetrics,
    source::SourceError,
    sync::{CommandOutcome, OfflineQueue, OrchestratorError, SyncOrchestrator},
};
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: SyncMetrics,
    pub queue: Option<Arc<OfflineQueue>>,
    pub orchestrator: Option<Arc<SyncOrchestrator>>,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, metrics: SyncMetrics) -> Self {
        Self {
            health_registry,
            metrics,
            queue: None,
            orchestrator: None,
        }
    }

    /// Report queue depth on health checks
    pub fn with_queue(mut self, queue: Arc<OfflineQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Accept `PUSH`/`DEL` commands relayed from the service
    pub fn with_orchestrator(mut self, orchestrator: Arc<SyncOrchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }
}

/// Health check response - returns 200 if healthy, 503 if degraded/unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if let Some(queue) = &state.queue {
        let depth = queue.pending_count().await;
        state
            .health_registry
            .record_queue_depth(depth, queue.config().max_queue_size)
            .await;
    }
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Offline queue summary
async fn queue_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.queue {
        Some(queue) => {
            let stats = serde_json::to_value(queue.stats().await).unwrap_or_default();
            (StatusCode::OK, Json(stats))
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"detail": "offline queue disabled"})),
        ),
    }
}

/// Apply a relayed device command to the local data source
async fn apply_command(
    State(state): State<Arc<AppState>>,
    Json(message): Json<Value>,
) -> impl IntoResponse {
    let Some(orchestrator) = &state.orchestrator else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"detail": "device commands disabled"})),
        );
    };

    match orchestrator.apply_remote_command(&message).await {
        Ok(CommandOutcome::Inserted(ids)) => (
            StatusCode::OK,
            Json(json!({"success": true, "op": "PUSH", "ids": ids})),
        ),
        Ok(CommandOutcome::Deleted { record_type, count }) => (
            StatusCode::OK,
            Json(json!({"success": true, "op": "DEL", "recordType": record_type, "count": count})),
        ),
        Err(e) => {
            warn!(error = %e, "Device command rejected");
            let status = match &e {
                OrchestratorError::Command(_) => StatusCode::BAD_REQUEST,
                OrchestratorError::Source(SourceError::InvalidRecord(_)) => StatusCode::BAD_REQUEST,
                OrchestratorError::Source(SourceError::NotInitialized) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(json!({"detail": e.to_string()})))
        }
    }
}

/// Prometheus metrics endpoint
async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            Vec::new(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/queue", get(queue_stats))
        .route("/commands", post(apply_command))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
