//! Liveness and readiness of the sync engine
//!
//! The registry keeps the latest facts reported by the engine (session
//! expiry, last run outcome, queue depth, sensor stream losses) and derives
//! each component's status from them when health is requested.

use crate::models::SyncSummary;
use crate::sync::StreamingStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Queue fill ratio at which the queue reports itself degraded
const QUEUE_BACKLOG_RATIO: f64 = 0.8;

/// Ordered from best to worst so the overall status is the maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Still operational
    Degraded,
    Unhealthy,
}

/// Engine parts reported on `/healthz`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Component {
    Transport,
    Queue,
    Sensor,
    Orchestrator,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Transport => "transport",
            Component::Queue => "queue",
            Component::Sensor => "sensor",
            Component::Orchestrator => "orchestrator",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the fact behind this status was reported, if ever
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, message: Option<String>, updated_at: Option<DateTime<Utc>>) -> Self {
        Self {
            status,
            message,
            updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
struct Reported<T> {
    value: T,
    at: DateTime<Utc>,
}

impl<T> Reported<T> {
    fn now(value: T) -> Self {
        Self {
            value,
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
struct EngineFacts {
    tracked: BTreeSet<Component>,
    ready: bool,
    session_expired: Option<Reported<()>>,
    last_run: Option<Reported<SyncSummary>>,
    queue_depth: Option<Reported<(usize, usize)>>,
    stream: Option<Reported<(u64, Option<String>)>>,
}

impl EngineFacts {
    fn transport(&self) -> ComponentHealth {
        if let Some(expired) = &self.session_expired {
            return ComponentHealth::new(
                ComponentStatus::Unhealthy,
                Some("Session expired, sign in again".to_string()),
                Some(expired.at),
            );
        }
        match &self.last_run {
            // Every type that had records failed
            Some(run) if run.value.total > 0 && run.value.synced == 0 && !run.value.failed_types.is_empty() => {
                ComponentHealth::new(
                    ComponentStatus::Degraded,
                    Some("No records delivered in the last run".to_string()),
                    Some(run.at),
                )
            }
            run => ComponentHealth::new(ComponentStatus::Healthy, None, run.as_ref().map(|r| r.at)),
        }
    }

    fn orchestrator(&self) -> ComponentHealth {
        match &self.last_run {
            Some(run) if !run.value.failed_types.is_empty() => ComponentHealth::new(
                ComponentStatus::Degraded,
                Some(format!("Failed record types: {}", run.value.failed_types.join(", "))),
                Some(run.at),
            ),
            run => ComponentHealth::new(ComponentStatus::Healthy, None, run.as_ref().map(|r| r.at)),
        }
    }

    fn queue(&self) -> ComponentHealth {
        match &self.queue_depth {
            Some(Reported {
                value: (depth, capacity),
                at,
            }) if *capacity > 0 && *depth as f64 >= *capacity as f64 * QUEUE_BACKLOG_RATIO => {
                ComponentHealth::new(
                    ComponentStatus::Degraded,
                    Some(format!("Offline queue backing up: {}/{}", depth, capacity)),
                    Some(*at),
                )
            }
            depth => ComponentHealth::new(ComponentStatus::Healthy, None, depth.as_ref().map(|d| d.at)),
        }
    }

    fn sensor(&self) -> ComponentHealth {
        match &self.stream {
            Some(Reported {
                value: (lost, last_error),
                at,
            }) if *lost > 0 => {
                let mut message = format!("{} chunks lost", lost);
                if let Some(error) = last_error {
                    message.push_str(&format!(", last error: {}", error));
                }
                ComponentHealth::new(ComponentStatus::Degraded, Some(message), Some(*at))
            }
            stream => ComponentHealth::new(ComponentStatus::Healthy, None, stream.as_ref().map(|s| s.at)),
        }
    }

    fn health_of(&self, component: Component) -> ComponentHealth {
        match component {
            Component::Transport => self.transport(),
            Component::Queue => self.queue(),
            Component::Sensor => self.sensor(),
            Component::Orchestrator => self.orchestrator(),
        }
    }
}

/// Shared view of engine health, cheap to clone
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    facts: Arc<RwLock<EngineFacts>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `component` on health checks
    pub async fn register(&self, component: Component) {
        self.facts.write().await.tracked.insert(component);
    }

    pub async fn set_ready(&self, ready: bool) {
        self.facts.write().await.ready = ready;
    }

    /// Outcome of a sync run; a run that delivered records also clears an expired session
    pub async fn record_sync(&self, summary: &SyncSummary) {
        let mut facts = self.facts.write().await;
        facts.tracked.insert(Component::Orchestrator);
        if summary.synced > 0 {
            facts.session_expired = None;
        }
        facts.last_run = Some(Reported::now(summary.clone()));
    }

    pub async fn record_queue_depth(&self, depth: usize, capacity: usize) {
        let mut facts = self.facts.write().await;
        facts.tracked.insert(Component::Queue);
        facts.queue_depth = Some(Reported::now((depth, capacity)));
    }

    /// Transport is unusable until the user signs in again
    pub async fn record_session_expired(&self) {
        let mut facts = self.facts.write().await;
        facts.tracked.insert(Component::Transport);
        facts.session_expired = Some(Reported::now(()));
    }

    pub async fn record_stream(&self, stats: &StreamingStats) {
        let mut facts = self.facts.write().await;
        facts.tracked.insert(Component::Sensor);
        facts.stream = Some(Reported::now((stats.chunks_lost, stats.last_error.clone())));
    }

    pub async fn health(&self) -> HealthResponse {
        let facts = self.facts.read().await;
        let components: BTreeMap<String, ComponentHealth> = facts
            .tracked
            .iter()
            .map(|component| (component.to_string(), facts.health_of(*component)))
            .collect();
        let status = components
            .values()
            .map(|health| health.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        HealthResponse { status, components }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let ready = self.facts.read().await.ready;
        if !ready {
            return ReadinessResponse {
                ready: false,
                reason: Some("Sync agent not yet initialized".to_string()),
            };
        }

        match self.health().await.status {
            ComponentStatus::Unhealthy => ReadinessResponse {
                ready: false,
                reason: Some("Critical component unhealthy".to_string()),
            },
            _ => ReadinessResponse {
                ready: true,
                reason: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(total: usize, synced: usize, failed: &[&str]) -> SyncSummary {
        SyncSummary {
            total,
            synced,
            timestamp: Utc::now(),
            failed_types: failed.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_registered_components_start_healthy() {
        let registry = HealthRegistry::new();
        assert!(registry.health().await.components.is_empty());

        registry.register(Component::Transport).await;
        registry.register(Component::Queue).await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Healthy);
        assert_eq!(health.components.len(), 2);
        assert!(health.components["queue"].updated_at.is_none());
    }

    #[tokio::test]
    async fn test_failed_types_degrade_orchestrator() {
        let registry = HealthRegistry::new();
        registry.record_sync(&summary(10, 6, &["heartRate"])).await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Degraded);
        let orchestrator = &health.components["orchestrator"];
        assert_eq!(orchestrator.status, ComponentStatus::Degraded);
        assert!(orchestrator.message.as_ref().unwrap().contains("heartRate"));
    }

    #[tokio::test]
    async fn test_run_with_nothing_delivered_degrades_transport() {
        let registry = HealthRegistry::new();
        registry.register(Component::Transport).await;
        registry.record_sync(&summary(4, 0, &["steps", "weight"])).await;
        assert_eq!(
            registry.health().await.components["transport"].status,
            ComponentStatus::Degraded
        );

        // A run with nothing to send says nothing about the service
        registry.record_sync(&summary(0, 0, &[])).await;
        assert_eq!(registry.health().await.status, ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_queue_depth_thresholds() {
        let registry = HealthRegistry::new();
        registry.record_queue_depth(10, 100).await;
        assert_eq!(registry.health().await.status, ComponentStatus::Healthy);

        registry.record_queue_depth(80, 100).await;
        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);

        registry.record_queue_depth(5, 0).await;
        assert_eq!(registry.health().await.status, ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_lost_chunks_degrade_sensor() {
        let registry = HealthRegistry::new();
        registry
            .record_stream(&StreamingStats {
                chunks_lost: 2,
                last_error: Some("queue file I/O failed".to_string()),
                ..Default::default()
            })
            .await;

        let sensor = &registry.health().await.components["sensor"];
        assert_eq!(sensor.status, ComponentStatus::Degraded);
        assert!(sensor.message.as_ref().unwrap().starts_with("2 chunks lost"));
    }

    #[tokio::test]
    async fn test_expired_session_until_delivery_resumes() {
        let registry = HealthRegistry::new();
        registry.set_ready(true).await;
        registry.record_session_expired().await;

        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);
        assert!(!registry.readiness().await.ready);

        registry.record_sync(&summary(3, 3, &[])).await;
        assert_eq!(registry.health().await.status, ComponentStatus::Healthy);
        assert!(registry.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_readiness_waits_for_startup() {
        let registry = HealthRegistry::new();
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert!(readiness.reason.is_some());

        registry.set_ready(true).await;
        assert!(registry.readiness().await.ready);
    }
}
