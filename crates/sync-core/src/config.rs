//! Configuration for the sync engine components
//!
//! Every section has a `Default` so callers only spell out what they change.
//! `SyncEngineConfig` deserializes from any serde source with missing fields
//! filled from the defaults.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Invalid configuration value
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("invalid base URL '{url}': {reason}")]
    BaseUrl { url: String, reason: String },

    #[error("unknown record type '{0}' in routing configuration")]
    RecordType(String),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

/// Aggregated configuration for all sync components
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncEngineConfig {
    pub transport: TransportConfig,
    pub queue: QueueConfig,
    pub sensor: SensorConfig,
    pub routing: RoutingConfig,
    pub orchestrator: OrchestratorConfig,
}

impl SyncEngineConfig {
    /// Check values that would otherwise fail at runtime
    pub fn validate(&self) -> Result<(), ConfigError> {
        url::Url::parse(&self.transport.base_url).map_err(|e| ConfigError::BaseUrl {
            url: self.transport.base_url.clone(),
            reason: e.to_string(),
        })?;

        if self.transport.request_timeout_ms == 0 {
            return Err(ConfigError::Zero {
                field: "transport.request_timeout_ms",
            });
        }
        if self.queue.max_queue_size == 0 {
            return Err(ConfigError::Zero {
                field: "queue.max_queue_size",
            });
        }
        if self.queue.batch_size == 0 {
            return Err(ConfigError::Zero {
                field: "queue.batch_size",
            });
        }
        if self.queue.flush_interval_ms == 0 {
            return Err(ConfigError::Zero {
                field: "queue.flush_interval_ms",
            });
        }
        if self.sensor.sample_rate_hz <= 0.0 {
            return Err(ConfigError::Zero {
                field: "sensor.sample_rate_hz",
            });
        }
        if self.sensor.chunk_duration_ms == 0 {
            return Err(ConfigError::Zero {
                field: "sensor.chunk_duration_ms",
            });
        }

        for record_type in self
            .routing
            .overrides
            .keys()
            .chain(self.routing.legacy_types.iter())
        {
            crate::models::RecordType::parse(record_type)
                .map_err(|_| ConfigError::RecordType(record_type.clone()))?;
        }

        Ok(())
    }
}

/// Configuration for the HTTP transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Collection service base URL (e.g., "https://api.example.com/api/v2/")
    pub base_url: String,
    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Connect timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:6644/api/v2/".to_string(),
            request_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl TransportConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Configuration for the offline queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of queued items (offlineQueueSize)
    pub max_queue_size: usize,
    /// Items dequeued per flush
    pub batch_size: usize,
    /// Retries before an item is dropped
    pub max_retries: u32,
    /// Delay after a failed delivery, indexed by retry count, capped at the last entry
    pub backoff_schedule_ms: Vec<u64>,
    /// Auto-flush period
    pub flush_interval_ms: u64,
    /// Queue file; in-memory only when unset
    pub persistence_path: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            batch_size: 50,
            max_retries: 3,
            backoff_schedule_ms: vec![1_000, 5_000, 15_000],
            flush_interval_ms: 60_000,
            persistence_path: None,
        }
    }
}

impl QueueConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Configuration for sensor streaming
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub sample_rate_hz: f64,
    /// Window length of one chunk
    pub chunk_duration_ms: u64,
    /// Send sealed chunks immediately instead of queueing them
    pub auto_sync: bool,
    pub device_id: String,
    pub device_model: Option<String>,
    pub platform: String,
    /// Capacity of the channel between the sensor callback and the chunk builder
    pub channel_capacity: usize,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 50.0,
            chunk_duration_ms: 5_000,
            auto_sync: true,
            device_id: "unknown-device".to_string(),
            device_model: None,
            platform: "wear-os".to_string(),
            channel_capacity: 1024,
        }
    }
}

/// Endpoint routing for record types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Send records to `/ingest/{type}` instead of `/sync/{type}` (useIngest)
    pub use_ingest: bool,
    /// Per-type override of `use_ingest`
    pub overrides: HashMap<String, bool>,
    /// Write every batch to both endpoints concurrently (parallelMode)
    pub parallel_mode: bool,
    /// Types submitted one record at a time; empty disables the paced path
    pub legacy_types: Vec<String>,
    /// Delay between paced single-record submissions
    pub legacy_pacing_ms: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            use_ingest: false,
            overrides: HashMap::new(),
            parallel_mode: false,
            legacy_types: Vec::new(),
            legacy_pacing_ms: 1_000,
        }
    }
}

impl RoutingConfig {
    /// Whether `record_type` goes to the ingest endpoint; sensor streams always do
    pub fn uses_ingest(&self, record_type: &str) -> bool {
        if crate::models::SENSOR_TYPES.contains(&record_type) {
            return true;
        }
        self.overrides
            .get(record_type)
            .copied()
            .unwrap_or(self.use_ingest)
    }

    /// Endpoint path (relative to the base URL) for a record type
    pub fn primary_endpoint(&self, record_type: &str) -> String {
        if self.uses_ingest(record_type) {
            format!("ingest/{}", record_type)
        } else {
            format!("sync/{}", record_type)
        }
    }

    /// The other endpoint, written alongside the primary in parallel mode
    pub fn secondary_endpoint(&self, record_type: &str) -> Option<String> {
        if !self.parallel_mode || crate::models::SENSOR_TYPES.contains(&record_type) {
            return None;
        }
        if self.uses_ingest(record_type) {
            Some(format!("sync/{}", record_type))
        } else {
            Some(format!("ingest/{}", record_type))
        }
    }

    pub fn is_legacy(&self, record_type: &str) -> bool {
        self.legacy_types.iter().any(|t| t == record_type)
    }

    pub fn legacy_pacing(&self) -> Duration {
        Duration::from_millis(self.legacy_pacing_ms)
    }
}

/// Configuration for the sync orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Record types to sync; all health types when empty
    pub record_types: Vec<String>,
    /// Window start used when no sync has completed yet, in hours before now
    pub default_lookback_hours: i64,
    /// Queue records of a failed type for later delivery
    pub queue_on_failure: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            record_types: Vec::new(),
            default_lookback_hours: 24 * 30,
            queue_on_failure: true,
        }
    }
}
