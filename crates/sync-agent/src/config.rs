//! Agent configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use sync_core::config::SyncEngineConfig;
use tracing::warn;

/// Environment variable naming an optional configuration file
pub const CONFIG_PATH_ENV: &str = "SYNC_AGENT_CONFIG";

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// API server port for health/metrics
    pub api_port: u16,

    /// Session file written on sign-in
    pub session_path: PathBuf,

    /// Directory holding exported records, one `{recordType}.json` per type
    pub data_dir: PathBuf,

    /// Offline queue file; overrides `engine.queue.persistence_path` when unset there
    pub queue_path: PathBuf,

    /// Periodic sync interval in seconds
    pub sync_interval_secs: u64,

    /// Stream accelerometer chunks alongside periodic syncs
    pub sensor_enabled: bool,

    pub engine: SyncEngineConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_port: 8080,
            session_path: PathBuf::from("state/session.json"),
            data_dir: PathBuf::from("data"),
            queue_path: PathBuf::from("state/queue.json"),
            sync_interval_secs: 900,
            sensor_enabled: false,
            engine: SyncEngineConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from the optional config file and environment
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    /// Layer `path` (when given) under `SYNC_AGENT_*` environment variables.
    ///
    /// Nested keys use `__`, e.g. `SYNC_AGENT_ENGINE__QUEUE__BATCH_SIZE`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("SYNC_AGENT")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to read agent configuration")?;

        let mut agent: AgentConfig = config.try_deserialize().unwrap_or_else(|e| {
            warn!(error = %e, "Invalid agent configuration, using defaults");
            AgentConfig::default()
        });

        if agent.engine.queue.persistence_path.is_none() {
            agent.engine.queue.persistence_path = Some(agent.queue_path.clone());
        }
        agent
            .engine
            .validate()
            .context("invalid sync engine configuration")?;

        Ok(agent)
    }
}
