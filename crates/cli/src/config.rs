//! Configuration management for the CLI

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Overrides the state directory (config, session and queue files)
pub const HOME_ENV: &str = "HCS_HOME";

/// CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// API endpoint URL
    pub api_url: Option<String>,
    /// Directory holding exported records
    pub data_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from file
    pub fn load(home: &Path) -> Result<Self> {
        let config_path = home.join("config.json");

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(&config_path).context("Failed to read config file")?;

        serde_json::from_str(&content).context("Failed to parse config file")
    }

    /// Save configuration to file
    pub fn save(&self, home: &Path) -> Result<()> {
        std::fs::create_dir_all(home).context("Failed to create config directory")?;

        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(home.join("config.json"), content)
            .context("Failed to write config file")?;

        Ok(())
    }
}

/// State directory: `$HCS_HOME`, else `hcs` under the user's config directory
pub fn home_dir() -> Result<PathBuf> {
    if let Some(home) = std::env::var_os(HOME_ENV) {
        return Ok(PathBuf::from(home));
    }
    let base = dirs_next::config_dir()
        .or_else(|| dirs_next::home_dir().map(|home| home.join(".config")))
        .context("Could not determine config directory")?;
    Ok(base.join("hcs"))
}

pub fn session_path(home: &Path) -> PathBuf {
    home.join("session.json")
}

pub fn queue_path(home: &Path) -> PathBuf {
    home.join("queue.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert!(config.api_url.is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("hcs");
        let config = Config {
            api_url: Some("http://collector:8000".to_string()),
            data_dir: Some(PathBuf::from("/var/lib/health")),
        };
        config.save(&home).unwrap();

        let loaded = Config::load(&home).unwrap();
        assert_eq!(loaded.api_url.as_deref(), Some("http://collector:8000"));
        assert_eq!(loaded.data_dir, Some(PathBuf::from("/var/lib/health")));
    }
}
