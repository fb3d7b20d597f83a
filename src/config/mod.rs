pub mod sessions;

pub use sessions::*;

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Get the seamux config directory
pub fn get_config_dir() -> AppResult<PathBuf> {
    let config_dir = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .ok_or_else(|| AppError::Config("Could not find config directory".into()))?
        .join("seamux");

    Ok(config_dir)
}

/// Backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_port")]
    pub default_port: u16,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_keepalive")]
    pub keepalive_interval_secs: u32,
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,
    #[serde(default = "default_watch_interval")]
    pub watch_interval_secs: u64,
    #[serde(default = "default_scrollback")]
    pub terminal_scrollback_bytes: usize,
}

fn default_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_command_timeout() -> u64 {
    30
}

fn default_keepalive() -> u32 {
    20 // within the usual 15-30s server tolerance
}

fn default_monitor_interval() -> u64 {
    5
}

fn default_watch_interval() -> u64 {
    2
}

fn default_scrollback() -> usize {
    256 * 1024
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_port: default_port(),
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
            keepalive_interval_secs: default_keepalive(),
            monitor_interval_secs: default_monitor_interval(),
            watch_interval_secs: default_watch_interval(),
            terminal_scrollback_bytes: default_scrollback(),
        }
    }
}

impl AppConfig {
    pub fn load(config_dir: &Path) -> AppResult<Self> {
        let config_path = config_dir.join("config.toml");
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = AppConfig::default();
            config.save(config_dir)?;
            Ok(config)
        }
    }

    pub fn save(&self, config_dir: &Path) -> AppResult<()> {
        std::fs::create_dir_all(config_dir)?;
        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.default_port, 22);
        assert_eq!(config.connect_timeout_secs, 30);
        assert!(config.terminal_scrollback_bytes > 0);
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(dir.path()).unwrap();
        assert_eq!(config.default_port, 22);
        assert!(dir.path().join("config.toml").exists());
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.monitor_interval_secs = 11;
        config.save(dir.path()).unwrap();

        let loaded = AppConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.monitor_interval_secs, 11);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "default_port = 2222\n").unwrap();

        let loaded = AppConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.default_port, 2222);
        assert_eq!(loaded.keepalive_interval_secs, 20);
    }
}
