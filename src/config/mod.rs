//! Configuration loading and management.
//!
//! Split into logical submodules:
//! - [`shield`]: admission control (rate limits, bans, challenges, blacklists)
//! - [`upstream`]: origin conversion service, cache, and store backends

mod shield;
mod upstream;

pub use shield::{BlacklistConfig, ChallengeConfig, LoadConfig, ShieldConfig};
pub use upstream::{CacheConfig, StoreBackend, StoreConfig, UpstreamConfig};

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Errors while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Server identity and listener settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Admission control settings.
    #[serde(default)]
    pub shield: ShieldConfig,
    /// Origin conversion service settings.
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Aggregation cache settings.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Counter/flag store backend settings.
    #[serde(default)]
    pub store: StoreConfig,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

/// Server identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address for the gateway endpoint.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Path to the SQLite database.
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Prometheus metrics HTTP port. 0 disables the endpoint.
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            db_path: default_db_path(),
            metrics_port: default_metrics_port(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_db_path() -> String {
    "subgate.db".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:8080");
        assert_eq!(config.shield.request_limit, 30);
        assert_eq!(config.cache.max_age_secs, 7200);
    }

    #[test]
    fn partial_section_overrides() {
        let config: Config = toml::from_str(
            r#"
            [shield]
            request_limit = 10
            time_window_secs = 30
            "#,
        )
        .unwrap();
        assert_eq!(config.shield.request_limit, 10);
        assert_eq!(config.shield.time_window_secs, 30);
        // Untouched fields keep defaults
        assert_eq!(config.shield.ban_time_secs, 1800);
    }
}
