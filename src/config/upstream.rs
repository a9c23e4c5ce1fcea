//! Upstream conversion service, cache, and store backend configuration.

use serde::Deserialize;

/// Origin conversion service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Origin conversion service addresses. Retries rotate across
    /// these when more than one is configured.
    #[serde(default = "default_servers")]
    pub servers: Vec<String>,
    /// Connect timeout in seconds (default: 10).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Total request timeout in seconds (default: 30).
    #[serde(default = "default_total_timeout")]
    pub total_timeout_secs: u64,
    /// Retries after the first attempt (default: 2).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Initial backoff delay in milliseconds; doubles per retry,
    /// no jitter (default: 300).
    #[serde(default = "default_backoff_ms")]
    pub backoff_base_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            servers: default_servers(),
            connect_timeout_secs: default_connect_timeout(),
            total_timeout_secs: default_total_timeout(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_ms(),
        }
    }
}

fn default_servers() -> Vec<String> {
    vec!["http://localhost:25500/sub".to_string()]
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_total_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_ms() -> u64 {
    300
}

/// Aggregation cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Maximum entry age in seconds; older entries are misses
    /// (default: 7200).
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age_secs: default_max_age(),
        }
    }
}

fn default_max_age() -> u64 {
    7200
}

/// Which backend holds counters, ban flags, and cached blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process shared memory. Fast, but not shared across workers.
    Memory,
    /// Networked KV store shared by all workers.
    Redis,
    /// Filesystem fallback. Weakest concurrency guarantees.
    File,
}

/// Counter/flag store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Preferred backend. Redis falls back to memory when unreachable.
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
    /// Redis connection URL.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Key prefix for all store entries.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Directory for the filesystem backend. Empty means the system
    /// temp directory.
    #[serde(default)]
    pub file_dir: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            redis_url: default_redis_url(),
            prefix: default_prefix(),
            file_dir: String::new(),
        }
    }
}

fn default_backend() -> StoreBackend {
    StoreBackend::Redis
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/15".to_string()
}

fn default_prefix() -> String {
    "subgate:".to_string()
}
