//! Admission control configuration: rate limits, bans, challenges,
//! blacklists, and load thresholds.

use serde::Deserialize;

/// Admission control configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ShieldConfig {
    /// Maximum requests per IP within the time window (default: 30).
    #[serde(default = "default_request_limit")]
    pub request_limit: u32,
    /// Sliding window length in seconds (default: 60).
    #[serde(default = "default_time_window")]
    pub time_window_secs: u64,
    /// Ban duration in seconds (default: 1800).
    #[serde(default = "default_ban_time")]
    pub ban_time_secs: u64,
    /// IPs exempt from every shielding check.
    #[serde(default)]
    pub whitelist: Vec<String>,
    /// Extra suspicious-request regex patterns, appended to the
    /// built-in list.
    #[serde(default)]
    pub extra_patterns: Vec<String>,
    /// Challenge settings.
    #[serde(default)]
    pub challenge: ChallengeConfig,
    /// Blacklist file settings.
    #[serde(default)]
    pub blacklist: BlacklistConfig,
    /// Load thresholds.
    #[serde(default)]
    pub load: LoadConfig,
}

impl Default for ShieldConfig {
    fn default() -> Self {
        Self {
            request_limit: default_request_limit(),
            time_window_secs: default_time_window(),
            ban_time_secs: default_ban_time(),
            whitelist: Vec::new(),
            extra_patterns: Vec::new(),
            challenge: ChallengeConfig::default(),
            blacklist: BlacklistConfig::default(),
            load: LoadConfig::default(),
        }
    }
}

fn default_request_limit() -> u32 {
    30
}

fn default_time_window() -> u64 {
    60
}

fn default_ban_time() -> u64 {
    1800
}

/// Challenge configuration for the JS and proof-of-work flows.
#[derive(Debug, Clone, Deserialize)]
pub struct ChallengeConfig {
    /// Required leading hex zeros in the PoW digest (default: 4).
    #[serde(default = "default_pow_difficulty")]
    pub pow_difficulty: usize,
    /// Lifetime of an unanswered challenge in seconds (default: 30).
    #[serde(default = "default_challenge_timeout")]
    pub challenge_timeout_secs: u64,
    /// Name of the verification cookie (default: "sg_token").
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    /// Lifetime of a verified token in seconds (default: 120).
    #[serde(default = "default_cookie_lifetime")]
    pub cookie_lifetime_secs: u64,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            pow_difficulty: default_pow_difficulty(),
            challenge_timeout_secs: default_challenge_timeout(),
            cookie_name: default_cookie_name(),
            cookie_lifetime_secs: default_cookie_lifetime(),
        }
    }
}

fn default_pow_difficulty() -> usize {
    4
}

fn default_challenge_timeout() -> u64 {
    30
}

fn default_cookie_name() -> String {
    "sg_token".to_string()
}

fn default_cookie_lifetime() -> u64 {
    120
}

/// Flat-file blacklist configuration.
///
/// Four independent lists: IPv4/IPv6 deny and IPv4/IPv6 allow. The
/// allow lists are checked first and override deny matches.
#[derive(Debug, Clone, Deserialize)]
pub struct BlacklistConfig {
    /// IPv4 deny list path.
    #[serde(default = "default_v4_deny")]
    pub ipv4_deny_path: String,
    /// IPv6 deny list path.
    #[serde(default = "default_v6_deny")]
    pub ipv6_deny_path: String,
    /// IPv4 allow list path.
    #[serde(default = "default_v4_allow")]
    pub ipv4_allow_path: String,
    /// IPv6 allow list path.
    #[serde(default = "default_v6_allow")]
    pub ipv6_allow_path: String,
    /// Minimum seconds between reloads (default: 300).
    #[serde(default = "default_blacklist_cache_time")]
    pub cache_time_secs: u64,
    /// Per-IP verdict memoization TTL in seconds (default: 600).
    #[serde(default = "default_memo_ttl")]
    pub memo_ttl_secs: u64,
    /// Mirror loaded lists into the shared store so multiple workers
    /// amortize file I/O (default: true).
    #[serde(default = "default_true")]
    pub mirror_to_store: bool,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            ipv4_deny_path: default_v4_deny(),
            ipv6_deny_path: default_v6_deny(),
            ipv4_allow_path: default_v4_allow(),
            ipv6_allow_path: default_v6_allow(),
            cache_time_secs: default_blacklist_cache_time(),
            memo_ttl_secs: default_memo_ttl(),
            mirror_to_store: true,
        }
    }
}

fn default_v4_deny() -> String {
    "ip/ban.txt".to_string()
}

fn default_v6_deny() -> String {
    "ip/banv6.txt".to_string()
}

fn default_v4_allow() -> String {
    "ip/unban.txt".to_string()
}

fn default_v6_allow() -> String {
    "ip/unbanv6.txt".to_string()
}

fn default_blacklist_cache_time() -> u64 {
    300
}

fn default_memo_ttl() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

/// Load-average thresholds for challenge escalation.
#[derive(Debug, Clone, Deserialize)]
pub struct LoadConfig {
    /// 1-minute load average above which the JS challenge is issued
    /// (default: 3.0).
    #[serde(default = "default_medium_threshold")]
    pub medium_threshold: f64,
    /// 1-minute load average above which the PoW challenge is issued
    /// (default: 5.0).
    #[serde(default = "default_high_threshold")]
    pub high_threshold: f64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            medium_threshold: default_medium_threshold(),
            high_threshold: default_high_threshold(),
        }
    }
}

fn default_medium_threshold() -> f64 {
    3.0
}

fn default_high_threshold() -> f64 {
    5.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shield_defaults() {
        let config = ShieldConfig::default();
        assert_eq!(config.request_limit, 30);
        assert_eq!(config.time_window_secs, 60);
        assert_eq!(config.ban_time_secs, 1800);
        assert!(config.whitelist.is_empty());
    }

    #[test]
    fn challenge_defaults() {
        let config = ChallengeConfig::default();
        assert_eq!(config.pow_difficulty, 4);
        assert_eq!(config.challenge_timeout_secs, 30);
        assert_eq!(config.cookie_name, "sg_token");
        assert_eq!(config.cookie_lifetime_secs, 120);
    }

    #[test]
    fn blacklist_defaults() {
        let config = BlacklistConfig::default();
        assert_eq!(config.cache_time_secs, 300);
        assert_eq!(config.memo_ttl_secs, 600);
        assert!(config.mirror_to_store);
    }

    #[test]
    fn load_defaults() {
        let config = LoadConfig::default();
        assert!((config.medium_threshold - 3.0).abs() < f64::EPSILON);
        assert!((config.high_threshold - 5.0).abs() < f64::EPSILON);
    }
}
