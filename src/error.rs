//! Unified error handling for subgate.
//!
//! One enum per layer, with automatic conversions and HTTP status
//! mapping. Client-facing bodies are generic on purpose: upstream error
//! text and storage details never leave the process.

use thiserror::Error;

// ============================================================================
// Request validation and identity
// ============================================================================

/// Errors raised before any real work happens.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("unknown client")]
    UnknownClient,

    #[error("client is blocked")]
    BlockedClient,

    #[error("no subscriptions available")]
    NoSubscriptions,
}

impl RequestError {
    /// HTTP status for this error.
    pub fn status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::UnknownClient => 404,
            Self::BlockedClient => 403,
            Self::NoSubscriptions => 404,
        }
    }

    /// Generic client-facing message. Never includes internal detail.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::Validation(_) => "invalid request",
            Self::UnknownClient => "client not found",
            Self::BlockedClient => "account disabled",
            Self::NoSubscriptions => "no subscriptions available",
        }
    }
}

// ============================================================================
// Upstream fetch
// ============================================================================

/// Failures talking to the origin conversion service.
///
/// Transport failures and 5xx are retryable; 4xx and the "1" body
/// signature are not.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream request timed out")]
    Timeout,

    #[error("could not connect to upstream")]
    Connect,

    #[error("upstream returned status {0}")]
    Status(u16),

    #[error("upstream returned a known failure body")]
    BadBody,

    #[error("upstream transport error: {0}")]
    Transport(String),

    #[error("retries exhausted: {0}")]
    Exhausted(String),
}

impl UpstreamError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Connect | Self::Transport(_) => true,
            Self::Status(code) => *code >= 500,
            Self::BadBody | Self::Exhausted(_) => false,
        }
    }

    /// HTTP status the gateway reports for this failure.
    pub fn status(&self) -> u16 {
        match self {
            Self::Timeout | Self::Connect => 504,
            // Explicit upstream refusals pass through; everything else
            // is a generic bad gateway.
            Self::Status(403) => 403,
            Self::Status(404) => 404,
            _ => 502,
        }
    }

    /// Generic client-facing message.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::Timeout | Self::Connect => "subscription source temporarily unavailable",
            Self::Status(404) => "subscription content not found",
            Self::Status(403) => "subscription source refused the request",
            _ => "failed to fetch subscription content",
        }
    }
}

// ============================================================================
// Storage backends
// ============================================================================

/// Counter/flag/blob store failures.
///
/// Shielding decisions fail open on these (log and continue); data
/// mutation paths fail loud.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

// ============================================================================
// Database
// ============================================================================

/// Relational store failures.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}
