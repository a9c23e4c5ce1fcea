//! subgate - a request-shielding and subscription-aggregation gateway.
//!
//! Sits in front of an origin conversion service: admits or refuses
//! clients (rate limits, bans, blacklists, load-scaled browser
//! challenges), aggregates subscription links into one converter fetch,
//! sanitizes the converted output per target format, and caches the
//! result.

pub mod config;
pub mod db;
pub mod error;
pub mod fetch;
pub mod gateway;
pub mod http;
pub mod metrics;
pub mod sanitize;
pub mod shield;
