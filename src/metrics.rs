//! Prometheus metrics for the gateway.
//!
//! Tracks admission outcomes, challenge issuance, upstream fetch
//! behavior, and aggregation cache effectiveness. Exposed on a separate
//! HTTP port in text format.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

/// Gateway requests by final outcome (allowed, challenged, rejected).
pub static REQUESTS: OnceLock<IntCounterVec> = OnceLock::new();

/// Rejections by reason.
pub static REJECTS: OnceLock<IntCounterVec> = OnceLock::new();

/// Challenges issued by tier.
pub static CHALLENGES: OnceLock<IntCounterVec> = OnceLock::new();

/// Upstream fetch attempts by result.
pub static UPSTREAM_ATTEMPTS: OnceLock<IntCounterVec> = OnceLock::new();

/// Upstream retries after a failed attempt.
pub static UPSTREAM_RETRIES: OnceLock<IntCounter> = OnceLock::new();

/// Upstream fetch latency.
pub static UPSTREAM_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Aggregation cache hits.
pub static CACHE_HITS: OnceLock<IntCounter> = OnceLock::new();

/// Aggregation cache misses.
pub static CACHE_MISSES: OnceLock<IntCounter> = OnceLock::new();

/// Initialize the metrics registry. Call once at startup.
pub fn init() {
    let r = registry();

    macro_rules! register {
        ($metric:ident, $init:expr) => {
            if let Ok(m) = $init {
                if let Err(e) = r.register(Box::new(m.clone())) {
                    tracing::warn!(error = %e, concat!("Failed to register metric ", stringify!($metric)));
                }
                let _ = $metric.set(m);
            }
        };
    }

    register!(REQUESTS, IntCounterVec::new(Opts::new("subgate_requests_total", "Gateway requests by outcome"), &["outcome"]));
    register!(REJECTS, IntCounterVec::new(Opts::new("subgate_rejects_total", "Rejected requests by reason"), &["reason"]));
    register!(CHALLENGES, IntCounterVec::new(Opts::new("subgate_challenges_total", "Challenges issued by tier"), &["tier"]));
    register!(UPSTREAM_ATTEMPTS, IntCounterVec::new(Opts::new("subgate_upstream_attempts_total", "Upstream fetch attempts by result"), &["result"]));
    register!(UPSTREAM_RETRIES, IntCounter::new("subgate_upstream_retries_total", "Upstream retries"));
    register!(UPSTREAM_LATENCY, HistogramVec::new(
        HistogramOpts::new("subgate_upstream_duration_seconds", "Upstream fetch latency")
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["result"]));
    register!(CACHE_HITS, IntCounter::new("subgate_cache_hits_total", "Aggregation cache hits"));
    register!(CACHE_MISSES, IntCounter::new("subgate_cache_misses_total", "Aggregation cache misses"));
}

/// Gather all metrics in Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode Prometheus metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[inline]
pub fn record_request(outcome: &str) {
    if let Some(c) = REQUESTS.get() {
        c.with_label_values(&[outcome]).inc();
    }
}

#[inline]
pub fn record_reject(reason: &str) {
    if let Some(c) = REJECTS.get() {
        c.with_label_values(&[reason]).inc();
    }
}

#[inline]
pub fn record_challenge(tier: &str) {
    if let Some(c) = CHALLENGES.get() {
        c.with_label_values(&[tier]).inc();
    }
}

#[inline]
pub fn record_upstream_attempt(result: &str, duration_secs: f64) {
    if let Some(c) = UPSTREAM_ATTEMPTS.get() {
        c.with_label_values(&[result]).inc();
    }
    if let Some(h) = UPSTREAM_LATENCY.get() {
        h.with_label_values(&[result]).observe(duration_secs);
    }
}

#[inline]
pub fn record_upstream_retry() {
    if let Some(c) = UPSTREAM_RETRIES.get() {
        c.inc();
    }
}

#[inline]
pub fn record_cache_hit() {
    if let Some(c) = CACHE_HITS.get() {
        c.inc();
    }
}

#[inline]
pub fn record_cache_miss() {
    if let Some(c) = CACHE_MISSES.get() {
        c.inc();
    }
}
