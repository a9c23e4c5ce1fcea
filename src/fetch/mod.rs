//! Upstream aggregation: converter fetches and result caching.

pub mod cache;
pub mod orchestrator;

pub use cache::{fingerprint, AggregationCache, CacheEntry};
pub use orchestrator::{FetchOrchestrator, FetchResult};
