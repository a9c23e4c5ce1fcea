//! subgate entry point: config, wiring, background tasks, servers.

use std::sync::Arc;
use std::time::Duration;
use subgate::config::Config;
use subgate::db::Database;
use subgate::fetch::{AggregationCache, FetchOrchestrator};
use subgate::gateway::AppState;
use subgate::shield::{
    build_store, BlacklistIndex, ChallengeEngine, LoadMonitor, ShieldGate, SystemLoadProbe,
};
use subgate::{http, metrics};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path, error = %e, "Failed to load config");
        e
    })?;

    info!(
        listen = %config.server.listen,
        db = %config.server.db_path,
        "Starting subgate"
    );

    metrics::init();

    let store = build_store(&config.store).await;
    let db = Database::connect(&config.server.db_path).await?;
    let blacklist = Arc::new(BlacklistIndex::new(
        config.shield.blacklist.clone(),
        Some(store.clone()),
    ));
    let challenges = Arc::new(ChallengeEngine::new(
        store.clone(),
        config.shield.challenge.clone(),
    ));
    let monitor = LoadMonitor::new(Box::new(SystemLoadProbe), config.shield.load.clone());
    let gate = Arc::new(ShieldGate::new(
        config.shield.clone(),
        store.clone(),
        blacklist.clone(),
        challenges.clone(),
        monitor,
    ));
    let cache = Arc::new(AggregationCache::new(config.cache.clone(), store.clone()));
    let fetcher = Arc::new(FetchOrchestrator::new(config.upstream.clone())?);

    let listen = config.server.listen.clone();
    let metrics_port = config.server.metrics_port;

    let state = AppState {
        config: Arc::new(config),
        db,
        store: store.clone(),
        gate,
        challenges,
        cache: cache.clone(),
        fetcher,
    };

    // Periodic maintenance: store expiry sweeps, hot-cache pruning,
    // blacklist memo pruning.
    {
        let store = store.clone();
        let cache = cache.clone();
        let blacklist = blacklist.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                store.maintain();
                cache.prune_hot();
                blacklist.prune_memo();
            }
        });
    }

    if metrics_port != 0 {
        tokio::spawn(async move {
            if let Err(e) = http::run_metrics(metrics_port).await {
                warn!(error = %e, "Metrics server exited");
            }
        });
    }

    http::run(state, &listen).await
}
