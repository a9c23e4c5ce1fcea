//! Shared harness for gateway integration tests: an in-process gateway
//! on an ephemeral port, a seeded database, and fake upstream servers.

#![allow(dead_code)]

use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use subgate::config::{
    BlacklistConfig, CacheConfig, ChallengeConfig, Config, LoadConfig, ShieldConfig,
    UpstreamConfig,
};
use subgate::db::Database;
use subgate::fetch::{AggregationCache, FetchOrchestrator};
use subgate::gateway::AppState;
use subgate::http::build_router;
use subgate::shield::load::FixedLoadProbe;
use subgate::shield::{
    BlacklistIndex, ChallengeEngine, LoadMonitor, MemoryStore, ShieldGate, ShieldStore,
};

pub struct TestGateway {
    pub addr: SocketAddr,
    pub db: Database,
    _tmp: tempfile::TempDir,
}

impl TestGateway {
    pub fn url(&self, path_and_query: &str) -> String {
        format!("http://{}{}", self.addr, path_and_query)
    }
}

/// Spawn a gateway with a pinned load average and the given shield and
/// upstream settings. The database is seeded with two users (one
/// blocked) and the provided subscription links.
pub async fn spawn_gateway(
    shield: ShieldConfig,
    load: f64,
    upstream: UpstreamConfig,
    links: &[&str],
) -> TestGateway {
    let tmp = tempfile::tempdir().expect("tempdir");
    let db_path = tmp.path().join("gateway.db");
    let db = Database::connect(db_path.to_str().expect("utf8 path"))
        .await
        .expect("open database");
    seed(&db, links).await;

    let store: Arc<dyn ShieldStore> = Arc::new(MemoryStore::new());
    let blacklist = Arc::new(BlacklistIndex::new(
        BlacklistConfig {
            ipv4_deny_path: tmp.path().join("ban.txt").to_string_lossy().into_owned(),
            ipv6_deny_path: tmp.path().join("banv6.txt").to_string_lossy().into_owned(),
            ipv4_allow_path: tmp.path().join("unban.txt").to_string_lossy().into_owned(),
            ipv6_allow_path: tmp.path().join("unbanv6.txt").to_string_lossy().into_owned(),
            mirror_to_store: false,
            ..BlacklistConfig::default()
        },
        None,
    ));
    let challenges = Arc::new(ChallengeEngine::new(
        store.clone(),
        ChallengeConfig {
            // Cheap enough to brute force inline in tests
            pow_difficulty: 2,
            ..ChallengeConfig::default()
        },
    ));
    let monitor = LoadMonitor::new(Box::new(FixedLoadProbe(load)), LoadConfig::default());
    let gate = Arc::new(ShieldGate::new(
        shield,
        store.clone(),
        blacklist,
        challenges.clone(),
        monitor,
    ));
    let cache = Arc::new(AggregationCache::new(CacheConfig::default(), store.clone()));
    let fetcher = Arc::new(FetchOrchestrator::new(upstream).expect("build client"));

    let state = AppState {
        config: Arc::new(Config::default()),
        db: db.clone(),
        store,
        gate,
        challenges,
        cache,
        fetcher,
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind gateway");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(
            listener,
            build_router(state).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("serve gateway");
    });

    TestGateway {
        addr,
        db,
        _tmp: tmp,
    }
}

async fn seed(db: &Database, links: &[&str]) {
    sqlx::query("INSERT INTO users (uuid, username) VALUES ('uuid-alice', 'alice')")
        .execute(db.pool())
        .await
        .expect("seed alice");
    sqlx::query("INSERT INTO users (uuid, username, is_blocked) VALUES ('uuid-bob', 'bob', 1)")
        .execute(db.pool())
        .await
        .expect("seed bob");
    for link in links {
        sqlx::query("INSERT INTO subscriptions (link) VALUES (?)")
            .bind(link)
            .execute(db.pool())
            .await
            .expect("seed subscription");
    }
}

/// A fake converter or origin serving a fixed body at `/sub` and `/raw`
/// while counting hits.
pub async fn spawn_upstream(body: &'static str) -> (SocketAddr, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let handler_hits = hits.clone();
    let app = Router::new()
        .route(
            "/sub",
            get(move || {
                let hits = handler_hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    body
                }
            }),
        )
        .route("/raw", get(move || async move { body }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind upstream");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve upstream");
    });
    (addr, hits)
}

/// Test upstream config pointed at a fake converter, tuned for fast
/// failure.
pub fn upstream_config(addr: SocketAddr) -> UpstreamConfig {
    UpstreamConfig {
        servers: vec![format!("http://{addr}/sub")],
        connect_timeout_secs: 2,
        total_timeout_secs: 5,
        max_retries: 0,
        backoff_base_ms: 1,
    }
}

/// An HTTP client that does not follow redirects, so 303 responses stay
/// observable.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("build client")
}
