//! HTTP servers: the gateway endpoint and the metrics endpoint.

use crate::gateway::handler::{pow_handler, subscribe_handler};
use crate::gateway::AppState;
use crate::metrics;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use tracing::info;

/// The gateway router. Other methods on `/sub` get 405 from axum.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/sub", get(subscribe_handler).post(pow_handler))
        .with_state(state)
}

/// Serve the gateway until the process exits.
pub async fn run(state: AppState, listen: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(listen = %listen, "Gateway listening");
    axum::serve(
        listener,
        build_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

pub fn metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
}

/// Serve the Prometheus endpoint on its own port.
pub async fn run_metrics(port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port = port, "Metrics listening");
    axum::serve(listener, metrics_router()).await?;
    Ok(())
}
