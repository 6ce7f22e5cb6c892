use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;

use crate::Metrics;

/// Whatever a binary needs to check before it calls itself healthy. The
/// Producer checks only Redis; the Consumer also checks clamd.
#[async_trait::async_trait]
pub trait HealthCheck: Send + Sync {
    async fn healthy(&self) -> bool;
}

#[derive(Clone)]
struct ServerState {
    metrics: Arc<Metrics>,
    health: Arc<dyn HealthCheck>,
}

fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn metrics_handler(State(state): State<ServerState>) -> (StatusCode, String) {
    (StatusCode::OK, state.metrics.encode())
}

async fn health_handler(State(state): State<ServerState>) -> StatusCode {
    if state.health.healthy().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Bind and serve `/metrics` and `/health` until the listener is dropped.
pub async fn serve(addr: SocketAddr, metrics: Arc<Metrics>, health: Arc<dyn HealthCheck>) -> std::io::Result<()> {
    let state = ServerState { metrics, health };
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, build_router(state)).await
}
