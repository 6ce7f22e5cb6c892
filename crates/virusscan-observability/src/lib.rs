//! Structured logging, the Prometheus metrics registry, and the
//! `/metrics`+`/health` axum server shared by both binaries. A simplified
//! cousin of `dekaf::logging::install` (no per-tenant log forwarding here,
//! just an `EnvFilter`-driven `fmt` layer) and `dekaf::metrics_server`
//! (same `/metrics` + axum shape, built on the `prometheus` crate's own
//! registry/encoder instead of a separate recorder crate).

pub mod metrics;
mod server;

pub use metrics::Metrics;
pub use server::{serve, HealthCheck};

use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install a `tracing` subscriber driven by `RUST_LOG`, defaulting to INFO.
/// Call once, at process startup.
pub fn install_tracing() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
