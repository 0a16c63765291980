//! Tracing and metrics bootstrap for the gateway.
//!
//! Installs a `tracing` subscriber (env-filtered, fmt output) and a
//! Prometheus metrics recorder, and serves `/metrics` plus liveness and
//! readiness probes over HTTP. In tests the recorder is cached so repeated
//! initialization does not conflict.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the tracing subscriber and the Prometheus recorder.
///
/// Returns the handle used to render the `/metrics` payload.
pub fn init_observability() -> PrometheusHandle {
    // RUST_LOG-style filtering; default to "info" when unset or invalid.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer();
    init_subscriber(tracing_subscriber::registry().with(filter).with(fmt_layer));

    install_metrics_recorder()
}

/// Serve Prometheus metrics and health endpoints on `addr`.
pub async fn serve_metrics(handle: PrometheusHandle, addr: SocketAddr) -> std::io::Result<()> {
    let app = axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || async move { handle.render() }),
        )
        .route("/live", axum::routing::get(|| async { "ok" }))
        .route("/ready", axum::routing::get(|| async { "ok" }));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await
}

fn install_metrics_recorder() -> PrometheusHandle {
    // Cached process-wide: only the first call installs the recorder, later
    // calls (service restarts in tests) reuse its handle.
    METRICS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("install metrics recorder")
        })
        .clone()
}

fn init_subscriber<S>(subscriber: S)
where
    S: tracing::Subscriber + Send + Sync + 'static,
{
    // A second install keeps the first subscriber instead of panicking.
    let _ = subscriber.try_init();
}
