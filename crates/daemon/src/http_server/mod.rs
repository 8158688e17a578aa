use axum::routing::post;
use axum::Router;
use tokio::sync::watch;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use tower_http::trace::{DefaultOnFailure, DefaultOnResponse};
use tower_http::LatencyUnit;

mod config;
mod handlers;
mod health;
pub mod provision;

pub use config::Config;

use crate::ServiceState;

const STATUS_PREFIX: &str = "/_status";

/// Routes served to hosts and probes, without transport layers.
pub fn router(state: ServiceState) -> Router {
    Router::new()
        .route("/", post(provision::handler))
        .nest(STATUS_PREFIX, health::router(state.clone()))
        .fallback(handlers::not_found_handler)
        .with_state(state)
}

/// Run the provisioning server until `shutdown_rx` fires.
pub async fn run(
    config: Config,
    state: ServiceState,
    mut shutdown_rx: watch::Receiver<()>,
) -> Result<(), HttpServerError> {
    let listen_addr = config.listen_addr;
    let log_level = config.log_level;
    let trace_layer = TraceLayer::new_for_http()
        .on_response(
            DefaultOnResponse::new()
                .include_headers(false)
                .level(log_level)
                .latency_unit(LatencyUnit::Micros),
        )
        .on_failure(DefaultOnFailure::new().latency_unit(LatencyUnit::Micros));

    let router = router(state)
        .layer(ConcurrencyLimitLayer::new(config.max_concurrent_requests))
        .layer(trace_layer);

    tracing::info!(addr = ?listen_addr, "provisioning server listening");
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await?;

    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    #[error("an error occurred running the HTTP server: {0}")]
    ServingFailed(#[from] std::io::Error),
}
