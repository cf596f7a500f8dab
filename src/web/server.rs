use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::sync::watch;

use crate::config::MetricsConfig;

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn metrics(State(registry): State<Registry>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    (
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

/// Routes serving the registry in the Prometheus text format.
pub fn router(registry: Registry) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .with_state(registry)
}

/// Serves metrics until `shutdown_rx` flips to true.
pub async fn run_server(
    registry: Registry,
    metrics_config: MetricsConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = tokio::net::TcpListener::bind(&metrics_config.listen).await?;
    tracing::info!("Metrics server listening on {}", metrics_config.listen);

    axum::serve(listener, router(registry))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.wait_for(|&v| v).await;
            tracing::info!("Metrics server shutting down gracefully");
        })
        .await?;

    Ok(())
}
