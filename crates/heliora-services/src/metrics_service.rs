//! Metrics and health endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::routing::get;
use axum::{Json, Router};
use tokio::sync::watch;
use tracing::{error, info};

use heliora_core::metrics::OracleMetrics;
use heliora_core::{OracleError, Result};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics(State(registry): State<Arc<OracleMetrics>>) -> impl axum::response::IntoResponse {
    ([(CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], registry.render())
}

/// The `/metrics` and `/health` routes. The binary merges its ingest
/// routes into this router before serving.
pub fn router(registry: Arc<OracleMetrics>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(registry)
}

/// Bind and serve a router in the background until shutdown. Returns
/// the actual bound address (useful when the configured port is 0).
pub async fn serve_http(
    listen_addr: &str,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
) -> Result<SocketAddr> {
    let addr: SocketAddr = listen_addr
        .parse()
        .map_err(|e| OracleError::Config(format!("bad listen address: {e}")))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| OracleError::Config(format!("bind {addr} failed: {e}")))?;
    let bound = listener
        .local_addr()
        .map_err(|e| OracleError::Config(format!("local_addr failed: {e}")))?;

    tokio::spawn(async move {
        let serving = axum::serve(listener, app).with_graceful_shutdown(async move {
            loop {
                if shutdown.changed().await.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        });
        if let Err(e) = serving.await {
            error!(error = %e, "http server error");
        }
    });

    info!(addr = %bound, "http server listening");
    Ok(bound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serves_health_and_metrics() {
        let registry = Arc::new(OracleMetrics::new());
        registry.turns_total.inc();
        registry.record_winner("addr1");

        let (_tx, rx) = watch::channel(false);
        let addr = serve_http("127.0.0.1:0", router(registry), rx)
            .await
            .expect("serve");

        let health: serde_json::Value = reqwest::get(format!("http://{addr}/health"))
            .await
            .expect("health request")
            .json()
            .await
            .expect("health json");
        assert_eq!(health["status"], "ok");

        let response = reqwest::get(format!("http://{addr}/metrics"))
            .await
            .expect("metrics request");
        assert!(response
            .headers()
            .get(CONTENT_TYPE)
            .expect("content type")
            .to_str()
            .expect("ascii")
            .starts_with("text/plain"));
        let body = response.text().await.expect("metrics body");
        assert!(body.contains("heliora_turns_total 1"));
        assert!(body.contains("block_winner_total{creator=\"addr1\"} 1"));
    }

    #[tokio::test]
    async fn shutdown_stops_the_server() {
        let registry = Arc::new(OracleMetrics::new());
        let (tx, rx) = watch::channel(false);
        let addr = serve_http("127.0.0.1:0", router(registry), rx)
            .await
            .expect("serve");

        tx.send(true).expect("shutdown");
        // Give the graceful shutdown a moment, then the port must
        // refuse new connections.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(reqwest::get(format!("http://{addr}/health")).await.is_err());
    }
}
