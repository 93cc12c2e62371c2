//! Metrics and liveness HTTP listener
//!
//! A small axum app on its own port: `/metrics` serves the Prometheus
//! text exposition, `/healthz` answers liveness probes.

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use forgecache_core::MetricsCollector;
use std::net::SocketAddr;
use tracing::info;

/// Build the metrics router
#[must_use]
pub fn router(metrics: MetricsCollector) -> Router {
    Router::new()
        .route("/metrics", get(serve_metrics))
        .route("/healthz", get(serve_healthz))
        .with_state(metrics)
}

async fn serve_metrics(State(metrics): State<MetricsCollector>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics.export_prometheus(),
    )
}

async fn serve_healthz() -> &'static str {
    "ok"
}

/// Serve the metrics endpoint until the shutdown future resolves
pub async fn serve(
    addr: SocketAddr,
    metrics: MetricsCollector,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(port = addr.port(), "Starting metrics server");
    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_metrics_route_serves_text() {
        let metrics = MetricsCollector::new();
        metrics.record_cache_write();

        let response = router(metrics)
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("cache_writes_total 1"));
    }

    #[tokio::test]
    async fn test_healthz_route() {
        let response = router(MetricsCollector::new())
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
