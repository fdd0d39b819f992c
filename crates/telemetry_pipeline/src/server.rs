//! HTTP scrape endpoint for pull exporters.

use crate::exposition::{self, CONTENT_TYPE};
use crate::pull::PullExporter;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Clone)]
struct ScrapeState {
    exporters: Arc<[Arc<PullExporter>]>,
}

/// Router serving `GET /metrics` from every given pull exporter.
pub fn metrics_router(exporters: Vec<Arc<PullExporter>>) -> Router {
    let state = ScrapeState {
        exporters: exporters.into(),
    };
    Router::new()
        .route("/metrics", get(scrape))
        .with_state(state)
}

async fn scrape(State(state): State<ScrapeState>) -> Response {
    let points: Vec<_> = state.exporters.iter().flat_map(|e| e.points()).collect();
    match exposition::render(&points) {
        Ok(body) => ([(header::CONTENT_TYPE, CONTENT_TYPE)], body).into_response(),
        Err(error) => {
            tracing::error!(%error, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response()
        }
    }
}

/// Serves `router` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "Serving metrics at /metrics");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
