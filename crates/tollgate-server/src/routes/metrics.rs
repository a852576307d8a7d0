//! Prometheus metrics endpoint: `GET /metrics`
//!
//! Unauthenticated — Prometheus scrapes this.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;

use crate::state::AppState;

/// Build the `/metrics` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/metrics", get(render))
}

/// `GET /metrics` — text exposition format.
async fn render(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
