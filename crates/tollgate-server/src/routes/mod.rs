//! HTTP route modules and router assembly.

pub mod auth;
pub mod breakers;
pub mod budget;
pub mod dlq;
pub mod metrics;

use std::sync::Arc;

use axum::extract::State;
use axum::middleware as axum_mw;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::middleware::{auth_middleware, rate_limit_middleware, request_context, track_metrics};
use crate::state::AppState;

/// Build the full application router.
///
/// Layer order (outermost first): trace → CORS → request context
/// (request id + error envelope) → routing → metrics → auth →
/// rate limiting → handler.
pub fn app(state: Arc<AppState>, cors: CorsLayer) -> Router {
    let protected = Router::new()
        .merge(budget::router())
        .merge(dlq::router())
        .merge(breakers::router())
        .route_layer(axum_mw::from_fn_with_state(
            Arc::clone(&state),
            rate_limit_middleware,
        ))
        .route_layer(axum_mw::from_fn_with_state(
            Arc::clone(&state),
            auth_middleware,
        ));

    // Login is deliberately outside the window limiter: the lockout
    // counter is its rate limit, and it must own the 429 it returns.
    // Password hashing is CPU-heavy, so cap concurrent logins instead.
    let api = Router::new()
        .merge(auth::router().layer(tower::limit::ConcurrencyLimitLayer::new(8)))
        .merge(protected)
        .route_layer(axum_mw::from_fn_with_state(
            Arc::clone(&state),
            track_metrics,
        ));

    Router::new()
        .nest("/api/v1", api)
        .merge(metrics::router())
        .route("/health", get(health))
        .layer(axum_mw::from_fn(request_context))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `GET /health` — unauthenticated liveness probe.
async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "tollgate",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}
