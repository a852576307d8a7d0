//! Circuit breaker routes: `/api/v1/circuit-breakers/*`

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Serialize;
use serde_json::json;

use tollgate_core::audit::AuditEvent;
use tollgate_core::auth::{Capability, Principal};
use tollgate_core::breaker::BreakerStats;

use crate::error::ApiError;
use crate::state::AppState;

/// Build the circuit breaker router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/circuit-breakers", get(stats_all))
        .route("/circuit-breakers/reset_all", post(reset_all))
}

#[derive(Debug, Serialize)]
pub struct ResetAllResponse {
    pub reset_count: usize,
    pub breakers: Vec<String>,
}

/// `GET /circuit-breakers` — stats for every registered breaker.
async fn stats_all(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<Vec<BreakerStats>>, ApiError> {
    principal.authorize(&[Capability::MetricsView])?;
    Ok(Json(state.breakers.stats_all()))
}

/// `POST /circuit-breakers/reset_all` — force every breaker closed.
async fn reset_all(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<ResetAllResponse>, ApiError> {
    principal.authorize(&[Capability::SystemAdmin])?;

    let breakers = state.breakers.reset_all();
    state.metrics.breaker_resets.inc();

    state
        .audit
        .log(AuditEvent::new(
            &principal.id,
            Some(principal.role),
            "breakers.reset_all",
            "circuit_breaker",
            "all",
            json!({ "reset_count": breakers.len(), "breakers": breakers }),
        ))
        .await;

    Ok(Json(ResetAllResponse {
        reset_count: breakers.len(),
        breakers,
    }))
}
