//! Budget routes: `/api/v1/budget/*`
//!
//! All four operations require `budget.view`. Non-approved decisions map
//! to 409 with a specialised error code; the envelope middleware attaches
//! the request id.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tollgate_core::auth::{Capability, Principal};
use tollgate_core::budget::{BudgetRequest, BudgetState, Decision, DecisionReason};

use crate::error::ApiError;
use crate::state::AppState;

/// Build the budget router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/budget/request", post(request_budget))
        .route("/budget/commit", post(commit_budget))
        .route("/budget/release", post(release_budget))
        .route("/budget/state", get(budget_state))
}

// ── Request / Response types ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct BudgetRequestBody {
    pub tenant_id: String,
    pub project_id: String,
    pub task_id: String,
    #[serde(default)]
    pub purpose: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    pub estimated_tokens: i64,
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CommitBody {
    pub tenant_id: String,
    pub project_id: String,
    pub reservation_id: Uuid,
    pub actual_tokens: i64,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseBody {
    pub tenant_id: String,
    pub project_id: String,
    pub reservation_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct StateParams {
    pub tenant_id: String,
    pub project_id: String,
}

#[derive(Debug, Serialize)]
pub struct CommitResponse {
    pub status: &'static str,
    pub tokens: i64,
    pub overshoot: bool,
}

#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    pub status: &'static str,
}

// ── Handlers ─────────────────────────────────────────────────────────

/// `POST /budget/request` — reserve tokens for a task.
async fn request_budget(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<BudgetRequestBody>,
) -> Result<Json<Decision>, ApiError> {
    principal.authorize(&[Capability::BudgetView])?;

    if body.estimated_tokens <= 0 {
        return Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "estimated_tokens must be positive",
        ));
    }

    let decision = state
        .budget
        .request(BudgetRequest {
            tenant_id: body.tenant_id,
            project_id: body.project_id,
            task_id: body.task_id,
            purpose: body.purpose.unwrap_or_else(|| "task".to_owned()),
            model: body.model.unwrap_or_default(),
            estimated_tokens: body.estimated_tokens,
            request_id: body.request_id,
        })
        .await?;

    let metrics = &state.metrics.budget_requests;
    match decision.reason {
        None => {
            metrics.with_label_values(&["approved"]).inc();
            Ok(Json(decision))
        }
        Some(DecisionReason::InsufficientBudget) => {
            metrics.with_label_values(&["insufficient"]).inc();
            Err(ApiError::with_code(
                StatusCode::CONFLICT,
                "budget.insufficient",
                format!(
                    "Insufficient budget. Available {}, Requested {}",
                    decision.available.unwrap_or(0),
                    decision.requested
                ),
            ))
        }
        Some(DecisionReason::ReservationFailed) => {
            metrics.with_label_values(&["failed"]).inc();
            Err(ApiError::new(
                StatusCode::CONFLICT,
                "reservation_failed: budget was depleted by a concurrent request",
            ))
        }
        Some(DecisionReason::DuplicateRequestInProgress) => {
            metrics.with_label_values(&["duplicate"]).inc();
            Err(ApiError::with_code(
                StatusCode::CONFLICT,
                "idempotency.conflict",
                "a request with this request_id is still in progress",
            ))
        }
    }
}

/// `POST /budget/commit` — settle a reservation with actual usage.
async fn commit_budget(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<CommitBody>,
) -> Result<Json<CommitResponse>, ApiError> {
    principal.authorize(&[Capability::BudgetView])?;

    if body.actual_tokens < 0 {
        return Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "actual_tokens must be non-negative",
        ));
    }

    let receipt = state
        .budget
        .commit(
            &principal,
            &body.tenant_id,
            &body.project_id,
            body.reservation_id,
            body.actual_tokens,
        )
        .await?;

    state.metrics.budget_commits.inc();
    Ok(Json(CommitResponse {
        status: "committed",
        tokens: receipt.tokens,
        overshoot: receipt.overshoot,
    }))
}

/// `POST /budget/release` — return a held reservation.
async fn release_budget(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<ReleaseBody>,
) -> Result<Json<ReleaseResponse>, ApiError> {
    principal.authorize(&[Capability::BudgetView])?;

    state
        .budget
        .release(
            &principal,
            &body.tenant_id,
            &body.project_id,
            body.reservation_id,
        )
        .await?;

    state.metrics.budget_releases.inc();
    Ok(Json(ReleaseResponse { status: "released" }))
}

/// `GET /budget/state` — totals for one (tenant, project).
async fn budget_state(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Query(params): Query<StateParams>,
) -> Result<Json<BudgetState>, ApiError> {
    principal.authorize(&[Capability::BudgetView])?;

    let snapshot = state
        .budget
        .state(&params.tenant_id, &params.project_id)
        .await?;
    Ok(Json(snapshot))
}
