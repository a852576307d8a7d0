//! Dead-letter queue routes: `/api/v1/dlq/*`
//!
//! Reads require `dlq.read`; resolving requires `system.admin`. Resolve
//! records the operator's requeue request — republishing stays manual.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use tollgate_core::audit::AuditEvent;
use tollgate_core::auth::{Capability, Principal};
use tollgate_core::dlq::DlqRecord;

use crate::error::ApiError;
use crate::state::AppState;

/// Build the DLQ router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/dlq", get(list_messages))
        .route("/dlq/{id}", get(get_message))
        .route("/dlq/{id}/resolve", post(resolve_message))
}

// ── Request / Response types ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub resolved: Option<bool>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct DlqMessageView {
    pub id: Uuid,
    pub original_subject: String,
    pub data: String,
    pub headers: serde_json::Value,
    pub error_count: i32,
    pub created_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_notes: Option<String>,
    pub requeue_requested: bool,
}

impl From<DlqRecord> for DlqMessageView {
    fn from(record: DlqRecord) -> Self {
        Self {
            id: record.id,
            original_subject: record.original_subject,
            data: String::from_utf8_lossy(&record.payload).into_owned(),
            headers: record.headers,
            error_count: record.error_count,
            created_at: record.created_at,
            resolved: record.resolved,
            resolved_at: record.resolved_at,
            resolution_notes: record.resolution_notes,
            requeue_requested: record.requeue_requested,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ResolveBody {
    pub note: String,
    #[serde(default)]
    pub requeue: bool,
}

#[derive(Debug, Serialize)]
pub struct ResolveResponse {
    pub status: &'static str,
    pub id: Uuid,
    pub resolved_at: Option<DateTime<Utc>>,
    pub requeue_requested: bool,
}

// ── Handlers ─────────────────────────────────────────────────────────

/// `GET /dlq` — list dead-lettered messages.
async fn list_messages(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<DlqMessageView>>, ApiError> {
    principal.authorize(&[Capability::DlqRead])?;

    let limit = params.limit.unwrap_or(50).clamp(1, 200);
    let offset = params.offset.unwrap_or(0).max(0);

    let records = state.dlq.list(params.resolved, limit, offset).await?;
    Ok(Json(records.into_iter().map(DlqMessageView::from).collect()))
}

/// `GET /dlq/{id}` — full record.
async fn get_message(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<Json<DlqMessageView>, ApiError> {
    principal.authorize(&[Capability::DlqRead])?;

    let record = state.dlq.get(id).await?;
    Ok(Json(record.into()))
}

/// `POST /dlq/{id}/resolve` — mark a message triaged.
async fn resolve_message(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    Json(body): Json<ResolveBody>,
) -> Result<Json<ResolveResponse>, ApiError> {
    principal.authorize(&[Capability::SystemAdmin])?;

    let record = state.dlq.resolve(id, &body.note, body.requeue).await?;

    state.metrics.dlq_resolved.inc();
    state
        .audit
        .log(AuditEvent::new(
            &principal.id,
            Some(principal.role),
            "dlq.resolve",
            "dlq_message",
            &id.to_string(),
            json!({
                "note": body.note,
                "requeue": body.requeue,
                "original_subject": record.original_subject,
            }),
        ))
        .await;

    Ok(Json(ResolveResponse {
        status: "resolved",
        id: record.id,
        resolved_at: record.resolved_at,
        requeue_requested: record.requeue_requested,
    }))
}
