//! HTTP error types and the wire envelope.
//!
//! Handlers return domain errors; the `From` impls here perform the
//! taxonomy → status/code mapping, and the single top-level middleware
//! (`middleware::request_context`) serialises the final envelope
//! `{error_code, message, details, request_id}`. Handlers never build
//! envelopes themselves: [`ApiError::into_response`] stashes a pending
//! envelope in the response extensions for the middleware to finish.
//!
//! Status → code map: 400 `validation.invalid_request`,
//! 401 `auth.unauthorized`, 403 `auth.forbidden`, 404 `resource.not_found`,
//! 409 `state.conflict`, 422 `validation.unprocessable_entity`,
//! 429 `rate_limit.exceeded`, 500 `internal.error`,
//! 503 `service.unavailable` — with specialised markers
//! (`budget.insufficient`, `idempotency.conflict`,
//! `auth.invalid_credentials`, `dlq.already_resolved`) overriding the
//! generic code where they apply.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;

use tollgate_core::error::{AuthError, BudgetError, DlqError};
use tollgate_store::KvError;

/// The JSON error body sent for every non-2xx response.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub error_code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub request_id: String,
}

/// An error response waiting for its request id.
///
/// Inserted into response extensions by [`ApiError::into_response`] and
/// consumed by the envelope middleware.
#[derive(Debug, Clone)]
pub struct PendingEnvelope {
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

/// Application-level error returned from HTTP handlers.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

/// Generic code for a status per the taxonomy table.
#[must_use]
pub fn code_for_status(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "validation.invalid_request",
        StatusCode::UNAUTHORIZED => "auth.unauthorized",
        StatusCode::FORBIDDEN => "auth.forbidden",
        StatusCode::NOT_FOUND => "resource.not_found",
        StatusCode::CONFLICT => "state.conflict",
        StatusCode::UNPROCESSABLE_ENTITY => "validation.unprocessable_entity",
        StatusCode::TOO_MANY_REQUESTS => "rate_limit.exceeded",
        StatusCode::SERVICE_UNAVAILABLE => "service.unavailable",
        _ => "internal.error",
    }
}

impl ApiError {
    /// Build an error with the generic code for its status.
    #[must_use]
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code_for_status(status).to_owned(),
            message: message.into(),
            details: None,
        }
    }

    /// Build an error with a specialised code overriding the generic one.
    #[must_use]
    pub fn with_code(
        status: StatusCode,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Attach structured details.
    #[must_use]
    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// 400 with the generic validation code.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    /// 500 with the internals kept out of the body.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(error = %message, "internal error");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal server error",
        )
    }

    /// 503 for an unreachable dependency.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::warn!(error = %message, "dependency unavailable");
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "service unavailable")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = self.status.into_response();
        response.extensions_mut().insert(PendingEnvelope {
            code: self.code,
            message: self.message,
            details: self.details,
        });
        response
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match &err {
            AuthError::RateLimited { .. } => {
                Self::new(StatusCode::TOO_MANY_REQUESTS, err.to_string())
            }
            AuthError::InvalidCredentials => Self::with_code(
                StatusCode::UNAUTHORIZED,
                "auth.invalid_credentials",
                err.to_string(),
            ),
            AuthError::TokenExpired | AuthError::TokenInvalid { .. } => {
                Self::new(StatusCode::UNAUTHORIZED, err.to_string())
            }
            AuthError::Forbidden { missing } => {
                let caps: Vec<String> = missing.iter().map(ToString::to_string).collect();
                Self::new(StatusCode::FORBIDDEN, err.to_string())
                    .details(json!({ "missing_capabilities": caps }))
            }
            AuthError::Kv(kv) => Self::from_kv(kv),
            AuthError::Hash { .. } | AuthError::Directory(_) => Self::internal(err.to_string()),
        }
    }
}

impl From<BudgetError> for ApiError {
    fn from(err: BudgetError) -> Self {
        match &err {
            BudgetError::ReservationNotFound { .. } => {
                Self::new(StatusCode::NOT_FOUND, err.to_string())
            }
            BudgetError::Overflow { .. } => Self::new(StatusCode::CONFLICT, err.to_string()),
            BudgetError::Kv(kv) => Self::from_kv(kv),
            BudgetError::Codec { .. } | BudgetError::Ledger(_) => Self::internal(err.to_string()),
        }
    }
}

impl From<DlqError> for ApiError {
    fn from(err: DlqError) -> Self {
        match &err {
            DlqError::NotFound { .. } => Self::new(StatusCode::NOT_FOUND, err.to_string()),
            DlqError::AlreadyResolved { .. } => Self::with_code(
                StatusCode::CONFLICT,
                "dlq.already_resolved",
                err.to_string(),
            ),
            DlqError::Backend { .. } => Self::internal(err.to_string()),
            DlqError::Bus(_) => Self::unavailable(err.to_string()),
        }
    }
}

impl ApiError {
    fn from_kv(err: &KvError) -> Self {
        match err {
            KvError::Connection { .. } => Self::unavailable(err.to_string()),
            _ => Self::internal(err.to_string()),
        }
    }
}
