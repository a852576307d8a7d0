//! Request middleware.
//!
//! Outermost first:
//!
//! 1. [`request_context`] — assigns or propagates `X-Request-ID` and
//!    finalises error envelopes so every non-2xx body carries the
//!    request id.
//! 2. [`track_metrics`] — HTTP counters/latency per matched route.
//! 3. [`auth_middleware`] — verifies the bearer token and injects the
//!    [`Principal`] into request extensions.
//! 4. [`rate_limit_middleware`] — fixed-window per-role budgets on the KV
//!    store, keyed by principal (or client IP when anonymous).

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, MatchedPath, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use tollgate_core::auth::Principal;

use crate::error::{ApiError, ErrorEnvelope, PendingEnvelope};
use crate::state::AppState;

/// Request id injected into request extensions.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Client IP injected into request extensions.
#[derive(Debug, Clone)]
pub struct ClientIp(pub String);

/// Window for the fixed-window rate limiter.
const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Best-effort client IP: `X-Forwarded-For` first hop, then the socket
/// address, then `unknown`.
#[must_use]
pub fn client_ip(req: &Request) -> String {
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_owned();
            }
        }
    }
    req.extensions()
        .get::<ConnectInfo<std::net::SocketAddr>>()
        .map_or_else(|| "unknown".to_owned(), |info| info.0.ip().to_string())
}

/// Outermost middleware: request id propagation and the error envelope.
pub async fn request_context(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map_or_else(|| Uuid::new_v4().to_string(), ToOwned::to_owned);
    req.extensions_mut().insert(RequestId(request_id.clone()));
    let ip = client_ip(&req);
    req.extensions_mut().insert(ClientIp(ip));

    let mut response = next.run(req).await;

    // Finalise a pending error envelope with the request id. Error
    // responses that did not come from an ApiError (router 404s,
    // extractor rejections) get the generic code for their status so
    // every non-2xx body has the same shape.
    let status = response.status();
    if let Some(pending) = response.extensions_mut().remove::<PendingEnvelope>() {
        let envelope = ErrorEnvelope {
            error_code: pending.code,
            message: pending.message,
            details: pending.details,
            request_id: request_id.clone(),
        };
        response = (status, axum::Json(envelope)).into_response();
    } else if status.is_client_error() || status.is_server_error() {
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap_or_default();
        let message = String::from_utf8_lossy(&bytes).trim().to_owned();
        let envelope = ErrorEnvelope {
            error_code: crate::error::code_for_status(status).to_owned(),
            message: if message.is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_owned()
            } else {
                message
            },
            details: None,
            request_id: request_id.clone(),
        };
        response = (status, axum::Json(envelope)).into_response();
    }

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// HTTP metrics, recorded per matched route template.
///
/// Attached with `route_layer` so [`MatchedPath`] is populated and path
/// parameters never leak into label cardinality.
pub async fn track_metrics(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| req.uri().path().to_owned(), |p| p.as_str().to_owned());
    let method = req.method().to_string();
    let started = Instant::now();

    let response = next.run(req).await;

    state
        .metrics
        .http_requests
        .with_label_values(&[&route, &method, response.status().as_str()])
        .inc();
    state
        .metrics
        .http_duration
        .with_label_values(&[&route, &method])
        .observe(started.elapsed().as_secs_f64());

    response
}

/// Bearer auth for everything under the protected API surface.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned);

    let Some(header) = header else {
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "missing Authorization header",
        ));
    };

    let token = header.strip_prefix("Bearer ").ok_or_else(|| {
        ApiError::new(
            StatusCode::UNAUTHORIZED,
            "Authorization header must use Bearer scheme",
        )
    })?;

    let principal = state.auth.verify(token)?;
    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}

/// Fixed-window per-role rate limiting.
///
/// Runs after auth, so protected routes are keyed by principal; a
/// request arriving without a principal falls to the `anonymous` tier
/// keyed by client IP.
pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let (role, subject) = req.extensions().get::<Principal>().map_or_else(
        || {
            let ip = req
                .extensions()
                .get::<ClientIp>()
                .map_or_else(|| "unknown".to_owned(), |ip| ip.0.clone());
            ("anonymous", ip)
        },
        |p| (p.role.as_str(), p.id.clone()),
    );

    let limit = state.rate_limits.per_minute(role);
    let key = format!("ratelimit:{role}:{subject}");

    let count = state
        .kv
        .incr(&key)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    if count == 1 {
        state
            .kv
            .expire(&key, RATE_WINDOW)
            .await
            .map_err(|e| ApiError::internal(e.to_string()))?;
    }

    if count > limit {
        return Err(ApiError::new(
            StatusCode::TOO_MANY_REQUESTS,
            format!("rate limit exceeded: {limit} requests/minute for role {role}"),
        ));
    }

    Ok(next.run(req).await)
}
