//! Authentication routes: `POST /api/v1/auth/login`

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::middleware::ClientIp;
use crate::state::AppState;

/// Build the auth router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/auth/login", post(login))
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub role: String,
    pub permissions: Vec<String>,
}

/// `POST /auth/login` — verify credentials and mint a bearer token.
async fn login(
    State(state): State<Arc<AppState>>,
    Extension(client_ip): Extension<ClientIp>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    if body.username.trim().is_empty() || body.password.is_empty() {
        return Err(ApiError::bad_request("username and password are required"));
    }

    let outcome = state
        .auth
        .login(&body.username, &body.password, &client_ip.0)
        .await
        .inspect_err(|_| {
            state.metrics.auth_logins.with_label_values(&["fail"]).inc();
        })?;

    state
        .metrics
        .auth_logins
        .with_label_values(&["success"])
        .inc();

    Ok(Json(LoginResponse {
        token: outcome.token,
        role: outcome.role.to_string(),
        permissions: outcome
            .role
            .capabilities()
            .iter()
            .map(ToString::to_string)
            .collect(),
    }))
}
