//! Auth endpoints: login, logout, session check

use super::{ok, ok_empty, AppState};
use crate::error::{AppError, AppResult};
use axum::extract::{Request, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// POST /api/auth/login
pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let session = state.auth.login(&body.username, &body.password)?;
    Ok(ok(json!({
        "token": session.session_id,
        "username": session.username,
        "expiresAt": session.expires_at,
    })))
}

/// GET /api/auth/me
pub async fn me(
    State(state): State<AppState>,
    request: Request,
) -> AppResult<Json<serde_json::Value>> {
    let token = super::extract_token(&request)
        .ok_or_else(|| AppError::unauthorized("missing session token"))?;
    let session = state.auth.validate(&token)?;
    Ok(ok(json!({
        "username": session.username,
        "expiresAt": session.expires_at,
    })))
}

/// POST /api/auth/logout
pub async fn logout(
    State(state): State<AppState>,
    request: Request,
) -> AppResult<Json<serde_json::Value>> {
    if let Some(token) = super::extract_token(&request) {
        state.auth.logout(&token)?;
    }
    Ok(ok_empty())
}
