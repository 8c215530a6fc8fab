//! HTTP API layer
//!
//! Thin adapters over the query surface, the store, the agent client, and
//! the supervisor manager. Every response uses the same envelope:
//! `{success: bool, error?: string, data?: ...}`. Batch operations add
//! `{operated, failCount, results[]}` and answer 206 on partial success.
//!
//! All endpoints return JSON and are designed for the browser UI and local
//! backend callers; authentication is a bearer/cookie session validated by
//! the middleware below.

mod auth;
mod dashboard;
mod data;
mod endpoints;
mod sse;
mod tunnels;
mod version;

use crate::agent::AgentApi;
use crate::auth::AuthService;
use crate::config::HubConfig;
use crate::error::AppError;
use crate::filelog::FileLog;
use crate::hub::FanoutHub;
use crate::query::QuerySurface;
use crate::store::Store;
use crate::supervisor::SupervisorManager;
use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

/// Shared state for every handler
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub query: QuerySurface,
    pub hub: FanoutHub,
    pub hub_config: HubConfig,
    pub agent: AgentApi,
    pub supervisors: Arc<SupervisorManager>,
    pub filelog: Arc<FileLog>,
    pub auth: AuthService,
}

/// Success envelope
pub fn ok<T: Serialize>(data: T) -> Json<serde_json::Value> {
    Json(json!({ "success": true, "data": data }))
}

/// Success envelope without a payload
pub fn ok_empty() -> Json<serde_json::Value> {
    Json(json!({ "success": true }))
}

/// Build the full router
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        // Endpoints
        .route("/api/endpoints", get(endpoints::list).post(endpoints::create))
        .route(
            "/api/endpoints/:id",
            put(endpoints::update).delete(endpoints::destroy),
        )
        .route("/api/endpoints/:id/connect", post(endpoints::connect))
        .route("/api/endpoints/:id/disconnect", post(endpoints::disconnect))
        .route("/api/endpoints/:id/info", get(endpoints::info))
        .route("/api/endpoints/:id/instances", get(endpoints::instances))
        .route(
            "/api/endpoints/:id/instances/:instance_id",
            get(endpoints::instance),
        )
        .route(
            "/api/endpoints/:id/instances/:instance_id/control",
            post(endpoints::control_instance),
        )
        // Tunnels
        .route("/api/tunnels", get(tunnels::list).post(tunnels::create))
        .route(
            "/api/tunnels/:instance_id",
            get(tunnels::details).put(tunnels::update).delete(tunnels::destroy),
        )
        .route("/api/tunnels/:instance_id/details", get(tunnels::details))
        .route("/api/tunnels/:instance_id/control", post(tunnels::control))
        .route(
            "/api/tunnels/:instance_id/traffic-trend",
            get(tunnels::traffic_trend),
        )
        .route("/api/tunnels/:instance_id/ping-trend", get(tunnels::ping_trend))
        .route("/api/tunnels/:instance_id/pool-trend", get(tunnels::pool_trend))
        .route(
            "/api/tunnels/:instance_id/metrics-trend",
            get(tunnels::metrics_trend),
        )
        .route("/api/tunnels/:instance_id/file-logs", get(tunnels::file_logs))
        .route("/api/tunnels/:instance_id/tcping", get(tunnels::tcping))
        .route("/api/tunnels/:instance_id/tags", post(tunnels::set_tags))
        .route("/api/tunnels/:instance_id/peer", post(tunnels::set_peer))
        .route("/api/tunnels/batch", post(tunnels::batch))
        // Recycle
        .route("/api/tunnels/recycle/list", get(tunnels::recycle_list))
        .route(
            "/api/tunnels/recycle/:id",
            delete(tunnels::recycle_delete),
        )
        .route(
            "/api/tunnels/recycle/:id/restore",
            post(tunnels::recycle_restore),
        )
        // Dashboard
        .route("/api/dashboard/stats", get(dashboard::stats))
        .route("/api/dashboard/tunnel-stats", get(dashboard::tunnel_stats))
        .route("/api/dashboard/traffic-trend", get(dashboard::traffic_trend))
        .route("/api/dashboard/weekly-stats", get(dashboard::weekly_stats))
        .route(
            "/api/dashboard/operate_logs",
            get(dashboard::operate_logs).delete(dashboard::clear_operate_logs),
        )
        // SSE
        .route("/api/sse/tunnel/:instance_id", get(sse::tunnel_stream))
        .route("/api/sse/nodepass-proxy", get(sse::nodepass_proxy))
        .route("/api/sse/log-cleanup/stats", get(sse::log_cleanup_stats))
        .route("/api/sse/log-cleanup/config", get(sse::log_cleanup_config))
        .route("/api/sse/log-cleanup/trigger", post(sse::log_cleanup_trigger))
        // Data
        .route("/api/data/export", get(data::export))
        .route("/api/data/import", post(data::import))
        // Version
        .route("/api/version/current", get(version::current))
        // Session check
        .route("/api/auth/me", get(auth::me))
        .route("/api/auth/logout", post(auth::logout))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_session,
        ));

    Router::new()
        .route("/api/auth/login", post(auth::login))
        .merge(protected)
        .with_state(state)
}

/// Extract the session token from `Authorization: Bearer` or the cookie
fn extract_token(request: &Request) -> Option<String> {
    if let Some(value) = request.headers().get(header::AUTHORIZATION) {
        if let Ok(value) = value.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.trim().to_string());
            }
        }
    }
    let cookies = request.headers().get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == "session").then(|| value.to_string())
    })
}

/// Middleware: every protected route needs a live session
async fn require_session(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if !state.auth.enabled() {
        return next.run(request).await;
    }
    let Some(token) = extract_token(&request) else {
        return AppError::unauthorized("missing session token").into_response();
    };
    match state.auth.validate(&token) {
        Ok(_) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}
