//! Dashboard endpoints: aggregates and the operation log

use super::{ok, AppState};
use crate::error::AppResult;
use axum::extract::{Query, State};
use axum::Json;
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::json;

/// GET /api/dashboard/stats
pub async fn stats(State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    Ok(ok(state.store.dashboard_stats()?))
}

/// GET /api/dashboard/tunnel-stats - per-status tunnel counts only
pub async fn tunnel_stats(State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    let stats = state.store.dashboard_stats()?;
    Ok(ok(json!({
        "total": stats.tunnel_total,
        "byStatus": stats.tunnels_by_status,
    })))
}

#[derive(Debug, Deserialize)]
pub struct TrendQueryParams {
    pub hours: Option<u32>,
}

/// GET /api/dashboard/traffic-trend - hourly sums across all instances
pub async fn traffic_trend(
    State(state): State<AppState>,
    Query(query): Query<TrendQueryParams>,
) -> AppResult<Json<serde_json::Value>> {
    let hours = query.hours.unwrap_or(24).clamp(1, 24 * 7);
    let since = Utc::now() - Duration::hours(hours as i64);
    Ok(ok(state.store.hourly_traffic(since)?))
}

/// GET /api/dashboard/weekly-stats - daily sums over the trailing week
pub async fn weekly_stats(State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    Ok(ok(state.store.weekly_traffic()?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpLogQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

/// GET /api/dashboard/operate_logs
pub async fn operate_logs(
    State(state): State<AppState>,
    Query(query): Query<OpLogQuery>,
) -> AppResult<Json<serde_json::Value>> {
    let page = query.page.unwrap_or(1).max(1);
    let page_size = query.page_size.unwrap_or(20).clamp(1, 1000);
    let rows = state
        .store
        .list_operations(page_size, (page - 1) * page_size)?;
    let total = state.store.count_operations()?;
    Ok(ok(json!({
        "items": rows,
        "total": total,
        "page": page,
        "pageSize": page_size,
    })))
}

/// DELETE /api/dashboard/operate_logs
pub async fn clear_operate_logs(
    State(state): State<AppState>,
) -> AppResult<Json<serde_json::Value>> {
    let cleared = state.store.clear_operations()?;
    Ok(ok(json!({ "cleared": cleared })))
}
