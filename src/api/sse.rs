//! SSE surface: per-tunnel subscription, raw agent passthrough, and the
//! file-log cleanup maintenance endpoints

use super::{ok, AppState};
use crate::agent::EndpointRef;
use crate::error::{AppError, AppResult};
use crate::filelog::FileLogConfigView;
use crate::hub::SubscriptionFilter;
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;

/// GET /api/sse/tunnel/{instanceId} - hub subscription as an SSE stream
///
/// The subscription ends when the client goes away: dropping the response
/// stream drops the [`crate::hub::Subscription`], which unsubscribes.
pub async fn tunnel_stream(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    tracing::debug!(instance = %instance_id, "SSE subscriber connected");
    let subscription = state.hub.subscribe(SubscriptionFilter::Instance(instance_id));

    let stream = futures::stream::unfold(subscription, |mut sub| async move {
        let event = sub.recv().await;
        let json = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Some((Ok(Event::default().data(json)), sub))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(state.hub_config.heartbeat)
            .text("keep-alive"),
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyQuery {
    pub endpoint_id: i64,
}

/// GET /api/sse/nodepass-proxy?endpointId=N - raw byte passthrough of the
/// agent's stream, no ingestion
pub async fn nodepass_proxy(
    State(state): State<AppState>,
    Query(query): Query<ProxyQuery>,
) -> AppResult<Response> {
    let endpoint = state.store.get_endpoint(query.endpoint_id)?;
    let response = state
        .agent
        .sse_passthrough(&EndpointRef::from(&endpoint))
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(AppError::upstream_unavailable(format!(
            "agent answered {}",
            response.status()
        )));
    }

    tracing::debug!(endpoint = endpoint.id, "SSE passthrough opened");
    let body = axum::body::Body::from_stream(response.bytes_stream());
    Ok(Response::builder()
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(body)
        .map_err(|e| AppError::internal(e.to_string()))?
        .into_response())
}

// ─────────────────────────────────────────────────────────────────────────────
// File-log cleanup surface
// ─────────────────────────────────────────────────────────────────────────────

/// GET /api/sse/log-cleanup/stats
pub async fn log_cleanup_stats(State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    let metrics = state.filelog.metrics();
    Ok(ok(json!({
        "lastCleanup": state.filelog.last_cleanup(),
        "linesWritten": metrics.lines_written.load(std::sync::atomic::Ordering::Relaxed),
        "linesDropped": metrics.lines_dropped.load(std::sync::atomic::Ordering::Relaxed),
        "writeErrors": metrics.write_errors.load(std::sync::atomic::Ordering::Relaxed),
    })))
}

/// GET /api/sse/log-cleanup/config
pub async fn log_cleanup_config(
    State(state): State<AppState>,
) -> AppResult<Json<serde_json::Value>> {
    Ok(ok(FileLogConfigView::from(state.filelog.config())))
}

/// POST /api/sse/log-cleanup/trigger - run a pass now
pub async fn log_cleanup_trigger(
    State(state): State<AppState>,
) -> AppResult<Json<serde_json::Value>> {
    let filelog = state.filelog.clone();
    let stats = tokio::task::spawn_blocking(move || filelog.trigger_cleanup())
        .await
        .map_err(|e| AppError::internal(e.to_string()))?
        .map_err(|e| AppError::internal(e.to_string()))?;
    Ok(ok(stats))
}
