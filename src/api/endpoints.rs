//! Endpoint CRUD, connect/disconnect, and instance passthrough

use super::{ok, ok_empty, AppState};
use crate::agent::{ControlAction, EndpointRef};
use crate::error::{AppError, AppResult};
use crate::store::NewEndpoint;
use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointBody {
    pub name: String,
    pub url: String,
    pub api_path: String,
    pub api_key: String,
    pub color: Option<String>,
}

/// GET /api/endpoints
pub async fn list(State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    let endpoints = state.store.list_endpoints()?;
    Ok(ok(endpoints))
}

/// POST /api/endpoints - register and start supervising
pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<EndpointBody>,
) -> AppResult<Json<serde_json::Value>> {
    if body.url.trim().is_empty() || !body.api_path.starts_with('/') {
        return Err(AppError::config_invalid(
            "url must be non-empty and apiPath must start with '/'",
        ));
    }
    let endpoint = state.store.insert_endpoint(&NewEndpoint {
        name: body.name,
        url: body.url.trim_end_matches('/').to_string(),
        api_path: body.api_path,
        api_key: body.api_key,
        color: body.color,
    })?;
    state.supervisors.connect(endpoint.id)?;
    Ok(ok(endpoint))
}

/// PUT /api/endpoints/{id} - update and resupervise with fresh credentials
pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<EndpointBody>,
) -> AppResult<Json<serde_json::Value>> {
    let endpoint = state.store.update_endpoint(
        id,
        &body.name,
        body.url.trim_end_matches('/'),
        &body.api_path,
        &body.api_key,
        body.color.as_deref(),
    )?;
    // Restart the stream unless the operator had it disconnected
    if !state.supervisors.is_manually_disconnected(id) {
        state.supervisors.remove(id);
        state.supervisors.connect(id)?;
    }
    Ok(ok(endpoint))
}

/// DELETE /api/endpoints/{id} - cascades rows and removes the log directory
pub async fn destroy(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    state.supervisors.remove(id);
    let endpoint = state.store.delete_endpoint(id)?;
    if let Err(e) = state.filelog.clear_endpoint(id) {
        tracing::warn!(endpoint = id, "Log directory removal failed: {}", e);
    }
    tracing::info!(endpoint = id, name = %endpoint.name, "Endpoint destroyed");
    Ok(ok_empty())
}

/// POST /api/endpoints/{id}/connect - clear the sticky flag and reconnect
pub async fn connect(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    state.supervisors.connect(id)?;
    Ok(ok_empty())
}

/// POST /api/endpoints/{id}/disconnect - sticky manual disconnect
pub async fn disconnect(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    // 404 for unknown ids, like every other endpoint route
    state.store.get_endpoint(id)?;
    state.supervisors.disconnect(id)?;
    Ok(ok_empty())
}

/// GET /api/endpoints/{id}/info - agent metadata probe
pub async fn info(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    let endpoint = state.store.get_endpoint(id)?;
    let info = state.agent.get_info(&EndpointRef::from(&endpoint)).await?;
    Ok(ok(info))
}

/// GET /api/endpoints/{id}/instances - live list from the agent
pub async fn instances(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    let endpoint = state.store.get_endpoint(id)?;
    let instances = state.agent.get_instances(&EndpointRef::from(&endpoint)).await?;
    Ok(ok(instances))
}

/// GET /api/endpoints/{id}/instances/{instanceId}
pub async fn instance(
    State(state): State<AppState>,
    Path((id, instance_id)): Path<(i64, String)>,
) -> AppResult<Json<serde_json::Value>> {
    let endpoint = state.store.get_endpoint(id)?;
    let instance = state
        .agent
        .get_instance(&EndpointRef::from(&endpoint), &instance_id)
        .await?;
    Ok(ok(instance))
}

#[derive(Debug, Deserialize)]
pub struct ControlBody {
    pub action: String,
}

/// POST /api/endpoints/{id}/instances/{instanceId}/control
pub async fn control_instance(
    State(state): State<AppState>,
    Path((id, instance_id)): Path<(i64, String)>,
    Json(body): Json<ControlBody>,
) -> AppResult<Json<serde_json::Value>> {
    let action = ControlAction::parse(&body.action)
        .ok_or_else(|| AppError::config_invalid(format!("unknown action {:?}", body.action)))?;
    let endpoint = state.store.get_endpoint(id)?;
    let instance = state
        .agent
        .control_instance(&EndpointRef::from(&endpoint), &instance_id, action)
        .await?;
    Ok(ok(json!({ "instance": instance, "action": action })))
}
