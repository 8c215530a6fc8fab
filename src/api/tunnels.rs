//! Tunnel endpoints: list/details/CRUD/control, trends, logs, recycle

use super::{ok, ok_empty, AppState};
use crate::agent::url::{HostPort, TunnelUrl};
use crate::agent::{ControlAction, EndpointRef};
use crate::error::{AppError, AppResult, ErrorKind};
use crate::model::{OperationStatus, TlsMode, TunnelStatus, TunnelType};
use crate::store::{TunnelQueryParams, TunnelUpsert};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;

// ─────────────────────────────────────────────────────────────────────────────
// List / details
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub search: Option<String>,
    pub status: Option<String>,
    pub endpoint_id: Option<i64>,
    pub port: Option<u16>,
    pub group: Option<String>,
    pub sort_by: Option<String>,
    pub sort_desc: Option<bool>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

/// GET /api/tunnels
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<serde_json::Value>> {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(s) => Some(
            TunnelStatus::parse(s)
                .ok_or_else(|| AppError::config_invalid(format!("unknown status {s:?}")))?,
        ),
    };
    let result = state.query.list_tunnels(&TunnelQueryParams {
        search: query.search.filter(|s| !s.is_empty()),
        status,
        endpoint_id: query.endpoint_id,
        port: query.port,
        group: query.group.filter(|s| !s.is_empty()),
        sort_by: query.sort_by,
        sort_desc: query.sort_desc.unwrap_or(false),
        page: query.page.unwrap_or(1),
        page_size: query.page_size.unwrap_or(0),
    })?;
    Ok(ok(result))
}

/// GET /api/tunnels/{instanceId}[/details]
pub async fn details(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    Ok(ok(state.query.tunnel_details(&instance_id)?))
}

// ─────────────────────────────────────────────────────────────────────────────
// Create / update / delete / control
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelBody {
    pub endpoint_id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub tunnel_type: String,
    #[serde(default)]
    pub tunnel_address: String,
    pub tunnel_port: u16,
    pub target_address: String,
    pub target_port: u16,
    #[serde(default)]
    pub extend_target_address: Vec<String>,
    pub tls_mode: Option<String>,
    pub log_level: Option<String>,
    pub password: Option<String>,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub no_tcp: Option<bool>,
    pub no_udp: Option<bool>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl TunnelBody {
    /// Assemble the canonical tunnel URL the agent will run
    fn to_url(&self) -> AppResult<TunnelUrl> {
        let scheme = TunnelType::parse(&self.tunnel_type)
            .ok_or_else(|| AppError::config_invalid("type must be server or client"))?;
        let mut targets = vec![HostPort {
            host: self.target_address.clone(),
            port: self.target_port,
        }];
        for extra in &self.extend_target_address {
            let (host, port) = extra
                .rsplit_once(':')
                .and_then(|(h, p)| p.parse().ok().map(|p| (h.to_string(), p)))
                .ok_or_else(|| {
                    AppError::config_invalid(format!("bad extend target {extra:?}"))
                })?;
            targets.push(HostPort { host, port });
        }
        let tls = match self.tls_mode.as_deref() {
            None | Some("") | Some("inherit") => None,
            Some(v) => Some(
                TlsMode::from_query_value(v)
                    .ok_or_else(|| AppError::config_invalid("tlsMode must be 0, 1 or 2"))?,
            ),
        };
        Ok(TunnelUrl {
            scheme,
            password: self.password.clone().filter(|p| !p.is_empty()),
            host: self.tunnel_address.clone(),
            port: self.tunnel_port,
            targets,
            tls,
            log: self.log_level.clone().filter(|l| !l.is_empty()),
            mode: None,
            cert: self.cert_path.clone().filter(|c| !c.is_empty()),
            key: self.key_path.clone().filter(|k| !k.is_empty()),
            min: self.min,
            max: self.max,
            no_tcp: self.no_tcp.unwrap_or(false),
            no_udp: self.no_udp.unwrap_or(false),
        })
    }
}

/// POST /api/tunnels - create the instance on its agent, then materialise
pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<TunnelBody>,
) -> AppResult<Json<serde_json::Value>> {
    let endpoint = state.store.get_endpoint(body.endpoint_id)?;
    let url = body.to_url()?.build();

    let created = state
        .agent
        .create_instance(&EndpointRef::from(&endpoint), &url)
        .await;

    let instance = match created {
        Ok(instance) => instance,
        Err(e) => {
            let _ = state.store.append_operation(
                "create",
                &body.name,
                OperationStatus::Failed,
                Some(&e.to_string()),
            );
            return Err(e);
        }
    };

    let mut fields = upsert_from_body(&body, &url);
    fields.name = body.name.clone();
    let tunnel = state
        .store
        .upsert_tunnel_by_instance(endpoint.id, &instance.id, &fields)?;
    state
        .store
        .append_operation("create", &tunnel.name, OperationStatus::Success, None)?;
    Ok(ok(tunnel))
}

/// PUT /api/tunnels/{instanceId} - in-place update, or delete+recreate when
/// the agent does not support it (decided by status code, never by message)
pub async fn update(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Json(body): Json<TunnelBody>,
) -> AppResult<Json<serde_json::Value>> {
    let existing = state.store.get_tunnel_by_instance(&instance_id)?;
    let endpoint = state.store.get_endpoint(existing.endpoint_id)?;
    let ep_ref = EndpointRef::from(&endpoint);
    let url = body.to_url()?.build();

    let (final_instance_id, fallback_used) = match state
        .agent
        .update_instance(&ep_ref, &instance_id, &url)
        .await
    {
        Ok(instance) => (instance.id, false),
        Err(e) if e.kind == ErrorKind::UpstreamUnsupported => {
            tracing::info!(
                instance = %instance_id,
                "Agent lacks in-place update; falling back to delete+recreate"
            );
            state.agent.delete_instance(&ep_ref, &instance_id).await?;
            let recreated = state.agent.create_instance(&ep_ref, &url).await?;
            (recreated.id, true)
        }
        Err(e) => {
            let _ = state.store.append_operation(
                "update",
                &existing.name,
                OperationStatus::Failed,
                Some(&e.to_string()),
            );
            return Err(e);
        }
    };

    if fallback_used && final_instance_id != instance_id {
        // The old row is gone on the agent; rebind ours to the new instance
        state
            .store
            .delete_tunnel_by_instance(endpoint.id, &instance_id)?;
    }

    let mut fields = upsert_from_body(&body, &url);
    fields.name = body.name.clone();
    let tunnel = state
        .store
        .upsert_tunnel_by_instance(endpoint.id, &final_instance_id, &fields)?;
    state
        .store
        .append_operation("update", &tunnel.name, OperationStatus::Success, None)?;
    Ok(ok(tunnel))
}

/// DELETE /api/tunnels/{instanceId}
pub async fn destroy(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let tunnel = state.store.get_tunnel_by_instance(&instance_id)?;
    let endpoint = state.store.get_endpoint(tunnel.endpoint_id)?;

    state
        .agent
        .delete_instance(&EndpointRef::from(&endpoint), &instance_id)
        .await?;
    state
        .store
        .delete_tunnel_by_instance(endpoint.id, &instance_id)?;
    state
        .store
        .append_operation("delete", &tunnel.name, OperationStatus::Success, None)?;
    Ok(ok_empty())
}

#[derive(Debug, Deserialize)]
pub struct ControlBody {
    pub action: String,
}

/// POST /api/tunnels/{instanceId}/control
pub async fn control(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Json(body): Json<ControlBody>,
) -> AppResult<Json<serde_json::Value>> {
    let action = ControlAction::parse(&body.action)
        .ok_or_else(|| AppError::config_invalid(format!("unknown action {:?}", body.action)))?;
    let tunnel = state.store.get_tunnel_by_instance(&instance_id)?;
    let endpoint = state.store.get_endpoint(tunnel.endpoint_id)?;

    let result = state
        .agent
        .control_instance(&EndpointRef::from(&endpoint), &instance_id, action)
        .await;
    let (status, message) = match &result {
        Ok(_) => (OperationStatus::Success, None),
        Err(e) => (OperationStatus::Failed, Some(e.to_string())),
    };
    state
        .store
        .append_operation(action.as_str(), &tunnel.name, status, message.as_deref())?;
    let instance = result?;
    Ok(ok(instance))
}

#[derive(Debug, Deserialize)]
pub struct TagsBody {
    pub tags: HashMap<String, String>,
    pub alias: Option<String>,
    pub sorts: Option<i64>,
}

/// POST /api/tunnels/{instanceId}/tags - push tags to the agent and mirror
/// them (plus local-only fields) into the row
pub async fn set_tags(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Json(body): Json<TagsBody>,
) -> AppResult<Json<serde_json::Value>> {
    let tunnel = state.store.get_tunnel_by_instance(&instance_id)?;
    let endpoint = state.store.get_endpoint(tunnel.endpoint_id)?;
    state
        .agent
        .update_instance_tags(&EndpointRef::from(&endpoint), &instance_id, &body.tags)
        .await?;
    let tunnel = state.store.update_tunnel_local_fields(
        tunnel.id,
        body.alias.as_deref(),
        body.sorts,
        Some(&body.tags),
    )?;
    Ok(ok(tunnel))
}

#[derive(Debug, Deserialize)]
pub struct PeerBody {
    pub peer: String,
}

/// POST /api/tunnels/{instanceId}/peer - update the instance's peer address
pub async fn set_peer(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Json(body): Json<PeerBody>,
) -> AppResult<Json<serde_json::Value>> {
    let tunnel = state.store.get_tunnel_by_instance(&instance_id)?;
    let endpoint = state.store.get_endpoint(tunnel.endpoint_id)?;
    let instance = state
        .agent
        .update_instance_peers(&EndpointRef::from(&endpoint), &instance_id, &body.peer)
        .await?;
    Ok(ok(instance))
}

// ─────────────────────────────────────────────────────────────────────────────
// Batch
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchBody {
    /// start | stop | restart | delete
    pub action: String,
    pub instance_ids: Vec<String>,
}

/// POST /api/tunnels/batch - per-item outcomes, 206 on partial success
pub async fn batch(
    State(state): State<AppState>,
    Json(body): Json<BatchBody>,
) -> AppResult<impl IntoResponse> {
    let mut results = Vec::with_capacity(body.instance_ids.len());
    let mut fail_count = 0usize;

    for instance_id in &body.instance_ids {
        let outcome = batch_one(&state, &body.action, instance_id).await;
        match outcome {
            Ok(()) => results.push(json!({ "instanceId": instance_id, "success": true })),
            Err(e) => {
                fail_count += 1;
                results.push(json!({
                    "instanceId": instance_id,
                    "success": false,
                    "error": e.to_string(),
                }));
            }
        }
    }

    let operated = body.instance_ids.len() - fail_count;
    let status = if fail_count == 0 {
        StatusCode::OK
    } else if operated > 0 {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    Ok((
        status,
        Json(json!({
            "success": fail_count == 0,
            "operated": operated,
            "failCount": fail_count,
            "results": results,
        })),
    ))
}

async fn batch_one(state: &AppState, action: &str, instance_id: &str) -> AppResult<()> {
    let tunnel = state.store.get_tunnel_by_instance(instance_id)?;
    let endpoint = state.store.get_endpoint(tunnel.endpoint_id)?;
    let ep_ref = EndpointRef::from(&endpoint);

    match action {
        "delete" => {
            state.agent.delete_instance(&ep_ref, instance_id).await?;
            state
                .store
                .delete_tunnel_by_instance(endpoint.id, instance_id)?;
        }
        other => {
            let parsed = ControlAction::parse(other)
                .ok_or_else(|| AppError::config_invalid(format!("unknown action {other:?}")))?;
            state
                .agent
                .control_instance(&ep_ref, instance_id, parsed)
                .await?;
        }
    }
    state
        .store
        .append_operation(action, &tunnel.name, OperationStatus::Success, None)?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Trends / logs / tcping
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct TrendQueryParams {
    pub hours: Option<u32>,
}

/// GET /api/tunnels/{instanceId}/metrics-trend - all five series
pub async fn metrics_trend(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Query(query): Query<TrendQueryParams>,
) -> AppResult<Json<serde_json::Value>> {
    let series = state.query.trend(&instance_id, query.hours.unwrap_or(24))?;
    Ok(ok(series))
}

/// GET /api/tunnels/{instanceId}/traffic-trend
pub async fn traffic_trend(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Query(query): Query<TrendQueryParams>,
) -> AppResult<Json<serde_json::Value>> {
    let series = state.query.trend(&instance_id, query.hours.unwrap_or(24))?;
    Ok(ok(json!({
        "createdAt": series.created_at,
        "traffic": series.traffic,
        "speedIn": series.speed_in,
        "speedOut": series.speed_out,
    })))
}

/// GET /api/tunnels/{instanceId}/ping-trend
pub async fn ping_trend(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Query(query): Query<TrendQueryParams>,
) -> AppResult<Json<serde_json::Value>> {
    let series = state.query.trend(&instance_id, query.hours.unwrap_or(24))?;
    Ok(ok(json!({
        "createdAt": series.created_at,
        "ping": series.ping,
    })))
}

/// GET /api/tunnels/{instanceId}/pool-trend
pub async fn pool_trend(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Query(query): Query<TrendQueryParams>,
) -> AppResult<Json<serde_json::Value>> {
    let series = state.query.trend(&instance_id, query.hours.unwrap_or(24))?;
    Ok(ok(json!({
        "createdAt": series.created_at,
        "pool": series.pool,
    })))
}

#[derive(Debug, Deserialize)]
pub struct FileLogQuery {
    /// YYYY-MM-DD; today when absent
    pub date: Option<String>,
    pub limit: Option<usize>,
}

/// GET /api/tunnels/{instanceId}/file-logs
pub async fn file_logs(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Query(query): Query<FileLogQuery>,
) -> AppResult<Json<serde_json::Value>> {
    let tunnel = state.store.get_tunnel_by_instance(&instance_id)?;
    let date = match query.date.as_deref() {
        Some(s) => chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map_err(|_| AppError::config_invalid("date must be YYYY-MM-DD"))?,
        None => Utc::now().date_naive(),
    };
    let page = state.query.logs_by_date(
        tunnel.endpoint_id,
        &instance_id,
        date,
        query.limit.unwrap_or(500),
    )?;
    Ok(ok(page))
}

#[derive(Debug, Deserialize)]
pub struct TcpingQuery {
    pub target: Option<String>,
}

/// GET /api/tunnels/{instanceId}/tcping - probe from the owning agent
pub async fn tcping(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Query(query): Query<TcpingQuery>,
) -> AppResult<Json<serde_json::Value>> {
    let tunnel = state.store.get_tunnel_by_instance(&instance_id)?;
    let endpoint = state.store.get_endpoint(tunnel.endpoint_id)?;
    let target = query
        .target
        .unwrap_or_else(|| format!("{}:{}", tunnel.target_address, tunnel.target_port));
    let result = state
        .agent
        .tcping(&EndpointRef::from(&endpoint), &target)
        .await?;
    Ok(ok(result))
}

// ─────────────────────────────────────────────────────────────────────────────
// Recycle
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecycleQuery {
    pub endpoint_id: Option<i64>,
}

/// GET /api/tunnels/recycle/list
pub async fn recycle_list(
    State(state): State<AppState>,
    Query(query): Query<RecycleQuery>,
) -> AppResult<Json<serde_json::Value>> {
    let entries = match query.endpoint_id {
        Some(endpoint_id) => state.store.list_recycle(endpoint_id)?,
        None => state.store.list_all_recycle()?,
    };
    Ok(ok(entries))
}

/// POST /api/tunnels/recycle/{id}/restore - recreate on the original agent
pub async fn recycle_restore(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    let entry = state.store.get_recycle(id)?;
    let endpoint = state.store.get_endpoint(entry.endpoint_id)?;

    let instance = state
        .agent
        .create_instance(&EndpointRef::from(&endpoint), &entry.config_line)
        .await?;

    let mut fields = TunnelUpsert {
        name: entry.name.clone(),
        tunnel_type: Some(entry.tunnel_type),
        command_line: entry.command_line.clone(),
        config_line: entry.config_line.clone(),
        tags: Some(entry.tags.clone()),
        ..Default::default()
    };
    if let Ok(parsed) = TunnelUrl::parse(&entry.config_line) {
        fields.tunnel_address = parsed.host.clone();
        fields.tunnel_port = parsed.port;
        let primary = parsed.primary_target();
        fields.target_address = primary.host.clone();
        fields.target_port = primary.port;
    }
    let tunnel = state
        .store
        .upsert_tunnel_by_instance(endpoint.id, &instance.id, &fields)?;
    state.store.delete_recycle(id)?;
    state
        .store
        .append_operation("restore", &tunnel.name, OperationStatus::Success, None)?;
    Ok(ok(tunnel))
}

/// DELETE /api/tunnels/recycle/{id}
pub async fn recycle_delete(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    state.store.delete_recycle(id)?;
    Ok(ok_empty())
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn upsert_from_body(body: &TunnelBody, url: &str) -> TunnelUpsert {
    TunnelUpsert {
        name: body.name.clone(),
        tunnel_type: TunnelType::parse(&body.tunnel_type),
        status: Some(TunnelStatus::Stopped),
        tunnel_address: body.tunnel_address.clone(),
        tunnel_port: body.tunnel_port,
        target_address: body.target_address.clone(),
        target_port: body.target_port,
        extend_target_address: body.extend_target_address.clone(),
        tls_mode: body
            .tls_mode
            .as_deref()
            .and_then(TlsMode::parse)
            .or(Some(TlsMode::Inherit)),
        log_level: body.log_level.clone(),
        password: body.password.clone(),
        cert_path: body.cert_path.clone(),
        key_path: body.key_path.clone(),
        min: body.min,
        max: body.max,
        command_line: url.to_string(),
        config_line: url.to_string(),
        tags: if body.tags.is_empty() {
            None
        } else {
            Some(body.tags.clone())
        },
        ..Default::default()
    }
}
