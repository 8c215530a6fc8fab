//! Export/import of the endpoint inventory
//!
//! Export emits the v2.0 format. Import accepts v2 and the legacy v1
//! payload (which nests tunnels under each endpoint) and is idempotent on
//! `(url, apiPath)`: re-importing the same payload inserts nothing.

use super::{ok, AppState};
use crate::agent::url::TunnelUrl;
use crate::error::{AppError, AppResult};
use crate::model::TunnelType;
use crate::store::{NewEndpoint, TunnelUpsert};
use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

/// GET /api/data/export - v2.0 payload
pub async fn export(State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    let endpoints: Vec<serde_json::Value> = state
        .store
        .list_endpoints()?
        .into_iter()
        .map(|ep| {
            json!({
                "name": ep.name,
                "url": ep.url,
                "apiPath": ep.api_path,
                "apiKey": ep.api_key,
                "color": ep.color,
            })
        })
        .collect();

    Ok(Json(json!({
        "version": "2.0",
        "timestamp": Utc::now().to_rfc3339(),
        "data": { "endpoints": endpoints },
    })))
}

#[derive(Debug, Deserialize)]
pub struct ImportPayload {
    #[serde(default)]
    pub version: Option<String>,
    pub data: ImportData,
}

#[derive(Debug, Deserialize)]
pub struct ImportData {
    #[serde(default)]
    pub endpoints: Vec<ImportEndpoint>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportEndpoint {
    pub name: String,
    pub url: String,
    pub api_path: String,
    pub api_key: String,
    #[serde(default)]
    pub color: Option<String>,
    /// v1 only: tunnels nested under their endpoint
    #[serde(default)]
    pub tunnels: Vec<ImportTunnel>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportTunnel {
    pub name: String,
    #[serde(default, rename = "type")]
    pub tunnel_type: Option<String>,
    /// The tunnel URL (v1 exports call it configLine)
    #[serde(default, alias = "url")]
    pub config_line: Option<String>,
}

/// POST /api/data/import - v1 and v2, idempotent on (url, apiPath)
pub async fn import(
    State(state): State<AppState>,
    Json(payload): Json<ImportPayload>,
) -> AppResult<Json<serde_json::Value>> {
    let version = payload.version.as_deref().unwrap_or("1.0");
    if !matches!(version, "1.0" | "2.0") {
        return Err(AppError::config_invalid(format!(
            "unsupported export version {version:?}"
        )));
    }

    let mut imported_endpoints = 0u64;
    let mut imported_tunnels = 0u64;
    let mut skipped_endpoints = 0u64;

    for entry in &payload.data.endpoints {
        let (endpoint, inserted) = state.store.import_endpoint(&NewEndpoint {
            name: entry.name.clone(),
            url: entry.url.trim_end_matches('/').to_string(),
            api_path: entry.api_path.clone(),
            api_key: entry.api_key.clone(),
            color: entry.color.clone(),
        })?;

        if !inserted {
            // Existing endpoint: skip it and everything nested under it
            skipped_endpoints += 1;
            continue;
        }
        imported_endpoints += 1;

        for tunnel in &entry.tunnels {
            let mut fields = TunnelUpsert {
                name: tunnel.name.clone(),
                tunnel_type: tunnel.tunnel_type.as_deref().and_then(TunnelType::parse),
                ..Default::default()
            };
            if let Some(config_line) = &tunnel.config_line {
                fields.command_line = config_line.clone();
                fields.config_line = config_line.clone();
                if let Ok(parsed) = TunnelUrl::parse(config_line) {
                    fields.tunnel_type = fields.tunnel_type.or(Some(parsed.scheme));
                    fields.tunnel_address = parsed.host.clone();
                    fields.tunnel_port = parsed.port;
                    let primary = parsed.primary_target();
                    fields.target_address = primary.host.clone();
                    fields.target_port = primary.port;
                }
            }
            state.store.insert_local_tunnel(endpoint.id, &fields)?;
            imported_tunnels += 1;
        }

        // New endpoints start supervised right away
        if let Err(e) = state.supervisors.connect(endpoint.id) {
            tracing::warn!(endpoint = endpoint.id, "Post-import connect failed: {}", e);
        }
    }

    tracing::info!(
        imported_endpoints,
        imported_tunnels,
        skipped_endpoints,
        "Import complete"
    );
    Ok(ok(json!({
        "importedEndpoints": imported_endpoints,
        "importedTunnels": imported_tunnels,
        "skippedEndpoints": skipped_endpoints,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentApi;
    use crate::auth::AuthService;
    use crate::config::{AuthConfig, FileLogConfig, HubConfig, SupervisorConfig};
    use crate::filelog::FileLog;
    use crate::hub::FanoutHub;
    use crate::ingest::Ingestor;
    use crate::metrics::Aggregator;
    use crate::query::QuerySurface;
    use crate::store::Store;
    use crate::supervisor::SupervisorManager;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_state() -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        let filelog = Arc::new(
            FileLog::new(FileLogConfig {
                enabled: false,
                base_dir: dir.path().to_path_buf(),
                retention_days: 7,
                cleanup_interval: Duration::from_secs(3600),
                max_records_per_day: 0,
            })
            .unwrap(),
        );
        let hub = FanoutHub::new(16);
        let aggregator = Arc::new(Aggregator::new(store.clone(), Duration::from_secs(75)));
        let ingestor = Arc::new(Ingestor::new(
            store.clone(),
            filelog.clone(),
            hub.clone(),
            aggregator,
        ));
        let agent = AgentApi::new().unwrap();
        let supervisors = Arc::new(SupervisorManager::new(
            store.clone(),
            agent.clone(),
            ingestor,
            SupervisorConfig {
                backoff_base: Duration::from_millis(50),
                ..Default::default()
            },
        ));
        let state = AppState {
            store: store.clone(),
            query: QuerySurface::new(store.clone(), filelog.clone()),
            hub,
            hub_config: HubConfig::default(),
            agent,
            supervisors,
            filelog,
            auth: AuthService::new(store, AuthConfig::default()),
        };
        (state, dir)
    }

    fn v1_payload() -> serde_json::Value {
        // Three endpoints, five tunnels total, v1 shape (no version field)
        json!({
            "data": { "endpoints": [
                {
                    "name": "edge-a", "url": "http://127.0.0.1:1",
                    "apiPath": "/api", "apiKey": "ka",
                    "tunnels": [
                        { "name": "web", "type": "server", "configLine": "server://:10101/127.0.0.1:8080" },
                        { "name": "ssh", "type": "client", "configLine": "client://gw:443/10.0.0.5:22" }
                    ]
                },
                {
                    "name": "edge-b", "url": "http://127.0.0.1:2",
                    "apiPath": "/api", "apiKey": "kb",
                    "tunnels": [
                        { "name": "db", "configLine": "server://:5432/db:5432" },
                        { "name": "cache", "configLine": "server://:6379/cache:6379" }
                    ]
                },
                {
                    "name": "edge-c", "url": "http://127.0.0.1:3",
                    "apiPath": "/api", "apiKey": "kc",
                    "tunnels": [
                        { "name": "mq", "configLine": "server://:5672/mq:5672" }
                    ]
                }
            ]}
        })
    }

    #[tokio::test]
    async fn import_v1_is_idempotent() {
        let (state, _dir) = test_state();
        let payload: ImportPayload = serde_json::from_value(v1_payload()).unwrap();
        let first = import(axum::extract::State(state.clone()), Json(payload))
            .await
            .unwrap();
        let first = &first.0["data"];
        assert_eq!(first["importedEndpoints"], 3);
        assert_eq!(first["importedTunnels"], 5);
        assert_eq!(first["skippedEndpoints"], 0);

        let payload: ImportPayload = serde_json::from_value(v1_payload()).unwrap();
        let second = import(axum::extract::State(state.clone()), Json(payload))
            .await
            .unwrap();
        let second = &second.0["data"];
        assert_eq!(second["importedEndpoints"], 0);
        assert_eq!(second["importedTunnels"], 0);
        assert_eq!(second["skippedEndpoints"], 3);

        // Still exactly three endpoints by (url, apiPath)
        assert_eq!(state.store.list_endpoints().unwrap().len(), 3);
        state.supervisors.shutdown_all();
    }

    #[tokio::test]
    async fn export_then_import_adds_nothing() {
        let (state, _dir) = test_state();
        let payload: ImportPayload = serde_json::from_value(v1_payload()).unwrap();
        import(axum::extract::State(state.clone()), Json(payload))
            .await
            .unwrap();

        let exported = export(axum::extract::State(state.clone())).await.unwrap();
        assert_eq!(exported.0["version"], "2.0");
        let reimport: ImportPayload = serde_json::from_value(exported.0.clone()).unwrap();
        let result = import(axum::extract::State(state.clone()), Json(reimport))
            .await
            .unwrap();
        assert_eq!(result.0["data"]["importedEndpoints"], 0);
        assert_eq!(result.0["data"]["skippedEndpoints"], 3);
        state.supervisors.shutdown_all();
    }

    #[tokio::test]
    async fn unknown_version_is_rejected() {
        let (state, _dir) = test_state();
        let payload: ImportPayload = serde_json::from_value(json!({
            "version": "9.0",
            "data": { "endpoints": [] }
        }))
        .unwrap();
        let err = import(axum::extract::State(state), Json(payload))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ConfigInvalid);
    }
}
