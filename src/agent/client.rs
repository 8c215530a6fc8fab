//! HTTP client for the remote agent's management API
//!
//! One pooled `reqwest::Client` is shared process-wide; per-endpoint state
//! is just `(url, api_path, api_key)`. Agents commonly run with self-signed
//! certificates, so certificate verification is disabled by policy for
//! agent traffic. Every request carries `X-API-Key`.

use super::types::{AgentInfo, ControlAction, Instance, TcpingResult};
use crate::error::{AppError, AppResult, ErrorKind};
use crate::model::Endpoint;
use anyhow::{Context, Result};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde_json::json;
use std::time::Duration;

/// Per-call timeout for data queries
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-call timeout for control operations (start/stop/restart, mutation)
const CONTROL_TIMEOUT: Duration = Duration::from_secs(3);

/// Connection facts needed to call one agent
#[derive(Debug, Clone)]
pub struct EndpointRef {
    pub id: i64,
    pub url: String,
    pub api_path: String,
    pub api_key: String,
}

impl From<&Endpoint> for EndpointRef {
    fn from(ep: &Endpoint) -> Self {
        Self {
            id: ep.id,
            url: ep.url.clone(),
            api_path: ep.api_path.clone(),
            api_key: ep.api_key.clone(),
        }
    }
}

impl EndpointRef {
    fn base(&self) -> String {
        format!(
            "{}{}",
            self.url.trim_end_matches('/'),
            self.api_path.trim_end_matches('/')
        )
    }
}

/// Shared client for all agent traffic
#[derive(Clone)]
pub struct AgentApi {
    http: reqwest::Client,
}

impl AgentApi {
    pub fn new() -> Result<Self> {
        // No global timeout: the SSE stream request must stay open
        // indefinitely; REST calls set per-request timeouts instead.
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .pool_max_idle_per_host(10)
            .http1_only()
            .build()
            .context("Failed to create agent HTTP client")?;
        Ok(Self { http })
    }

    fn request(&self, ep: &EndpointRef, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", ep.base(), path))
            .header("X-API-Key", &ep.api_key)
    }

    /// GET /instances
    pub async fn get_instances(&self, ep: &EndpointRef) -> AppResult<Vec<Instance>> {
        let resp = self
            .request(ep, Method::GET, "/instances")
            .timeout(QUERY_TIMEOUT)
            .send()
            .await?;
        let resp = check_status(resp)?;
        Ok(resp.json().await?)
    }

    /// GET /instances/{id}
    pub async fn get_instance(&self, ep: &EndpointRef, instance_id: &str) -> AppResult<Instance> {
        let resp = self
            .request(ep, Method::GET, &format!("/instances/{instance_id}"))
            .timeout(QUERY_TIMEOUT)
            .send()
            .await?;
        let resp = check_status(resp)?;
        Ok(resp.json().await?)
    }

    /// POST /instances - create from a tunnel URL
    pub async fn create_instance(&self, ep: &EndpointRef, url: &str) -> AppResult<Instance> {
        let resp = self
            .request(ep, Method::POST, "/instances")
            .timeout(CONTROL_TIMEOUT)
            .json(&json!({ "url": url }))
            .send()
            .await?;
        let resp = check_status(resp)?;
        Ok(resp.json().await?)
    }

    /// PUT /instances/{id} - replace the instance's configuration in place.
    ///
    /// Older agents answer 404 or 405 here; that surfaces as
    /// [`ErrorKind::UpstreamUnsupported`] (detected by status code only)
    /// and the caller falls back to delete+recreate.
    pub async fn update_instance(
        &self,
        ep: &EndpointRef,
        instance_id: &str,
        command_line: &str,
    ) -> AppResult<Instance> {
        let resp = self
            .request(ep, Method::PUT, &format!("/instances/{instance_id}"))
            .timeout(CONTROL_TIMEOUT)
            .json(&json!({ "url": command_line }))
            .send()
            .await?;
        if matches!(
            resp.status(),
            StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED
        ) {
            return Err(AppError::new(
                ErrorKind::UpstreamUnsupported,
                "agent does not support in-place instance update",
            ));
        }
        let resp = check_status(resp)?;
        Ok(resp.json().await?)
    }

    /// PATCH /instances/{id} - update the peer address
    pub async fn update_instance_peers(
        &self,
        ep: &EndpointRef,
        instance_id: &str,
        peer: &str,
    ) -> AppResult<Instance> {
        let resp = self
            .request(ep, Method::PATCH, &format!("/instances/{instance_id}"))
            .timeout(CONTROL_TIMEOUT)
            .json(&json!({ "action": "peer", "value": peer }))
            .send()
            .await?;
        let resp = check_status(resp)?;
        Ok(resp.json().await?)
    }

    /// PATCH /instances/{id} - replace the tag map
    pub async fn update_instance_tags(
        &self,
        ep: &EndpointRef,
        instance_id: &str,
        tags: &std::collections::HashMap<String, String>,
    ) -> AppResult<Instance> {
        let resp = self
            .request(ep, Method::PATCH, &format!("/instances/{instance_id}"))
            .timeout(CONTROL_TIMEOUT)
            .json(&json!({ "action": "tags", "value": tags }))
            .send()
            .await?;
        let resp = check_status(resp)?;
        Ok(resp.json().await?)
    }

    /// POST /instances/{id}/control with {action}
    pub async fn control_instance(
        &self,
        ep: &EndpointRef,
        instance_id: &str,
        action: ControlAction,
    ) -> AppResult<Instance> {
        let resp = self
            .request(ep, Method::POST, &format!("/instances/{instance_id}/control"))
            .timeout(CONTROL_TIMEOUT)
            .json(&json!({ "action": action.as_str() }))
            .send()
            .await?;
        let resp = check_status(resp)?;
        Ok(resp.json().await?)
    }

    /// DELETE /instances/{id}
    pub async fn delete_instance(&self, ep: &EndpointRef, instance_id: &str) -> AppResult<()> {
        let resp = self
            .request(ep, Method::DELETE, &format!("/instances/{instance_id}"))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await?;
        check_status(resp)?;
        Ok(())
    }

    /// GET /tcping?target=host:port - reachability probe from the agent
    pub async fn tcping(&self, ep: &EndpointRef, target: &str) -> AppResult<TcpingResult> {
        let resp = self
            .request(ep, Method::GET, "/tcping")
            .query(&[("target", target)])
            .timeout(QUERY_TIMEOUT)
            .send()
            .await?;
        let resp = check_status(resp)?;
        Ok(resp.json().await?)
    }

    /// GET /info - agent metadata (hostname, version)
    pub async fn get_info(&self, ep: &EndpointRef) -> AppResult<AgentInfo> {
        let resp = self
            .request(ep, Method::GET, "/info")
            .timeout(QUERY_TIMEOUT)
            .send()
            .await?;
        let resp = check_status(resp)?;
        Ok(resp.json().await?)
    }

    /// Build (but do not send) the long-lived SSE stream request.
    ///
    /// No timeout: the stream is unbounded; the supervisor enforces its own
    /// per-frame idle deadline.
    pub fn sse_request(&self, ep: &EndpointRef) -> RequestBuilder {
        self.request(ep, Method::GET, "/events")
            .header("Accept", "text/event-stream")
    }

    /// Raw GET of the SSE stream for the proxy passthrough route
    pub fn sse_passthrough(&self, ep: &EndpointRef) -> RequestBuilder {
        self.sse_request(ep)
    }
}

/// Map an agent response status to the error taxonomy
fn check_status(resp: Response) -> AppResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let kind = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorKind::Unauthorized,
        StatusCode::NOT_FOUND => ErrorKind::NotFound,
        StatusCode::CONFLICT => ErrorKind::Conflict,
        s if s.is_server_error() => ErrorKind::UpstreamUnavailable,
        _ => ErrorKind::UpstreamProtocol,
    };
    Err(AppError::new(kind, format!("agent answered {status}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_joins_without_double_slash() {
        let ep = EndpointRef {
            id: 1,
            url: "https://10.0.0.2:3000/".into(),
            api_path: "/api/v1/".into(),
            api_key: "k".into(),
        };
        assert_eq!(ep.base(), "https://10.0.0.2:3000/api/v1");
    }
}
