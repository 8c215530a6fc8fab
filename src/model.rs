//! Core entity types persisted by the store
//!
//! These are the typed rows behind the control plane: endpoints (remote
//! agents), tunnels (forwarding rules an agent manages), raw SSE event
//! records, per-minute metric rows, the operation log, and recycle
//! snapshots. Field names serialize in camelCase because the browser UI
//! consumes them as-is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ─────────────────────────────────────────────────────────────────────────────
// Endpoint
// ─────────────────────────────────────────────────────────────────────────────

/// Connection status of a remote agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    /// Stream established, frames flowing
    Online,
    /// No frames within the health window, or agent announced shutdown
    Offline,
    /// Authentication/config error; reconnects suspended until operator fixes it
    Fail,
    /// Operator asked us to stay away
    Disconnect,
}

impl EndpointStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EndpointStatus::Online => "online",
            EndpointStatus::Offline => "offline",
            EndpointStatus::Fail => "fail",
            EndpointStatus::Disconnect => "disconnect",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(EndpointStatus::Online),
            "offline" => Some(EndpointStatus::Offline),
            "fail" => Some(EndpointStatus::Fail),
            "disconnect" => Some(EndpointStatus::Disconnect),
            _ => None,
        }
    }
}

impl fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remote tunnel-management agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub id: i64,
    pub name: String,
    /// Base URL, e.g. `https://10.0.0.2:3000`
    pub url: String,
    /// API prefix on the agent, e.g. `/api/v1`
    pub api_path: String,
    pub api_key: String,
    /// Hostname reported by the agent (from the initial frame)
    pub hostname: Option<String>,
    pub status: EndpointStatus,
    /// Denormalised cache; authoritative value is count(tunnels)
    pub tunnel_count: i64,
    /// Agent software version, if reported
    pub version: Option<String>,
    /// Agent-side TLS mode, if reported
    pub tls: Option<String>,
    /// Agent-side log level, if reported
    pub log: Option<String>,
    /// UI display color tag, carried through export/import
    pub color: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Last time the supervisor updated the status
    pub last_check: Option<DateTime<Utc>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tunnel
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle status of a tunnel instance, as last reported by its agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    Running,
    Stopped,
    Error,
    /// The owning endpoint is unreachable; real state unknown
    Offline,
}

impl TunnelStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TunnelStatus::Running => "running",
            TunnelStatus::Stopped => "stopped",
            TunnelStatus::Error => "error",
            TunnelStatus::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(TunnelStatus::Running),
            "stopped" => Some(TunnelStatus::Stopped),
            "error" => Some(TunnelStatus::Error),
            "offline" => Some(TunnelStatus::Offline),
            _ => None,
        }
    }
}

/// Direction of a forwarding rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelType {
    /// Listens and forwards inbound connections
    Server,
    /// Dials out to a server-side tunnel
    Client,
}

impl TunnelType {
    pub fn as_str(self) -> &'static str {
        match self {
            TunnelType::Server => "server",
            TunnelType::Client => "client",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "server" => Some(TunnelType::Server),
            "client" => Some(TunnelType::Client),
            _ => None,
        }
    }
}

/// TLS requirement for a tunnel's data path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Use the endpoint's global setting
    Inherit,
    /// 0: plaintext
    Off,
    /// 1: TLS with self-signed cert
    SelfSigned,
    /// 2: TLS with provided cert/key
    Custom,
}

impl TlsMode {
    pub fn as_query_value(self) -> Option<&'static str> {
        match self {
            TlsMode::Inherit => None,
            TlsMode::Off => Some("0"),
            TlsMode::SelfSigned => Some("1"),
            TlsMode::Custom => Some("2"),
        }
    }

    pub fn from_query_value(v: &str) -> Option<Self> {
        match v {
            "0" => Some(TlsMode::Off),
            "1" => Some(TlsMode::SelfSigned),
            "2" => Some(TlsMode::Custom),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TlsMode::Inherit => "inherit",
            TlsMode::Off => "0",
            TlsMode::SelfSigned => "1",
            TlsMode::Custom => "2",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inherit" | "" => Some(TlsMode::Inherit),
            other => Self::from_query_value(other),
        }
    }
}

/// Which transports the tunnel accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ListenType {
    Tcp,
    Udp,
    All,
}

impl ListenType {
    pub fn as_str(self) -> &'static str {
        match self {
            ListenType::Tcp => "TCP",
            ListenType::Udp => "UDP",
            ListenType::All => "ALL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TCP" => Some(ListenType::Tcp),
            "UDP" => Some(ListenType::Udp),
            "ALL" => Some(ListenType::All),
            _ => None,
        }
    }
}

/// A forwarding rule managed by an endpoint
///
/// `instance_id` is the agent's opaque identifier; it is null for tunnels we
/// created locally that have not yet been bound to an agent instance. The
/// four traffic counters are monotonic from the agent's perspective; downward
/// steps are treated as resets by the ingestor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tunnel {
    pub id: i64,
    pub endpoint_id: i64,
    pub instance_id: Option<String>,
    pub name: String,
    /// Operator-assigned display alias (agent-side `alias` field)
    pub alias: Option<String>,
    #[serde(rename = "type")]
    pub tunnel_type: TunnelType,
    pub status: TunnelStatus,
    pub tunnel_address: String,
    pub tunnel_port: u16,
    pub target_address: String,
    pub target_port: u16,
    /// Extra load-balanced target addresses beyond the primary
    #[serde(default)]
    pub extend_target_address: Vec<String>,
    pub tls_mode: TlsMode,
    pub log_level: String,
    pub password: Option<String>,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub slot: Option<i64>,
    /// Connection pool depth last reported
    pub pool: Option<i64>,
    /// Last reported latency (ms)
    pub ping: Option<i64>,
    pub mode: Option<i64>,
    pub restart: bool,
    pub listen_type: ListenType,
    /// Full command line the agent runs
    pub command_line: String,
    /// Canonical tunnel URL (see the url module)
    pub config_line: String,
    /// Manual sort weight for the UI list
    pub sorts: i64,
    pub tcps: Option<i64>,
    pub udps: Option<i64>,
    pub tcp_rx: i64,
    pub tcp_tx: i64,
    pub udp_rx: i64,
    pub udp_tx: i64,
    pub peer: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tunnel {
    /// Tag key that requests a recycle snapshot before deletion
    pub const TAG_PRESERVE: &'static str = "preserve";

    pub fn wants_recycle(&self) -> bool {
        self.tags
            .get(Self::TAG_PRESERVE)
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SSE event row (raw buffer)
// ─────────────────────────────────────────────────────────────────────────────

/// One persisted telemetry event, bounded by the retention window
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SseEventRow {
    pub id: i64,
    pub endpoint_id: i64,
    pub instance_id: Option<String>,
    /// initial | create | update | delete | log | shutdown
    pub event_type: String,
    pub push_type: Option<String>,
    pub event_time: DateTime<Utc>,
    pub logs: Option<String>,
    pub tcp_rx: Option<i64>,
    pub tcp_tx: Option<i64>,
    pub udp_rx: Option<i64>,
    pub udp_tx: Option<i64>,
    pub pool: Option<i64>,
    pub ping: Option<i64>,
    pub tcps: Option<i64>,
    pub udps: Option<i64>,
    pub alias: Option<String>,
    pub restart: Option<bool>,
    /// Original frame JSON, for debugging and the proxy passthrough
    pub raw: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Service history (minute row)
// ─────────────────────────────────────────────────────────────────────────────

/// One aggregated minute for one tunnel instance
///
/// A missing minute means "no sample observed"; the trend query fills zeros.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHistoryRow {
    pub instance_id: String,
    /// Truncated to the minute, UTC
    pub record_time: DateTime<Utc>,
    pub avg_ping: f64,
    pub avg_pool: f64,
    pub delta_tcp_in: i64,
    pub delta_tcp_out: i64,
    pub delta_udp_in: i64,
    pub delta_udp_out: i64,
    /// Bytes per second averaged over the minute
    pub avg_speed_in: f64,
    pub avg_speed_out: f64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Operation log
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Success,
    Failed,
    Pending,
}

impl OperationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationStatus::Success => "success",
            OperationStatus::Failed => "failed",
            OperationStatus::Pending => "pending",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(OperationStatus::Success),
            "failed" => Some(OperationStatus::Failed),
            "pending" => Some(OperationStatus::Pending),
            _ => None,
        }
    }
}

/// Append-only audit row for dashboard display
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationLogRow {
    pub id: i64,
    /// e.g. "create", "delete", "start", "stop", "restart"
    pub action: String,
    pub tunnel_name: String,
    pub status: OperationStatus,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Recycle
// ─────────────────────────────────────────────────────────────────────────────

/// Snapshot of a tunnel captured at soft-deletion
///
/// Carries everything needed to recreate the instance on its endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecycleEntry {
    pub id: i64,
    pub endpoint_id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub tunnel_type: TunnelType,
    pub config_line: String,
    pub command_line: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    pub deleted_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// An authenticated browser session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRow {
    pub session_id: String,
    pub username: String,
    pub expires_at: DateTime<Utc>,
}

impl SessionRow {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for s in [
            EndpointStatus::Online,
            EndpointStatus::Offline,
            EndpointStatus::Fail,
            EndpointStatus::Disconnect,
        ] {
            assert_eq!(EndpointStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(EndpointStatus::parse("bogus"), None);
    }

    #[test]
    fn tls_mode_query_values() {
        assert_eq!(TlsMode::Inherit.as_query_value(), None);
        assert_eq!(TlsMode::Custom.as_query_value(), Some("2"));
        assert_eq!(TlsMode::from_query_value("1"), Some(TlsMode::SelfSigned));
        assert_eq!(TlsMode::from_query_value("3"), None);
    }

    #[test]
    fn preserve_tag_detection() {
        let mut tags = HashMap::new();
        tags.insert("preserve".to_string(), "true".to_string());
        let tunnel = sample_tunnel(tags);
        assert!(tunnel.wants_recycle());

        let tunnel = sample_tunnel(HashMap::new());
        assert!(!tunnel.wants_recycle());
    }

    fn sample_tunnel(tags: HashMap<String, String>) -> Tunnel {
        Tunnel {
            id: 1,
            endpoint_id: 1,
            instance_id: Some("abc".into()),
            name: "t".into(),
            alias: None,
            tunnel_type: TunnelType::Server,
            status: TunnelStatus::Running,
            tunnel_address: "0.0.0.0".into(),
            tunnel_port: 10101,
            target_address: "127.0.0.1".into(),
            target_port: 8080,
            extend_target_address: Vec::new(),
            tls_mode: TlsMode::Inherit,
            log_level: "info".into(),
            password: None,
            cert_path: None,
            key_path: None,
            min: None,
            max: None,
            slot: None,
            pool: None,
            ping: None,
            mode: None,
            restart: false,
            listen_type: ListenType::All,
            command_line: String::new(),
            config_line: String::new(),
            sorts: 0,
            tcps: None,
            udps: None,
            tcp_rx: 0,
            tcp_tx: 0,
            udp_rx: 0,
            udp_tx: 0,
            peer: None,
            tags,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}
