//! Payload types for the remote agent's REST API

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// One tunnel instance as the agent reports it
///
/// Counter field names follow the agent's wire format (`tcprx` etc.); the
/// control plane's own camelCase naming starts at the store boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(rename = "type", default)]
    pub instance_type: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    /// The instance's tunnel URL (config line)
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub restart: Option<bool>,
    #[serde(default)]
    pub mode: Option<i64>,
    #[serde(default)]
    pub ping: Option<i64>,
    #[serde(default)]
    pub pool: Option<i64>,
    #[serde(default, alias = "tcpRx")]
    pub tcprx: Option<i64>,
    #[serde(default, alias = "tcpTx")]
    pub tcptx: Option<i64>,
    #[serde(default, alias = "udpRx")]
    pub udprx: Option<i64>,
    #[serde(default, alias = "udpTx")]
    pub udptx: Option<i64>,
    #[serde(default)]
    pub tcps: Option<i64>,
    #[serde(default)]
    pub udps: Option<i64>,
    #[serde(default)]
    pub peer: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

/// Lifecycle operations the agent accepts on an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Start,
    Stop,
    Restart,
    /// Ask the agent to re-report the instance's current status
    Status,
}

impl ControlAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlAction::Start => "start",
            ControlAction::Stop => "stop",
            ControlAction::Restart => "restart",
            ControlAction::Status => "status",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "start" => Some(ControlAction::Start),
            "stop" => Some(ControlAction::Stop),
            "restart" => Some(ControlAction::Restart),
            "status" => Some(ControlAction::Status),
            _ => None,
        }
    }
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the agent-side TCP reachability probe
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpingResult {
    pub target: String,
    pub connected: bool,
    #[serde(default)]
    pub latency_ms: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Agent metadata reported alongside the initial snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentInfo {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub tls: Option<String>,
    #[serde(default)]
    pub log: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_parses_with_missing_optionals() {
        let json = r#"{"id":"abc123","url":"server://:1/h:2","tcprx":100}"#;
        let instance: Instance = serde_json::from_str(json).unwrap();
        assert_eq!(instance.id, "abc123");
        assert_eq!(instance.tcprx, Some(100));
        assert!(instance.status.is_none());
        assert!(instance.tags.is_empty());
    }

    #[test]
    fn control_action_round_trips() {
        for action in [
            ControlAction::Start,
            ControlAction::Stop,
            ControlAction::Restart,
            ControlAction::Status,
        ] {
            assert_eq!(ControlAction::parse(action.as_str()), Some(action));
        }
        assert_eq!(ControlAction::parse("reboot"), None);
    }
}
