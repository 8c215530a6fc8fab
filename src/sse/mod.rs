//! SSE (Server-Sent Events) stream parsing
//!
//! The remote agent's telemetry stream is standard SSE: `data:` lines
//! terminated by a blank line. This module provides two layers:
//!
//! 1. **Byte-level framing** ([`SseParser`]): an incremental state machine
//!    fed raw chunks off the HTTP response. It tolerates `\r\n` line
//!    endings, comment lines (`:` prefix), multi-line `data:` payloads, and
//!    frames split across chunk boundaries.
//! 2. **Typed frames** ([`Frame`]): the JSON payload of each frame, tagged
//!    by `type`. Unknown types parse to [`Frame::Unknown`] and are ignored
//!    upstream.

use crate::agent::{AgentInfo, Instance};
use chrono::{DateTime, Utc};
use serde::Deserialize;

// ─────────────────────────────────────────────────────────────────────────────
// Byte-level framing
// ─────────────────────────────────────────────────────────────────────────────

/// Incremental SSE frame extractor
///
/// Feed it chunks as they arrive; it yields complete `data:` payloads.
#[derive(Debug, Default)]
pub struct SseParser {
    /// Unconsumed bytes (may end mid-line)
    buffer: Vec<u8>,
    /// `data:` lines of the frame currently being assembled
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one chunk, returning every frame payload it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        // Process complete lines; keep the trailing partial line buffered
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.buffer.drain(..=newline).collect();
            let mut line = String::from_utf8_lossy(&line_bytes).into_owned();
            // Strip the newline and an optional preceding carriage return
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                // Blank line terminates the frame
                if !self.data_lines.is_empty() {
                    frames.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
                continue;
            }
            if line.starts_with(':') {
                // Comment / keep-alive
                continue;
            }
            if let Some(data) = line.strip_prefix("data:") {
                self.data_lines.push(data.strip_prefix(' ').unwrap_or(data).to_string());
            }
            // event:/id:/retry: fields are not used by the agent protocol
        }

        frames
    }

    /// Whether a frame is partially assembled (diagnostics only)
    pub fn has_partial(&self) -> bool {
        !self.buffer.is_empty() || !self.data_lines.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Typed frames
// ─────────────────────────────────────────────────────────────────────────────

/// One parsed telemetry frame
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    /// Full snapshot of the endpoint's instances
    Initial {
        time: Option<DateTime<Utc>>,
        #[serde(default, alias = "instances")]
        tunnels: Vec<Instance>,
        #[serde(default)]
        info: Option<AgentInfo>,
    },

    /// A new instance appeared
    Create {
        time: Option<DateTime<Utc>>,
        #[serde(rename = "instanceId", default)]
        instance_id: Option<String>,
        #[serde(default)]
        instance: Option<Instance>,
    },

    /// Status/counter sample for one instance
    Update {
        time: Option<DateTime<Utc>>,
        #[serde(rename = "instanceId")]
        instance_id: String,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        alias: Option<String>,
        #[serde(default)]
        restart: Option<bool>,
        #[serde(rename = "tcpRx", default)]
        tcp_rx: Option<i64>,
        #[serde(rename = "tcpTx", default)]
        tcp_tx: Option<i64>,
        #[serde(rename = "udpRx", default)]
        udp_rx: Option<i64>,
        #[serde(rename = "udpTx", default)]
        udp_tx: Option<i64>,
        #[serde(default)]
        pool: Option<i64>,
        #[serde(default)]
        ping: Option<i64>,
        #[serde(default)]
        tcps: Option<i64>,
        #[serde(default)]
        udps: Option<i64>,
    },

    /// An instance was removed
    Delete {
        time: Option<DateTime<Utc>>,
        #[serde(rename = "instanceId")]
        instance_id: String,
    },

    /// Log text from one instance
    Log {
        time: Option<DateTime<Utc>>,
        #[serde(rename = "instanceId")]
        instance_id: String,
        #[serde(default)]
        logs: String,
    },

    /// The agent is going down
    Shutdown { time: Option<DateTime<Utc>> },

    /// Forward-compatibility: unrecognised frame types are skipped
    #[serde(other)]
    Unknown,
}

impl Frame {
    /// Parse one frame payload
    pub fn parse(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }

    /// Wire name of the frame type, for the raw event buffer
    pub fn type_name(&self) -> &'static str {
        match self {
            Frame::Initial { .. } => "initial",
            Frame::Create { .. } => "create",
            Frame::Update { .. } => "update",
            Frame::Delete { .. } => "delete",
            Frame::Log { .. } => "log",
            Frame::Shutdown { .. } => "shutdown",
            Frame::Unknown => "unknown",
        }
    }

    pub fn time(&self) -> Option<DateTime<Utc>> {
        match self {
            Frame::Initial { time, .. }
            | Frame::Create { time, .. }
            | Frame::Update { time, .. }
            | Frame::Delete { time, .. }
            | Frame::Log { time, .. }
            | Frame::Shutdown { time } => *time,
            Frame::Unknown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_simple_frames() {
        let mut parser = SseParser::new();
        let frames = parser.push(b"data: {\"a\":1}\n\ndata: {\"b\":2}\n\n");
        assert_eq!(frames, vec!["{\"a\":1}", "{\"b\":2}"]);
        assert!(!parser.has_partial());
    }

    #[test]
    fn survives_chunk_boundaries() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: {\"ty").is_empty());
        assert!(parser.push(b"pe\":\"update\"}").is_empty());
        let frames = parser.push(b"\n\n");
        assert_eq!(frames, vec!["{\"type\":\"update\"}"]);
    }

    #[test]
    fn tolerates_crlf_and_comments() {
        let mut parser = SseParser::new();
        let frames = parser.push(b": keep-alive\r\ndata: {\"x\":1}\r\n\r\n");
        assert_eq!(frames, vec!["{\"x\":1}"]);
    }

    #[test]
    fn joins_multi_line_data() {
        let mut parser = SseParser::new();
        let frames = parser.push(b"data: line1\ndata: line2\n\n");
        assert_eq!(frames, vec!["line1\nline2"]);
    }

    #[test]
    fn data_without_space_is_accepted() {
        let mut parser = SseParser::new();
        let frames = parser.push(b"data:{\"x\":1}\n\n");
        assert_eq!(frames, vec!["{\"x\":1}"]);
    }

    #[test]
    fn parses_update_frame() {
        let payload = r#"{"type":"update","time":"2025-03-01T12:00:10Z","instanceId":"abc","tcpRx":1000,"tcpTx":2000,"pool":4,"ping":12}"#;
        match Frame::parse(payload).unwrap() {
            Frame::Update {
                instance_id,
                tcp_rx,
                pool,
                ping,
                ..
            } => {
                assert_eq!(instance_id, "abc");
                assert_eq!(tcp_rx, Some(1000));
                assert_eq!(pool, Some(4));
                assert_eq!(ping, Some(12));
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn parses_initial_with_tunnels() {
        let payload = r#"{"type":"initial","time":"2025-03-01T12:00:00Z","tunnels":[{"id":"a"},{"id":"b"}]}"#;
        match Frame::parse(payload).unwrap() {
            Frame::Initial { tunnels, .. } => assert_eq!(tunnels.len(), 2),
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_tolerated() {
        let frame = Frame::parse(r#"{"type":"telemetry_v9","time":"2025-01-01T00:00:00Z"}"#).unwrap();
        assert!(matches!(frame, Frame::Unknown));
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(Frame::parse("{not json").is_err());
    }
}
