// Events that flow from the ingestion pipeline to UI subscribers
//
// These are the typed, already-materialised versions of the raw SSE frames
// we ingest from remote agents. Using an enum allows pattern matching and
// ensures type-safe communication between the ingestor, the fan-out hub,
// and the HTTP SSE handlers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One event published through the fan-out hub
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum StreamEvent {
    /// Full snapshot arrived for an endpoint (tunnel list rebuilt)
    Initial {
        endpoint_id: i64,
        time: DateTime<Utc>,
        /// Number of instances in the snapshot
        tunnels: usize,
    },

    /// A new tunnel instance appeared on an endpoint
    Create {
        endpoint_id: i64,
        instance_id: String,
        time: DateTime<Utc>,
    },

    /// Status/counter update for one instance
    Update {
        endpoint_id: i64,
        instance_id: String,
        time: DateTime<Utc>,
        status: Option<String>,
        tcp_rx: Option<i64>,
        tcp_tx: Option<i64>,
        udp_rx: Option<i64>,
        udp_tx: Option<i64>,
        pool: Option<i64>,
        ping: Option<i64>,
        tcps: Option<i64>,
        udps: Option<i64>,
    },

    /// An instance was removed on its endpoint
    Delete {
        endpoint_id: i64,
        instance_id: String,
        time: DateTime<Utc>,
    },

    /// A log line from one instance
    Log {
        endpoint_id: i64,
        instance_id: String,
        time: DateTime<Utc>,
        logs: String,
    },

    /// The endpoint announced it is going away
    Shutdown {
        endpoint_id: i64,
        time: DateTime<Utc>,
    },
}

impl StreamEvent {
    /// The instance this event is about, if it targets a single one
    ///
    /// `Initial` and `Shutdown` are endpoint-wide and match only the
    /// wildcard filter.
    pub fn instance_id(&self) -> Option<&str> {
        match self {
            StreamEvent::Create { instance_id, .. }
            | StreamEvent::Update { instance_id, .. }
            | StreamEvent::Delete { instance_id, .. }
            | StreamEvent::Log { instance_id, .. } => Some(instance_id),
            StreamEvent::Initial { .. } | StreamEvent::Shutdown { .. } => None,
        }
    }

    pub fn endpoint_id(&self) -> i64 {
        match self {
            StreamEvent::Initial { endpoint_id, .. }
            | StreamEvent::Create { endpoint_id, .. }
            | StreamEvent::Update { endpoint_id, .. }
            | StreamEvent::Delete { endpoint_id, .. }
            | StreamEvent::Log { endpoint_id, .. }
            | StreamEvent::Shutdown { endpoint_id, .. } => *endpoint_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let event = StreamEvent::Shutdown {
            endpoint_id: 3,
            time: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "shutdown");
        assert_eq!(json["endpointId"], 3);
    }

    #[test]
    fn instance_scoping() {
        let event = StreamEvent::Log {
            endpoint_id: 1,
            instance_id: "abcd1234".into(),
            time: Utc::now(),
            logs: "listening".into(),
        };
        assert_eq!(event.instance_id(), Some("abcd1234"));

        let event = StreamEvent::Initial {
            endpoint_id: 1,
            time: Utc::now(),
            tunnels: 2,
        };
        assert_eq!(event.instance_id(), None);
    }
}
