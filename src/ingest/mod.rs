//! Event ingestion pipeline
//!
//! Turns parsed SSE frames into durable state: tunnel rows are
//! materialised, monotonic counters are turned into non-negative deltas,
//! log lines go to the file ring, raw frames go to the bounded event
//! buffer, and a typed event is published to the fan-out hub.
//!
//! # Data flow
//!
//! ```text
//! Supervisor ──payload──→ Ingestor
//!                            ├──→ Store   (tunnels, sse_events, oplog)
//!                            ├──→ FileLog (log frames)
//!                            ├──→ Aggregator (counter deltas per minute)
//!                            └──→ FanoutHub  (UI subscribers)
//! ```
//!
//! Per-frame errors are counted and skipped; the stream is never torn down
//! from here. Frames for one instance are applied in arrival order because
//! each endpoint has exactly one ingest worker.

use crate::agent::url::TunnelUrl;
use crate::agent::Instance;
use crate::error::AppResult;
use crate::events::StreamEvent;
use crate::filelog::FileLog;
use crate::hub::FanoutHub;
use crate::metrics::{truncate_to_minute, Aggregator, Sample};
use crate::model::{EndpointStatus, OperationStatus, TlsMode, TunnelStatus, TunnelType};
use crate::sse::Frame;
use crate::store::{NewSseEvent, Store, TunnelCounters, TunnelUpsert};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Last-seen counter values for one instance
#[derive(Debug, Clone, Copy, Default)]
struct CounterSnapshot {
    tcp_rx: i64,
    tcp_tx: i64,
    udp_rx: i64,
    udp_tx: i64,
}

/// Non-negative step of one monotonic counter
///
/// `curr < prev` is a reset: the new value is treated as accumulated since
/// the reset, so the delta is `curr` itself.
fn counter_delta(prev: i64, curr: i64) -> (i64, bool) {
    if curr < prev {
        (curr, true)
    } else {
        (curr - prev, false)
    }
}

/// The ingestion pipeline; one shared instance serves every endpoint
pub struct Ingestor {
    store: Store,
    filelog: Arc<FileLog>,
    hub: FanoutHub,
    aggregator: Arc<Aggregator>,
    /// instance id -> last counters, for delta reasoning
    counters: Mutex<HashMap<String, CounterSnapshot>>,
    /// instance id -> minute of the last reset log line (throttle)
    reset_logged: Mutex<HashMap<String, DateTime<Utc>>>,
    malformed: AtomicU64,
}

impl Ingestor {
    pub fn new(
        store: Store,
        filelog: Arc<FileLog>,
        hub: FanoutHub,
        aggregator: Arc<Aggregator>,
    ) -> Self {
        Self {
            store,
            filelog,
            hub,
            aggregator,
            counters: Mutex::new(HashMap::new()),
            reset_logged: Mutex::new(HashMap::new()),
            malformed: AtomicU64::new(0),
        }
    }

    pub fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Parse and apply one raw frame payload
    pub fn handle_payload(&self, endpoint_id: i64, payload: &str) {
        match Frame::parse(payload) {
            Ok(Frame::Unknown) => {
                // Forward compatibility: skip silently
            }
            Ok(frame) => self.apply(endpoint_id, frame, payload),
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    endpoint = endpoint_id,
                    "Skipping malformed frame ({} total): {}",
                    self.malformed.load(Ordering::Relaxed),
                    e
                );
            }
        }
    }

    fn apply(&self, endpoint_id: i64, frame: Frame, raw: &str) {
        // The frame accessors settle the wire name and the effective
        // timestamp once; the arms only carry their own payload fields
        let event_type = frame.type_name();
        let time = frame.time().unwrap_or_else(Utc::now);
        match frame {
            Frame::Initial { tunnels, info, .. } => {
                self.apply_initial(endpoint_id, time, tunnels, info, event_type, raw)
            }
            Frame::Create {
                instance_id,
                instance,
                ..
            } => self.apply_create(endpoint_id, time, instance_id, instance, event_type, raw),
            Frame::Update { .. } => self.apply_update(endpoint_id, frame, time, event_type, raw),
            Frame::Delete { instance_id, .. } => {
                self.apply_delete(endpoint_id, time, &instance_id, event_type, raw)
            }
            Frame::Log {
                instance_id, logs, ..
            } => self.apply_log(endpoint_id, time, &instance_id, &logs, event_type, raw),
            Frame::Shutdown { .. } => self.apply_shutdown(endpoint_id, time, event_type, raw),
            Frame::Unknown => {}
        }
    }

    // ── initial ────────────────────────────────────────────────────────────

    fn apply_initial(
        &self,
        endpoint_id: i64,
        time: DateTime<Utc>,
        tunnels: Vec<Instance>,
        info: Option<crate::agent::AgentInfo>,
        event_type: &str,
        raw: &str,
    ) {
        let count = tunnels.len();

        for instance in &tunnels {
            let fields = upsert_from_instance(instance);
            log_err(
                "initial upsert",
                self.store
                    .upsert_tunnel_by_instance(endpoint_id, &instance.id, &fields)
                    .map(|_| ()),
            );
            self.seed_counters(instance);
        }

        if let Some(info) = info {
            log_err(
                "endpoint info",
                self.store.set_endpoint_info(
                    endpoint_id,
                    info.hostname.as_deref(),
                    info.version.as_deref(),
                    info.tls.as_deref(),
                    info.log.as_deref(),
                ),
            );
        }
        log_err(
            "endpoint online",
            self.store
                .set_endpoint_status(endpoint_id, EndpointStatus::Online, Utc::now()),
        );

        self.record_raw(endpoint_id, None, event_type, time, raw, |_| {});
        self.hub.publish(&StreamEvent::Initial {
            endpoint_id,
            time,
            tunnels: count,
        });
        tracing::info!(endpoint = endpoint_id, tunnels = count, "Applied snapshot");
    }

    // ── create ─────────────────────────────────────────────────────────────

    fn apply_create(
        &self,
        endpoint_id: i64,
        time: DateTime<Utc>,
        instance_id: Option<String>,
        instance: Option<Instance>,
        event_type: &str,
        raw: &str,
    ) {
        let Some(id) = instance
            .as_ref()
            .map(|i| i.id.clone())
            .or(instance_id)
        else {
            self.malformed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(endpoint = endpoint_id, "create frame without instance id");
            return;
        };

        let fields = match &instance {
            Some(instance) => upsert_from_instance(instance),
            // Bare id: materialise a stub; the next update fills it in
            None => TunnelUpsert {
                name: id.clone(),
                ..Default::default()
            },
        };

        let name = fields.name.clone();
        let result = self
            .store
            .upsert_tunnel_by_instance(endpoint_id, &id, &fields)
            .map(|_| ());
        let ok = result.is_ok();
        log_err("create upsert", result);
        log_err(
            "oplog",
            self.store.append_operation(
                "create",
                &name,
                if ok {
                    OperationStatus::Success
                } else {
                    OperationStatus::Failed
                },
                None,
            ),
        );
        if let Some(instance) = &instance {
            self.seed_counters(instance);
        }

        self.record_raw(endpoint_id, Some(&id), event_type, time, raw, |_| {});
        self.hub.publish(&StreamEvent::Create {
            endpoint_id,
            instance_id: id,
            time,
        });
    }

    // ── update ─────────────────────────────────────────────────────────────

    fn apply_update(
        &self,
        endpoint_id: i64,
        frame: Frame,
        time: DateTime<Utc>,
        event_type: &str,
        raw: &str,
    ) {
        let Frame::Update {
            instance_id,
            status,
            alias,
            restart,
            tcp_rx,
            tcp_tx,
            udp_rx,
            udp_tx,
            pool,
            ping,
            tcps,
            udps,
            ..
        } = frame
        else {
            return;
        };
        let tunnel_status = status.as_deref().and_then(TunnelStatus::parse);

        log_err(
            "counter update",
            self.store.update_tunnel_counters_atomic(
                endpoint_id,
                &instance_id,
                TunnelCounters {
                    tcp_rx,
                    tcp_tx,
                    udp_rx,
                    udp_tx,
                    pool,
                    ping,
                    tcps,
                    udps,
                },
                tunnel_status,
            ),
        );

        // Delta reasoning against the previous snapshot for this instance
        let (sample, reset) = {
            let mut counters = self.counters.lock().unwrap();
            let prev = counters.get(&instance_id).copied();
            let mut snapshot = prev.unwrap_or_default();
            let mut deltas = (0i64, 0i64, 0i64, 0i64);
            let mut reset = false;

            if let Some(curr) = tcp_rx {
                if prev.is_some() {
                    let (d, r) = counter_delta(snapshot.tcp_rx, curr);
                    deltas.0 = d;
                    reset |= r;
                }
                snapshot.tcp_rx = curr;
            }
            if let Some(curr) = tcp_tx {
                if prev.is_some() {
                    let (d, r) = counter_delta(snapshot.tcp_tx, curr);
                    deltas.1 = d;
                    reset |= r;
                }
                snapshot.tcp_tx = curr;
            }
            if let Some(curr) = udp_rx {
                if prev.is_some() {
                    let (d, r) = counter_delta(snapshot.udp_rx, curr);
                    deltas.2 = d;
                    reset |= r;
                }
                snapshot.udp_rx = curr;
            }
            if let Some(curr) = udp_tx {
                if prev.is_some() {
                    let (d, r) = counter_delta(snapshot.udp_tx, curr);
                    deltas.3 = d;
                    reset |= r;
                }
                snapshot.udp_tx = curr;
            }
            counters.insert(instance_id.clone(), snapshot);

            (
                Sample {
                    endpoint_id,
                    instance_id: instance_id.clone(),
                    time,
                    ping,
                    pool,
                    delta_tcp_in: deltas.0,
                    delta_tcp_out: deltas.1,
                    delta_udp_in: deltas.2,
                    delta_udp_out: deltas.3,
                    reset,
                },
                reset,
            )
        };

        if reset {
            self.log_reset_throttled(&instance_id, time);
        }
        self.aggregator.record(sample);

        self.record_raw(endpoint_id, Some(&instance_id), event_type, time, raw, |e| {
            e.tcp_rx = tcp_rx;
            e.tcp_tx = tcp_tx;
            e.udp_rx = udp_rx;
            e.udp_tx = udp_tx;
            e.pool = pool;
            e.ping = ping;
            e.tcps = tcps;
            e.udps = udps;
            e.alias = alias.clone();
            e.restart = restart;
        });

        self.hub.publish(&StreamEvent::Update {
            endpoint_id,
            instance_id,
            time,
            status,
            tcp_rx,
            tcp_tx,
            udp_rx,
            udp_tx,
            pool,
            ping,
            tcps,
            udps,
        });
    }

    /// A reset is worth one log line per instance per minute, not one per frame
    fn log_reset_throttled(&self, instance_id: &str, time: DateTime<Utc>) {
        let minute = truncate_to_minute(time);
        let mut logged = self.reset_logged.lock().unwrap();
        let skip = logged.get(instance_id).is_some_and(|last| *last == minute);
        if !skip {
            logged.insert(instance_id.to_string(), minute);
            tracing::info!(instance = instance_id, "Counter reset detected");
        }
    }

    // ── delete ─────────────────────────────────────────────────────────────

    fn apply_delete(
        &self,
        endpoint_id: i64,
        time: DateTime<Utc>,
        instance_id: &str,
        event_type: &str,
        raw: &str,
    ) {
        // Close the open minute before the instance disappears
        self.aggregator.flush_instance(endpoint_id, instance_id);
        self.counters.lock().unwrap().remove(instance_id);
        self.reset_logged.lock().unwrap().remove(instance_id);

        match self.store.delete_tunnel_by_instance(endpoint_id, instance_id) {
            Ok(Some(tunnel)) => {
                log_err(
                    "oplog",
                    self.store.append_operation(
                        "delete",
                        &tunnel.name,
                        OperationStatus::Success,
                        None,
                    ),
                );
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("delete tunnel failed: {}", e),
        }

        self.record_raw(endpoint_id, Some(instance_id), event_type, time, raw, |_| {});
        self.hub.publish(&StreamEvent::Delete {
            endpoint_id,
            instance_id: instance_id.to_string(),
            time,
        });
    }

    // ── log ────────────────────────────────────────────────────────────────

    fn apply_log(
        &self,
        endpoint_id: i64,
        time: DateTime<Utc>,
        instance_id: &str,
        logs: &str,
        event_type: &str,
        raw: &str,
    ) {
        self.filelog.append(endpoint_id, instance_id, logs, time);
        self.record_raw(endpoint_id, Some(instance_id), event_type, time, raw, |e| {
            e.logs = Some(logs.to_string());
        });
        self.hub.publish(&StreamEvent::Log {
            endpoint_id,
            instance_id: instance_id.to_string(),
            time,
            logs: logs.to_string(),
        });
    }

    // ── shutdown ───────────────────────────────────────────────────────────

    fn apply_shutdown(
        &self,
        endpoint_id: i64,
        time: DateTime<Utc>,
        event_type: &str,
        raw: &str,
    ) {
        log_err(
            "endpoint offline",
            self.store
                .set_endpoint_status(endpoint_id, EndpointStatus::Offline, Utc::now()),
        );
        log_err(
            "tunnels offline",
            self.store
                .set_endpoint_tunnels_status(endpoint_id, TunnelStatus::Offline)
                .map(|_| ()),
        );
        self.record_raw(endpoint_id, None, event_type, time, raw, |_| {});
        self.hub
            .publish(&StreamEvent::Shutdown { endpoint_id, time });
        tracing::info!(endpoint = endpoint_id, "Endpoint announced shutdown");
    }

    // ── helpers ────────────────────────────────────────────────────────────

    /// Seed the delta baseline from a snapshot that carries counters.
    ///
    /// A snapshot without counters leaves no baseline; the first update
    /// frame then becomes the baseline itself (delta 0).
    fn seed_counters(&self, instance: &Instance) {
        if instance.tcprx.is_none()
            && instance.tcptx.is_none()
            && instance.udprx.is_none()
            && instance.udptx.is_none()
        {
            return;
        }
        let snapshot = CounterSnapshot {
            tcp_rx: instance.tcprx.unwrap_or(0),
            tcp_tx: instance.tcptx.unwrap_or(0),
            udp_rx: instance.udprx.unwrap_or(0),
            udp_tx: instance.udptx.unwrap_or(0),
        };
        self.counters
            .lock()
            .unwrap()
            .insert(instance.id.clone(), snapshot);
    }

    fn record_raw(
        &self,
        endpoint_id: i64,
        instance_id: Option<&str>,
        event_type: &str,
        time: DateTime<Utc>,
        raw: &str,
        fill: impl FnOnce(&mut NewSseEvent),
    ) {
        let mut event = NewSseEvent {
            endpoint_id,
            instance_id: instance_id.map(str::to_string),
            event_type: event_type.to_string(),
            event_time: Some(time),
            raw: raw.to_string(),
            ..Default::default()
        };
        fill(&mut event);
        log_err("raw event", self.store.insert_sse_event(&event).map(|_| ()));
    }
}

/// Map an agent-reported instance onto the tunnel row fields
///
/// The instance's URL is authoritative for addressing; anything we cannot
/// parse leaves the corresponding fields at their stub defaults.
fn upsert_from_instance(instance: &Instance) -> TunnelUpsert {
    let mut fields = TunnelUpsert {
        name: instance
            .alias
            .clone()
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| instance.id.clone()),
        alias: instance.alias.clone(),
        tunnel_type: instance
            .instance_type
            .as_deref()
            .and_then(TunnelType::parse),
        status: instance.status.as_deref().and_then(TunnelStatus::parse),
        restart: instance.restart,
        mode: instance.mode,
        pool: instance.pool,
        ping: instance.ping,
        tcps: instance.tcps,
        udps: instance.udps,
        tcp_rx: instance.tcprx,
        tcp_tx: instance.tcptx,
        udp_rx: instance.udprx,
        udp_tx: instance.udptx,
        peer: instance.peer.clone(),
        tags: if instance.tags.is_empty() {
            None
        } else {
            Some(instance.tags.clone())
        },
        command_line: instance.url.clone().unwrap_or_default(),
        ..Default::default()
    };

    if let Some(url) = instance.url.as_deref() {
        if let Ok(parsed) = TunnelUrl::parse(url) {
            fields.tunnel_type = fields.tunnel_type.or(Some(parsed.scheme));
            fields.tunnel_address = parsed.host.clone();
            fields.tunnel_port = parsed.port;
            let primary = parsed.primary_target();
            fields.target_address = primary.host.clone();
            fields.target_port = primary.port;
            fields.extend_target_address = parsed
                .targets
                .iter()
                .skip(1)
                .map(|t| format!("{}:{}", t.host, t.port))
                .collect();
            fields.tls_mode = Some(parsed.tls.unwrap_or(TlsMode::Inherit));
            fields.log_level = parsed.log.clone();
            fields.password = parsed.password.clone();
            fields.cert_path = parsed.cert.clone();
            fields.key_path = parsed.key.clone();
            fields.min = parsed.min;
            fields.max = parsed.max;
            fields.listen_type = Some(parsed.listen_type());
            fields.config_line = parsed.build();
        } else {
            fields.config_line = url.to_string();
        }
    }

    fields
}

fn log_err(what: &str, result: AppResult<()>) {
    if let Err(e) = result {
        tracing::warn!("Ingest {} failed: {}", what, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileLogConfig;
    use crate::store::NewEndpoint;
    use chrono::TimeZone;
    use std::time::Duration;

    struct Fixture {
        ingestor: Ingestor,
        store: Store,
        filelog: Arc<FileLog>,
        aggregator: Arc<Aggregator>,
        hub: FanoutHub,
        endpoint_id: i64,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        let endpoint_id = store
            .insert_endpoint(&NewEndpoint {
                name: "edge".into(),
                url: "http://edge:3000".into(),
                api_path: "/api".into(),
                api_key: "k".into(),
                color: None,
            })
            .unwrap()
            .id;
        let filelog = Arc::new(
            FileLog::new(FileLogConfig {
                enabled: true,
                base_dir: dir.path().to_path_buf(),
                retention_days: 7,
                cleanup_interval: Duration::from_secs(3600),
                max_records_per_day: 0,
            })
            .unwrap(),
        );
        let aggregator = Arc::new(Aggregator::new(store.clone(), Duration::from_secs(75)));
        let hub = FanoutHub::new(64);
        let ingestor = Ingestor::new(
            store.clone(),
            filelog.clone(),
            hub.clone(),
            aggregator.clone(),
        );
        Fixture {
            ingestor,
            store,
            filelog,
            aggregator,
            hub,
            endpoint_id,
            _dir: dir,
        }
    }

    #[test]
    fn counter_delta_law() {
        assert_eq!(counter_delta(1000, 1500), (500, false));
        assert_eq!(counter_delta(1500, 1500), (0, false));
        // Downward step is a reset: the new value is the delta
        assert_eq!(counter_delta(1500, 200), (200, true));
    }

    #[test]
    fn initial_frame_materialises_tunnels() {
        let f = fixture();
        let payload = r#"{"type":"initial","time":"2025-03-01T12:00:00Z",
            "tunnels":[
                {"id":"a1","alias":"web","type":"server","status":"running",
                 "url":"server://0.0.0.0:10101/127.0.0.1:8080?tls=1&log=debug","tcprx":5000},
                {"id":"b2","url":"client://gw:443/10.0.0.5:22"}
            ],
            "info":{"hostname":"edge-host","version":"1.4.0"}}"#;
        f.ingestor.handle_payload(f.endpoint_id, payload);

        let endpoint = f.store.get_endpoint(f.endpoint_id).unwrap();
        assert_eq!(endpoint.status, EndpointStatus::Online);
        assert_eq!(endpoint.hostname.as_deref(), Some("edge-host"));
        assert_eq!(endpoint.tunnel_count, 2);

        let web = f.store.get_tunnel_by_instance("a1").unwrap();
        assert_eq!(web.name, "web");
        assert_eq!(web.tunnel_port, 10101);
        assert_eq!(web.target_address, "127.0.0.1");
        assert_eq!(web.tls_mode, TlsMode::SelfSigned);
        assert_eq!(web.log_level, "debug");
        assert_eq!(web.status, TunnelStatus::Running);
        assert_eq!(web.tcp_rx, 5000);
    }

    #[test]
    fn counter_reset_scenario() {
        // Frames: 1000 @ 12:00:10, 1500 @ 12:00:40, 200 @ 12:01:05.
        // Minute 12:00 flushes with delta 500; minute 12:01 carries 200.
        let f = fixture();
        f.ingestor.handle_payload(
            f.endpoint_id,
            r#"{"type":"create","time":"2025-03-01T11:59:00Z","instance":{"id":"a1","url":"server://:1/h:2"}}"#,
        );

        for (time, rx) in [
            ("2025-03-01T12:00:10Z", 1000),
            ("2025-03-01T12:00:40Z", 1500),
            ("2025-03-01T12:01:05Z", 200),
        ] {
            f.ingestor.handle_payload(
                f.endpoint_id,
                &format!(
                    r#"{{"type":"update","time":"{time}","instanceId":"a1","tcpRx":{rx}}}"#
                ),
            );
        }
        f.aggregator.flush_all();

        let since = Utc.with_ymd_and_hms(2025, 3, 1, 11, 0, 0).unwrap();
        let rows = f.store.query_service_history("a1", since).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0].record_time,
            Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
        );
        assert_eq!(rows[0].delta_tcp_in, 500);
        assert_eq!(rows[1].delta_tcp_in, 200);
        // Deltas never go negative, even across the reset
        assert!(rows.iter().all(|r| r.delta_tcp_in >= 0));
    }

    #[test]
    fn update_persists_counters_and_publishes() {
        let f = fixture();
        let mut sub = f.hub.subscribe(crate::hub::SubscriptionFilter::Instance("a1".into()));
        f.ingestor.handle_payload(
            f.endpoint_id,
            r#"{"type":"create","instance":{"id":"a1","url":"server://:1/h:2"}}"#,
        );
        f.ingestor.handle_payload(
            f.endpoint_id,
            r#"{"type":"update","instanceId":"a1","tcpRx":100,"ping":7,"pool":3,"status":"running"}"#,
        );

        let tunnel = f.store.get_tunnel_by_instance("a1").unwrap();
        assert_eq!(tunnel.tcp_rx, 100);
        assert_eq!(tunnel.ping, Some(7));
        assert_eq!(tunnel.status, TunnelStatus::Running);

        let events = sub.drain();
        // create + update for this instance
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], StreamEvent::Update { ping: Some(7), .. }));
    }

    #[test]
    fn log_frame_reaches_file_ring() {
        let f = fixture();
        f.ingestor.handle_payload(
            f.endpoint_id,
            r#"{"type":"log","time":"2025-03-01T08:00:00Z","instanceId":"a1","logs":"tunnel established"}"#,
        );
        f.filelog.sync().unwrap();

        let date = chrono::NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        let lines = f.filelog.read(f.endpoint_id, "a1", date, 10).unwrap();
        assert_eq!(lines, vec!["tunnel established"]);

        // Also persisted as a raw event row
        let raw = f.store.list_sse_events(f.endpoint_id, Some("a1"), 10).unwrap();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].event_type, "log");
        assert_eq!(raw[0].logs.as_deref(), Some("tunnel established"));
    }

    #[test]
    fn delete_frame_respects_preserve_tag() {
        let f = fixture();
        f.ingestor.handle_payload(
            f.endpoint_id,
            r#"{"type":"create","instance":{"id":"a1","url":"server://:1/h:2","tags":{"preserve":"true"}}}"#,
        );
        f.ingestor
            .handle_payload(f.endpoint_id, r#"{"type":"delete","instanceId":"a1"}"#);

        assert!(f.store.get_tunnel_by_instance("a1").is_err());
        let recycled = f.store.list_recycle(f.endpoint_id).unwrap();
        assert_eq!(recycled.len(), 1);

        let ops = f.store.list_operations(10, 0).unwrap();
        assert_eq!(ops[0].action, "delete");
    }

    #[test]
    fn shutdown_frame_marks_everything_offline() {
        let f = fixture();
        f.ingestor.handle_payload(
            f.endpoint_id,
            r#"{"type":"initial","tunnels":[{"id":"a1","status":"running","url":"server://:1/h:2"}]}"#,
        );
        f.ingestor
            .handle_payload(f.endpoint_id, r#"{"type":"shutdown"}"#);

        assert_eq!(
            f.store.get_endpoint(f.endpoint_id).unwrap().status,
            EndpointStatus::Offline
        );
        assert_eq!(
            f.store.get_tunnel_by_instance("a1").unwrap().status,
            TunnelStatus::Offline
        );
    }

    #[test]
    fn malformed_frames_are_counted_not_fatal() {
        let f = fixture();
        f.ingestor.handle_payload(f.endpoint_id, "{broken json");
        f.ingestor.handle_payload(f.endpoint_id, r#"{"type":"future-thing"}"#);
        assert_eq!(f.ingestor.malformed_count(), 1);
        // A good frame still applies afterwards
        f.ingestor.handle_payload(
            f.endpoint_id,
            r#"{"type":"create","instance":{"id":"ok","url":"server://:1/h:2"}}"#,
        );
        assert!(f.store.get_tunnel_by_instance("ok").is_ok());
    }
}
