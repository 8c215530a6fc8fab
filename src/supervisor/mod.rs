//! Endpoint SSE supervisor
//!
//! One long-lived task per endpoint owns that endpoint's telemetry stream:
//!
//! ```text
//!  DISCONNECTED ──connect()──> CONNECTING ──200+event-stream──> STREAMING
//!       ^                         │                              │
//!       │                    failure/timeout                     │
//!       │<────────backoff─────────┘                              │
//!       │                                                        │
//!       │<────────────manual disconnect / shutdown───────────────┘
//! ```
//!
//! Reconnects use exponential backoff with jitter, reset to the base once a
//! frame arrives. A 4xx answer other than 429 is an operator problem
//! (credentials, path): the endpoint is marked `fail` and reconnects stop.
//! Manual disconnect is sticky: it suppresses automatic reconnects until
//! `connect` is called again.
//!
//! Frames are handed to the ingestor through a bounded per-endpoint queue;
//! on overflow the oldest pending frame is dropped - telemetry loss is
//! preferable to stalling the stream.

use crate::agent::{AgentApi, EndpointRef};
use crate::error::AppResult;
use crate::ingest::Ingestor;
use crate::model::EndpointStatus;
use crate::store::Store;
use chrono::Utc;
use futures::StreamExt;
use rand::Rng;
use reqwest::StatusCode;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

pub use crate::config::SupervisorConfig;

// ─────────────────────────────────────────────────────────────────────────────
// Frame queue
// ─────────────────────────────────────────────────────────────────────────────

/// Bounded frame queue between one supervisor and its ingest worker
///
/// `push` never blocks: at capacity the oldest pending frame is dropped
/// and counted.
pub struct FrameQueue {
    deque: Mutex<VecDeque<String>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            deque: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, payload: String) {
        {
            let mut deque = self.deque.lock().unwrap();
            if deque.len() >= self.capacity {
                deque.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            deque.push_back(payload);
        }
        self.notify.notify_one();
    }

    pub async fn pop(&self) -> String {
        loop {
            let notified = self.notify.notified();
            if let Some(payload) = self.deque.lock().unwrap().pop_front() {
                return payload;
            }
            notified.await;
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.deque.lock().unwrap().len()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backoff
// ─────────────────────────────────────────────────────────────────────────────

fn next_backoff(current: Duration, cap: Duration) -> Duration {
    (current * 2).min(cap)
}

/// Full jitter in [d/2, d] so a fleet of endpoints does not reconnect in
/// lockstep
fn with_jitter(d: Duration) -> Duration {
    let millis = d.as_millis().max(1) as u64;
    let low = millis / 2;
    Duration::from_millis(rand::thread_rng().gen_range(low..=millis))
}

// ─────────────────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────────────────

struct EndpointTask {
    cancel: watch::Sender<bool>,
    stream_task: JoinHandle<()>,
    worker_task: JoinHandle<()>,
}

struct ManagerInner {
    tasks: HashMap<i64, EndpointTask>,
    /// Sticky manual-disconnect set; members never auto-reconnect
    manual_disconnect: HashSet<i64>,
}

/// Owns every endpoint supervisor task and the manual-disconnect flags
pub struct SupervisorManager {
    inner: Mutex<ManagerInner>,
    store: Store,
    agent: AgentApi,
    ingestor: Arc<Ingestor>,
    config: SupervisorConfig,
    /// Total connection attempts, for diagnostics and tests
    connect_attempts: Arc<AtomicU64>,
}

impl SupervisorManager {
    pub fn new(
        store: Store,
        agent: AgentApi,
        ingestor: Arc<Ingestor>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            inner: Mutex::new(ManagerInner {
                tasks: HashMap::new(),
                manual_disconnect: HashSet::new(),
            }),
            store,
            agent,
            ingestor,
            config,
            connect_attempts: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawn supervisors for every stored endpoint.
    ///
    /// Endpoints last seen in `disconnect` keep their sticky flag across
    /// restarts.
    pub fn start_all(self: &Arc<Self>) -> AppResult<()> {
        for endpoint in self.store.list_endpoints()? {
            if endpoint.status == EndpointStatus::Disconnect {
                self.inner
                    .lock()
                    .unwrap()
                    .manual_disconnect
                    .insert(endpoint.id);
                tracing::info!(endpoint = endpoint.id, "Skipping manually disconnected endpoint");
                continue;
            }
            self.spawn_locked(EndpointRef::from(&endpoint));
        }
        Ok(())
    }

    /// Clear the sticky flag and (re)connect
    pub fn connect(self: &Arc<Self>, endpoint_id: i64) -> AppResult<()> {
        let endpoint = self.store.get_endpoint(endpoint_id)?;
        self.inner
            .lock()
            .unwrap()
            .manual_disconnect
            .remove(&endpoint_id);
        self.spawn_locked(EndpointRef::from(&endpoint));
        Ok(())
    }

    /// Sticky disconnect: stop the stream and suppress reconnects
    pub fn disconnect(&self, endpoint_id: i64) -> AppResult<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.manual_disconnect.insert(endpoint_id);
            if let Some(task) = inner.tasks.remove(&endpoint_id) {
                task.stop();
            }
        }
        self.store
            .set_endpoint_status(endpoint_id, EndpointStatus::Disconnect, Utc::now())?;
        tracing::info!(endpoint = endpoint_id, "Endpoint manually disconnected");
        Ok(())
    }

    /// Stop the supervisor and forget the endpoint (endpoint destroy path)
    pub fn remove(&self, endpoint_id: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.manual_disconnect.remove(&endpoint_id);
        if let Some(task) = inner.tasks.remove(&endpoint_id) {
            task.stop();
        }
    }

    pub fn is_manually_disconnected(&self, endpoint_id: i64) -> bool {
        self.inner
            .lock()
            .unwrap()
            .manual_disconnect
            .contains(&endpoint_id)
    }

    pub fn is_running(&self, endpoint_id: i64) -> bool {
        self.inner
            .lock()
            .unwrap()
            .tasks
            .get(&endpoint_id)
            .map(|t| !t.stream_task.is_finished())
            .unwrap_or(false)
    }

    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    /// Stop every supervisor; called on process shutdown
    pub fn shutdown_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        for (_, task) in inner.tasks.drain() {
            task.stop();
        }
    }

    fn spawn_locked(self: &Arc<Self>, endpoint: EndpointRef) {
        let mut inner = self.inner.lock().unwrap();

        if inner.manual_disconnect.contains(&endpoint.id) {
            // A racing auto-reconnect must never override the operator
            return;
        }
        if let Some(existing) = inner.tasks.get(&endpoint.id) {
            if !existing.stream_task.is_finished() {
                return;
            }
            inner.tasks.remove(&endpoint.id);
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let queue = Arc::new(FrameQueue::new(self.config.queue_capacity));

        let worker_task = {
            let queue = queue.clone();
            let ingestor = self.ingestor.clone();
            let endpoint_id = endpoint.id;
            let mut cancel = cancel_rx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        payload = queue.pop() => ingestor.handle_payload(endpoint_id, &payload),
                        _ = cancel.changed() => {
                            if *cancel.borrow() {
                                break;
                            }
                        }
                    }
                }
                if queue.dropped() > 0 {
                    tracing::warn!(
                        endpoint = endpoint_id,
                        dropped = queue.dropped(),
                        "Ingest queue dropped frames during this connection's lifetime"
                    );
                }
            })
        };

        let endpoint_id = endpoint.id;

        let stream_task = {
            let manager = self.clone();
            let cancel = cancel_rx;
            tokio::spawn(async move {
                manager.run_endpoint(endpoint, queue, cancel).await;
            })
        };

        inner.tasks.insert(
            endpoint_id,
            EndpointTask {
                cancel: cancel_tx,
                stream_task,
                worker_task,
            },
        );
    }

    // ── per-endpoint loop ──────────────────────────────────────────────────

    async fn run_endpoint(
        self: Arc<Self>,
        endpoint: EndpointRef,
        queue: Arc<FrameQueue>,
        mut cancel: watch::Receiver<bool>,
    ) {
        let endpoint_id = endpoint.id;
        let mut backoff = self.config.backoff_base;

        loop {
            if *cancel.borrow() {
                break;
            }

            self.connect_attempts.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(endpoint = endpoint_id, "Connecting to endpoint stream");

            match self.stream_once(&endpoint, &queue, &mut cancel).await {
                StreamOutcome::Cancelled => break,
                StreamOutcome::Fatal(reason) => {
                    tracing::error!(
                        endpoint = endpoint_id,
                        "Endpoint stream failed permanently: {}",
                        reason
                    );
                    let _ = self.store.set_endpoint_status(
                        endpoint_id,
                        EndpointStatus::Fail,
                        Utc::now(),
                    );
                    break;
                }
                StreamOutcome::Retry { was_healthy } => {
                    let _ = self.store.set_endpoint_status(
                        endpoint_id,
                        EndpointStatus::Offline,
                        Utc::now(),
                    );
                    if was_healthy {
                        backoff = self.config.backoff_base;
                    }
                }
            }

            let delay = with_jitter(backoff);
            tracing::debug!(
                endpoint = endpoint_id,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting after backoff"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        break;
                    }
                }
            }
            backoff = next_backoff(backoff, self.config.backoff_cap);
        }

        tracing::debug!(endpoint = endpoint_id, "Supervisor task exiting");
    }

    /// One CONNECTING → STREAMING cycle
    async fn stream_once(
        &self,
        endpoint: &EndpointRef,
        queue: &FrameQueue,
        cancel: &mut watch::Receiver<bool>,
    ) -> StreamOutcome {
        let request = self.agent.sse_request(endpoint);

        let response = tokio::select! {
            r = request.send() => r,
            _ = cancelled(cancel) => return StreamOutcome::Cancelled,
        };

        let response = match response {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(endpoint = endpoint.id, "Stream connect failed: {}", e);
                return StreamOutcome::Retry { was_healthy: false };
            }
        };

        let status = response.status();
        if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
            // Credentials or config; retrying cannot help
            return StreamOutcome::Fatal(format!("agent answered {status}"));
        }
        if !status.is_success() {
            tracing::warn!(endpoint = endpoint.id, "Stream rejected: {}", status);
            return StreamOutcome::Retry { was_healthy: false };
        }
        let is_event_stream = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("text/event-stream"))
            .unwrap_or(false);
        if !is_event_stream {
            tracing::warn!(endpoint = endpoint.id, "Agent answered without an event stream");
            return StreamOutcome::Retry { was_healthy: false };
        }

        let mut parser = crate::sse::SseParser::new();
        let mut stream = response.bytes_stream();
        let mut saw_frame = false;

        loop {
            let chunk = tokio::select! {
                c = tokio::time::timeout(self.config.health_timeout, stream.next()) => c,
                _ = cancelled(cancel) => return StreamOutcome::Cancelled,
            };

            match chunk {
                Err(_elapsed) => {
                    tracing::warn!(
                        endpoint = endpoint.id,
                        timeout_secs = self.config.health_timeout.as_secs(),
                        "No frame within the health window; reconnecting"
                    );
                    return StreamOutcome::Retry {
                        was_healthy: saw_frame,
                    };
                }
                Ok(None) => {
                    tracing::info!(endpoint = endpoint.id, "Stream closed by agent");
                    return StreamOutcome::Retry {
                        was_healthy: saw_frame,
                    };
                }
                Ok(Some(Err(e))) => {
                    tracing::warn!(endpoint = endpoint.id, "Stream read error: {}", e);
                    return StreamOutcome::Retry {
                        was_healthy: saw_frame,
                    };
                }
                Ok(Some(Ok(bytes))) => {
                    for payload in parser.push(&bytes) {
                        if !saw_frame {
                            saw_frame = true;
                            let _ = self.store.set_endpoint_status(
                                endpoint.id,
                                EndpointStatus::Online,
                                Utc::now(),
                            );
                        }
                        queue.push(payload);
                    }
                }
            }
        }
    }
}

impl EndpointTask {
    fn stop(self) {
        let _ = self.cancel.send(true);
        // Abort as a backstop; the select loops normally exit on their own
        self.stream_task.abort();
        self.worker_task.abort();
    }
}

enum StreamOutcome {
    /// Context cancelled; unwind without reconnecting
    Cancelled,
    /// Operator intervention required; stop reconnecting
    Fatal(String),
    /// Transient; reconnect with backoff (reset to base if frames flowed)
    Retry { was_healthy: bool },
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            // Sender gone; treat as cancelled
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileLogConfig;
    use crate::filelog::FileLog;
    use crate::hub::FanoutHub;
    use crate::metrics::Aggregator;
    use crate::store::NewEndpoint;

    #[test]
    fn backoff_doubles_and_caps() {
        let cap = Duration::from_secs(60);
        let mut d = Duration::from_secs(1);
        let expected = [2u64, 4, 8, 16, 32, 60, 60];
        for want in expected {
            d = next_backoff(d, cap);
            assert_eq!(d, Duration::from_secs(want));
        }
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let d = Duration::from_millis(1000);
        for _ in 0..100 {
            let j = with_jitter(d);
            assert!(j >= Duration::from_millis(500) && j <= d, "jitter {j:?}");
        }
    }

    #[tokio::test]
    async fn frame_queue_drops_oldest() {
        let queue = FrameQueue::new(3);
        for i in 0..5 {
            queue.push(format!("frame {i}"));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 2);
        // Oldest retained frame is #2
        assert_eq!(queue.pop().await, "frame 2");
        assert_eq!(queue.pop().await, "frame 3");
        assert_eq!(queue.pop().await, "frame 4");
    }

    struct Fixture {
        manager: Arc<SupervisorManager>,
        store: Store,
        endpoint_id: i64,
        _dir: tempfile::TempDir,
    }

    /// Manager wired to an endpoint URL nothing listens on
    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        let endpoint_id = store
            .insert_endpoint(&NewEndpoint {
                name: "edge".into(),
                // Port 1 on loopback: connects are refused immediately
                url: "http://127.0.0.1:1".into(),
                api_path: "/api".into(),
                api_key: "k".into(),
                color: None,
            })
            .unwrap()
            .id;

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
        let aggregator = Arc::new(Aggregator::new(store.clone(), Duration::from_secs(75)));
        let hub = FanoutHub::new(16);
        let ingestor = Arc::new(Ingestor::new(
            store.clone(),
            filelog,
            hub,
            aggregator,
        ));
        let manager = Arc::new(SupervisorManager::new(
            store.clone(),
            AgentApi::new().unwrap(),
            ingestor,
            SupervisorConfig {
                health_timeout: Duration::from_secs(5),
                backoff_base: Duration::from_millis(20),
                backoff_cap: Duration::from_millis(100),
                queue_capacity: 16,
            },
        ));
        Fixture {
            manager,
            store,
            endpoint_id,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn manual_disconnect_is_sticky() {
        let f = fixture();
        f.manager.connect(f.endpoint_id).unwrap();
        assert!(f.manager.is_running(f.endpoint_id));

        f.manager.disconnect(f.endpoint_id).unwrap();
        assert!(f.manager.is_manually_disconnected(f.endpoint_id));
        assert!(!f.manager.is_running(f.endpoint_id));
        assert_eq!(
            f.store.get_endpoint(f.endpoint_id).unwrap().status,
            EndpointStatus::Disconnect
        );

        // Several backoff cycles pass; the sticky flag keeps the task away
        let attempts_after_disconnect = f.manager.connect_attempts();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(f.manager.connect_attempts(), attempts_after_disconnect);
        assert!(!f.manager.is_running(f.endpoint_id));

        // Reconnect clears the flag and attempts immediately
        f.manager.connect(f.endpoint_id).unwrap();
        assert!(!f.manager.is_manually_disconnected(f.endpoint_id));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while f.manager.connect_attempts() == attempts_after_disconnect {
            assert!(tokio::time::Instant::now() < deadline, "no reconnect attempt");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        f.manager.shutdown_all();
    }

    #[tokio::test]
    async fn start_all_skips_disconnected_endpoints() {
        let f = fixture();
        f.store
            .set_endpoint_status(f.endpoint_id, EndpointStatus::Disconnect, Utc::now())
            .unwrap();

        f.manager.start_all().unwrap();
        assert!(f.manager.is_manually_disconnected(f.endpoint_id));
        assert!(!f.manager.is_running(f.endpoint_id));
        f.manager.shutdown_all();
    }

    #[tokio::test]
    async fn connect_twice_spawns_one_task() {
        let f = fixture();
        f.manager.connect(f.endpoint_id).unwrap();
        f.manager.connect(f.endpoint_id).unwrap();
        {
            let inner = f.manager.inner.lock().unwrap();
            assert_eq!(inner.tasks.len(), 1);
        }
        f.manager.shutdown_all();
    }

    #[tokio::test]
    async fn remove_stops_and_forgets() {
        let f = fixture();
        f.manager.connect(f.endpoint_id).unwrap();
        f.manager.remove(f.endpoint_id);
        assert!(!f.manager.is_running(f.endpoint_id));
        assert!(!f.manager.is_manually_disconnected(f.endpoint_id));
    }
}
