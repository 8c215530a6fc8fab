//! Per-tunnel rolling log files with retention and bounded reads
//!
//! Log lines from the telemetry stream are appended to date-stamped files,
//! one directory per (endpoint, instance). A dedicated writer thread owns
//! the open handles so appends never block the async runtime.
//!
//! # Architecture
//!
//! ```text
//! Ingestion (async)
//!     │
//!     └──→ FileLog.append()
//!             │
//!             └──→ std::sync::mpsc::SyncSender (bounded)
//!                     │
//!                     └──→ Dedicated Writer Thread
//!                             │
//!                             ├──→ BufWriter per (endpoint, instance)
//!                             └──→ {base}/endpoint_{id}/{instance}/YYYY-MM-DD.log
//! ```
//!
//! Write failures are logged and dropped; log data is not mission-critical.
//! Read failures surface to the caller.

use crate::config::FileLogConfig;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

mod cleanup;

pub use cleanup::CleanupStats;

/// Channel depth before appends start dropping
const CHANNEL_BUFFER: usize = 4096;
/// Flush open handles when nothing arrived for this long
const IDLE_FLUSH: Duration = Duration::from_millis(500);
/// Close handles that have not been written for this long
const HANDLE_IDLE_CLOSE: Duration = Duration::from_secs(120);

/// Counters for observability of the log ring itself
#[derive(Debug, Default)]
pub struct FileLogMetrics {
    pub lines_written: AtomicU64,
    pub lines_dropped: AtomicU64,
    pub write_errors: AtomicU64,
}

enum WriterCommand {
    Append {
        endpoint_id: i64,
        instance_id: String,
        line: String,
        time: DateTime<Utc>,
    },
    /// Flush and close handles for one instance, then remove its directory
    Clear {
        endpoint_id: i64,
        instance_id: String,
        done: mpsc::Sender<Result<()>>,
    },
    /// Flush and close every handle (before cleanup walks the tree)
    CloseAll { done: mpsc::Sender<()> },
    /// Flush everything and acknowledge; used by tests and shutdown
    Sync { done: mpsc::Sender<()> },
    Shutdown,
}

/// Handle to the file log ring
pub struct FileLog {
    tx: SyncSender<WriterCommand>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<FileLogMetrics>,
    config: FileLogConfig,
    /// Result of the most recent cleanup pass, for the stats endpoint
    last_cleanup: Mutex<Option<CleanupStats>>,
}

impl FileLog {
    pub fn new(config: FileLogConfig) -> Result<Self> {
        fs::create_dir_all(&config.base_dir)
            .with_context(|| format!("create log base dir {}", config.base_dir.display()))?;

        let (tx, rx) = mpsc::sync_channel::<WriterCommand>(CHANNEL_BUFFER);
        let metrics = Arc::new(FileLogMetrics::default());

        let writer_metrics = metrics.clone();
        let base_dir = config.base_dir.clone();
        let writer_handle = thread::Builder::new()
            .name("filelog-writer".into())
            .spawn(move || writer_thread(rx, base_dir, writer_metrics))?;

        Ok(Self {
            tx,
            writer_handle: Mutex::new(Some(writer_handle)),
            metrics,
            config,
            last_cleanup: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &FileLogConfig {
        &self.config
    }

    pub fn metrics(&self) -> &FileLogMetrics {
        &self.metrics
    }

    /// Queue one log line; non-blocking, drops on overflow
    pub fn append(&self, endpoint_id: i64, instance_id: &str, line: &str, time: DateTime<Utc>) {
        if !self.config.enabled {
            return;
        }
        let cmd = WriterCommand::Append {
            endpoint_id,
            instance_id: instance_id.to_string(),
            line: line.to_string(),
            time,
        };
        match self.tx.try_send(cmd) {
            Ok(()) => {}
            Err(mpsc::TrySendError::Full(_)) => {
                self.metrics.lines_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "File log backpressure: dropped line (total dropped: {})",
                    self.metrics.lines_dropped.load(Ordering::Relaxed)
                );
            }
            Err(mpsc::TrySendError::Disconnected(_)) => {
                tracing::error!("File log writer thread disconnected");
            }
        }
    }

    /// Up to `limit` most-recent lines for one date, newest first
    pub fn read(
        &self,
        endpoint_id: i64,
        instance_id: &str,
        date: NaiveDate,
        limit: usize,
    ) -> Result<Vec<String>> {
        let path = log_file_path(&self.config.base_dir, endpoint_id, instance_id, date);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let mut lines: Vec<String> = contents
            .lines()
            .rev()
            .take(limit)
            .map(str::to_string)
            .collect();
        // .rev() already put the newest first
        lines.shrink_to_fit();
        Ok(lines)
    }

    /// Dates that have a log file for this instance, newest first
    pub fn available_dates(&self, endpoint_id: i64, instance_id: &str) -> Result<Vec<NaiveDate>> {
        let dir = instance_dir(&self.config.base_dir, endpoint_id, instance_id);
        let mut dates = Vec::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(dates),
            Err(e) => return Err(e).with_context(|| format!("read dir {}", dir.display())),
        };
        for entry in entries.flatten() {
            if let Some(date) = parse_log_file_name(&entry.file_name().to_string_lossy()) {
                dates.push(date);
            }
        }
        dates.sort_unstable_by(|a, b| b.cmp(a));
        Ok(dates)
    }

    /// Remove every log file for one instance
    pub fn clear(&self, endpoint_id: i64, instance_id: &str) -> Result<()> {
        let (done_tx, done_rx) = mpsc::channel();
        self.tx
            .send(WriterCommand::Clear {
                endpoint_id,
                instance_id: instance_id.to_string(),
                done: done_tx,
            })
            .map_err(|_| anyhow::anyhow!("file log writer thread is gone"))?;
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .map_err(|_| anyhow::anyhow!("file log clear timed out"))?
    }

    /// Remove an endpoint's whole log directory (endpoint destroy path)
    pub fn clear_endpoint(&self, endpoint_id: i64) -> Result<()> {
        let (done_tx, done_rx) = mpsc::channel();
        let _ = self.tx.send(WriterCommand::CloseAll { done: done_tx });
        let _ = done_rx.recv_timeout(Duration::from_secs(5));

        let dir = endpoint_dir(&self.config.base_dir, endpoint_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove {}", dir.display())),
        }
    }

    /// Run a retention/cap pass now; also invoked by the periodic task
    pub fn trigger_cleanup(&self) -> Result<CleanupStats> {
        // Close handles first so truncation does not race a buffered writer
        let (done_tx, done_rx) = mpsc::channel();
        let _ = self.tx.send(WriterCommand::CloseAll { done: done_tx });
        let _ = done_rx.recv_timeout(Duration::from_secs(5));

        let stats = cleanup::run_cleanup(
            &self.config.base_dir,
            self.config.retention_days,
            self.config.max_records_per_day,
        )?;
        *self.last_cleanup.lock().unwrap() = Some(stats.clone());
        Ok(stats)
    }

    pub fn last_cleanup(&self) -> Option<CleanupStats> {
        self.last_cleanup.lock().unwrap().clone()
    }

    /// Flush pending appends; blocks until the writer caught up
    pub fn sync(&self) -> Result<()> {
        let (done_tx, done_rx) = mpsc::channel();
        self.tx
            .send(WriterCommand::Sync { done: done_tx })
            .map_err(|_| anyhow::anyhow!("file log writer thread is gone"))?;
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .map_err(|_| anyhow::anyhow!("file log sync timed out"))?;
        Ok(())
    }

    /// Spawn the periodic cleanup task; returns when `shutdown` resolves
    pub async fn run_cleanup_task(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.cleanup_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup stays fast
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let me = self.clone();
                    let result = tokio::task::spawn_blocking(move || me.trigger_cleanup()).await;
                    match result {
                        Ok(Ok(stats)) => tracing::info!(
                            removed = stats.files_removed,
                            truncated = stats.files_truncated,
                            "File log cleanup complete"
                        ),
                        Ok(Err(e)) => tracing::warn!("File log cleanup failed: {}", e),
                        Err(e) => tracing::warn!("File log cleanup task panicked: {}", e),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

impl Drop for FileLog {
    fn drop(&mut self) {
        let _ = self.tx.send(WriterCommand::Shutdown);
        if let Some(handle) = self.writer_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Writer thread
// ─────────────────────────────────────────────────────────────────────────────

struct OpenLog {
    writer: BufWriter<File>,
    date: NaiveDate,
    last_write: Instant,
}

fn writer_thread(
    rx: mpsc::Receiver<WriterCommand>,
    base_dir: PathBuf,
    metrics: Arc<FileLogMetrics>,
) {
    let mut handles: HashMap<(i64, String), OpenLog> = HashMap::new();

    loop {
        match rx.recv_timeout(IDLE_FLUSH) {
            Ok(WriterCommand::Append {
                endpoint_id,
                instance_id,
                line,
                time,
            }) => {
                let date = time.date_naive();
                let key = (endpoint_id, instance_id);
                let rotate = handles.get(&key).map(|h| h.date != date).unwrap_or(false);
                if rotate {
                    if let Some(mut old) = handles.remove(&key) {
                        let _ = old.writer.flush();
                    }
                }

                let entry = match handles.entry(key) {
                    std::collections::hash_map::Entry::Occupied(e) => Some(e.into_mut()),
                    std::collections::hash_map::Entry::Vacant(e) => {
                        match open_log_file(&base_dir, e.key().0, &e.key().1, date) {
                            Ok(file) => Some(e.insert(OpenLog {
                                writer: BufWriter::new(file),
                                date,
                                last_write: Instant::now(),
                            })),
                            Err(err) => {
                                metrics.write_errors.fetch_add(1, Ordering::Relaxed);
                                tracing::warn!("File log open failed: {}", err);
                                None
                            }
                        }
                    }
                };

                if let Some(open) = entry {
                    match writeln!(open.writer, "{}", line) {
                        Ok(()) => {
                            open.last_write = Instant::now();
                            metrics.lines_written.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => {
                            metrics.write_errors.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!("File log write failed: {}", err);
                        }
                    }
                }
            }
            Ok(WriterCommand::Clear {
                endpoint_id,
                instance_id,
                done,
            }) => {
                handles.retain(|(ep, inst), open| {
                    if *ep == endpoint_id && *inst == instance_id {
                        let _ = open.writer.flush();
                        false
                    } else {
                        true
                    }
                });
                let dir = instance_dir(&base_dir, endpoint_id, &instance_id);
                let result = match fs::remove_dir_all(&dir) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => {
                        Err(anyhow::Error::new(e).context(format!("remove {}", dir.display())))
                    }
                };
                let _ = done.send(result);
            }
            Ok(WriterCommand::CloseAll { done }) => {
                for (_, open) in handles.iter_mut() {
                    let _ = open.writer.flush();
                }
                handles.clear();
                let _ = done.send(());
            }
            Ok(WriterCommand::Sync { done }) => {
                for (_, open) in handles.iter_mut() {
                    let _ = open.writer.flush();
                }
                let _ = done.send(());
            }
            Ok(WriterCommand::Shutdown) => {
                for (_, open) in handles.iter_mut() {
                    let _ = open.writer.flush();
                }
                tracing::debug!("File log writer thread shutting down");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                // Idle: flush everything, close handles nobody writes to
                let now = Instant::now();
                handles.retain(|_, open| {
                    let _ = open.writer.flush();
                    now.duration_since(open.last_write) < HANDLE_IDLE_CLOSE
                });
            }
            Err(RecvTimeoutError::Disconnected) => {
                for (_, open) in handles.iter_mut() {
                    let _ = open.writer.flush();
                }
                break;
            }
        }
    }
}

fn open_log_file(
    base_dir: &Path,
    endpoint_id: i64,
    instance_id: &str,
    date: NaiveDate,
) -> std::io::Result<File> {
    let path = log_file_path(base_dir, endpoint_id, instance_id, date);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

// ─────────────────────────────────────────────────────────────────────────────
// Path layout
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn endpoint_dir(base_dir: &Path, endpoint_id: i64) -> PathBuf {
    base_dir.join(format!("endpoint_{endpoint_id}"))
}

pub(crate) fn instance_dir(base_dir: &Path, endpoint_id: i64, instance_id: &str) -> PathBuf {
    // Instance ids are agent-assigned; keep a conservative character set so
    // they can never traverse out of the base directory
    let safe: String = instance_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
        .collect();
    endpoint_dir(base_dir, endpoint_id).join(safe)
}

pub(crate) fn log_file_path(
    base_dir: &Path,
    endpoint_id: i64,
    instance_id: &str,
    date: NaiveDate,
) -> PathBuf {
    instance_dir(base_dir, endpoint_id, instance_id).join(format!("{}.log", date.format("%Y-%m-%d")))
}

pub(crate) fn parse_log_file_name(name: &str) -> Option<NaiveDate> {
    let stem = name.strip_suffix(".log")?;
    NaiveDate::parse_from_str(stem, "%Y-%m-%d").ok()
}

/// Serializable view for the cleanup config endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileLogConfigView {
    pub enabled: bool,
    pub retention_days: u32,
    pub cleanup_interval_secs: u64,
    pub max_records_per_day: u64,
}

impl From<&FileLogConfig> for FileLogConfigView {
    fn from(c: &FileLogConfig) -> Self {
        Self {
            enabled: c.enabled,
            retention_days: c.retention_days,
            cleanup_interval_secs: c.cleanup_interval.as_secs(),
            max_records_per_day: c.max_records_per_day,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_config(dir: &Path) -> FileLogConfig {
        FileLogConfig {
            enabled: true,
            base_dir: dir.to_path_buf(),
            retention_days: 7,
            cleanup_interval: Duration::from_secs(3600),
            max_records_per_day: 0,
        }
    }

    #[test]
    fn append_then_read_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::new(test_config(dir.path())).unwrap();
        let t = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();

        for i in 0..5 {
            log.append(1, "inst-1", &format!("line {i}"), t);
        }
        log.sync().unwrap();

        let lines = log.read(1, "inst-1", t.date_naive(), 3).unwrap();
        assert_eq!(lines, vec!["line 4", "line 3", "line 2"]);
    }

    #[test]
    fn appends_rotate_by_date() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::new(test_config(dir.path())).unwrap();
        let day1 = Utc.with_ymd_and_hms(2025, 3, 1, 23, 59, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2025, 3, 2, 0, 1, 0).unwrap();

        log.append(1, "inst-1", "yesterday", day1);
        log.append(1, "inst-1", "today", day2);
        log.sync().unwrap();

        assert_eq!(
            log.read(1, "inst-1", day1.date_naive(), 10).unwrap(),
            vec!["yesterday"]
        );
        assert_eq!(
            log.read(1, "inst-1", day2.date_naive(), 10).unwrap(),
            vec!["today"]
        );

        let dates = log.available_dates(1, "inst-1").unwrap();
        assert_eq!(dates, vec![day2.date_naive(), day1.date_naive()]);
    }

    #[test]
    fn read_missing_date_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::new(test_config(dir.path())).unwrap();
        let lines = log
            .read(9, "nope", NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(), 10)
            .unwrap();
        assert!(lines.is_empty());
    }

    #[test]
    fn clear_removes_instance_directory() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::new(test_config(dir.path())).unwrap();
        let t = Utc::now();
        log.append(1, "inst-1", "hello", t);
        log.sync().unwrap();

        log.clear(1, "inst-1").unwrap();
        assert!(log.available_dates(1, "inst-1").unwrap().is_empty());
        // Appends keep working after a clear
        log.append(1, "inst-1", "again", t);
        log.sync().unwrap();
        assert_eq!(log.read(1, "inst-1", t.date_naive(), 10).unwrap().len(), 1);
    }

    #[test]
    fn disabled_ring_drops_appends() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.enabled = false;
        let log = FileLog::new(config).unwrap();
        log.append(1, "inst-1", "ignored", Utc::now());
        log.sync().unwrap();
        assert!(log.available_dates(1, "inst-1").unwrap().is_empty());
    }

    #[test]
    fn instance_ids_are_sanitized_in_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_file_path(
            dir.path(),
            1,
            "../../etc/passwd",
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
        );
        assert!(path.starts_with(dir.path().join("endpoint_1")));
        assert!(!path.to_string_lossy().contains(".."));
    }
}
