//! Metrics aggregator: per-minute ServiceHistory rows
//!
//! The ingestor feeds one [`Sample`] per counter-bearing update frame. The
//! aggregator keeps one in-memory bucket per (endpoint, instance) minute
//! and flushes it to the store when the minute rolls over in the data, or
//! when the wall-clock ticker finds the bucket stale (instance went quiet).
//!
//! Row contract: averages are `sum / count` (0 when no samples carried the
//! gauge), deltas are sums over the minute, speeds are `delta / 60` bytes
//! per second. The store upsert replaces on `(instance_id, record_time)`,
//! so a late second flush for the same minute wins.

use crate::error::AppResult;
use crate::model::ServiceHistoryRow;
use crate::store::Store;
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// One counter/gauge observation, deltas already computed by the ingestor
#[derive(Debug, Clone)]
pub struct Sample {
    pub endpoint_id: i64,
    pub instance_id: String,
    pub time: DateTime<Utc>,
    pub ping: Option<i64>,
    pub pool: Option<i64>,
    pub delta_tcp_in: i64,
    pub delta_tcp_out: i64,
    pub delta_udp_in: i64,
    pub delta_udp_out: i64,
    /// A counter stepped backwards inside this sample
    pub reset: bool,
}

#[derive(Debug)]
struct Bucket {
    minute_start: DateTime<Utc>,
    ping_sum: i64,
    ping_count: u32,
    pool_sum: i64,
    pool_count: u32,
    delta_tcp_in: i64,
    delta_tcp_out: i64,
    delta_udp_in: i64,
    delta_udp_out: i64,
    /// Internal only; never exported to the row
    reset_seen: bool,
    /// Wall-clock time of the last sample, for the stale sweep
    last_sample: Instant,
}

impl Bucket {
    fn new(minute_start: DateTime<Utc>) -> Self {
        Self {
            minute_start,
            ping_sum: 0,
            ping_count: 0,
            pool_sum: 0,
            pool_count: 0,
            delta_tcp_in: 0,
            delta_tcp_out: 0,
            delta_udp_in: 0,
            delta_udp_out: 0,
            reset_seen: false,
            last_sample: Instant::now(),
        }
    }

    fn accumulate(&mut self, sample: &Sample) {
        if let Some(ping) = sample.ping {
            self.ping_sum += ping;
            self.ping_count += 1;
        }
        if let Some(pool) = sample.pool {
            self.pool_sum += pool;
            self.pool_count += 1;
        }
        self.delta_tcp_in += sample.delta_tcp_in;
        self.delta_tcp_out += sample.delta_tcp_out;
        self.delta_udp_in += sample.delta_udp_in;
        self.delta_udp_out += sample.delta_udp_out;
        self.reset_seen |= sample.reset;
        self.last_sample = Instant::now();
    }

    fn into_row(self, instance_id: &str) -> ServiceHistoryRow {
        let avg = |sum: i64, count: u32| {
            if count == 0 {
                0.0
            } else {
                sum as f64 / count as f64
            }
        };
        ServiceHistoryRow {
            instance_id: instance_id.to_string(),
            record_time: self.minute_start,
            avg_ping: avg(self.ping_sum, self.ping_count),
            avg_pool: avg(self.pool_sum, self.pool_count),
            delta_tcp_in: self.delta_tcp_in,
            delta_tcp_out: self.delta_tcp_out,
            delta_udp_in: self.delta_udp_in,
            delta_udp_out: self.delta_udp_out,
            avg_speed_in: (self.delta_tcp_in + self.delta_udp_in) as f64 / 60.0,
            avg_speed_out: (self.delta_tcp_out + self.delta_udp_out) as f64 / 60.0,
        }
    }
}

/// Rolling minute-bucket aggregator
pub struct Aggregator {
    store: Store,
    buckets: Mutex<HashMap<(i64, String), Bucket>>,
    flush_grace: Duration,
}

impl Aggregator {
    pub fn new(store: Store, flush_grace: Duration) -> Self {
        Self {
            store,
            buckets: Mutex::new(HashMap::new()),
            flush_grace,
        }
    }

    /// Ingest one sample; flushes the previous bucket on a minute boundary
    pub fn record(&self, sample: Sample) {
        let minute = truncate_to_minute(sample.time);
        let key = (sample.endpoint_id, sample.instance_id.clone());

        let flushed = {
            let mut buckets = self.buckets.lock().unwrap();
            let flushed = match buckets.get(&key) {
                Some(bucket) if bucket.minute_start != minute => buckets
                    .remove(&key)
                    .map(|b| b.into_row(&sample.instance_id)),
                _ => None,
            };
            buckets
                .entry(key)
                .or_insert_with(|| Bucket::new(minute))
                .accumulate(&sample);
            flushed
        };

        if let Some(row) = flushed {
            self.write_row(row);
        }
    }

    /// Flush buckets that have not seen a sample within the grace window
    ///
    /// Guarantees bounded tail latency when an instance goes quiet.
    pub fn flush_stale(&self) {
        let now = Instant::now();
        let stale: Vec<(String, Bucket)> = {
            let mut buckets = self.buckets.lock().unwrap();
            let keys: Vec<(i64, String)> = buckets
                .iter()
                .filter(|(_, b)| now.duration_since(b.last_sample) >= self.flush_grace)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| buckets.remove(&k).map(|b| (k.1, b)))
                .collect()
        };

        for (instance_id, bucket) in stale {
            self.write_row(bucket.into_row(&instance_id));
        }
    }

    /// Flush one instance's open bucket (instance deleted)
    pub fn flush_instance(&self, endpoint_id: i64, instance_id: &str) {
        let removed = self
            .buckets
            .lock()
            .unwrap()
            .remove(&(endpoint_id, instance_id.to_string()));
        if let Some(bucket) = removed {
            self.write_row(bucket.into_row(instance_id));
        }
    }

    /// Flush everything; best-effort, used on shutdown
    pub fn flush_all(&self) {
        let drained: Vec<((i64, String), Bucket)> =
            self.buckets.lock().unwrap().drain().collect();
        for ((_, instance_id), bucket) in drained {
            self.write_row(bucket.into_row(&instance_id));
        }
    }

    /// Number of open buckets (diagnostics)
    pub fn open_buckets(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }

    fn write_row(&self, row: ServiceHistoryRow) {
        if let Err(e) = self.write_row_inner(&row) {
            // The store wrapper already retried; losing one minute row is
            // acceptable telemetry loss
            tracing::warn!(
                instance = %row.instance_id,
                minute = %row.record_time,
                "ServiceHistory flush failed: {}",
                e
            );
        }
    }

    fn write_row_inner(&self, row: &ServiceHistoryRow) -> AppResult<()> {
        self.store.insert_service_history(row)
    }

    /// Periodic stale sweep; returns when `shutdown` flips to true
    pub async fn run(
        self: std::sync::Arc<Self>,
        tick_interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let me = self.clone();
                    // Flush touches SQLite; keep it off the async threads
                    let _ = tokio::task::spawn_blocking(move || me.flush_stale()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let me = self.clone();
                        let _ = tokio::task::spawn_blocking(move || me.flush_all()).await;
                        break;
                    }
                }
            }
        }
    }
}

pub(crate) fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(TimeDelta::minutes(1)).unwrap_or(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(instance: &str, time: DateTime<Utc>) -> Sample {
        Sample {
            endpoint_id: 1,
            instance_id: instance.into(),
            time,
            ping: None,
            pool: None,
            delta_tcp_in: 0,
            delta_tcp_out: 0,
            delta_udp_in: 0,
            delta_udp_out: 0,
            reset: false,
        }
    }

    fn aggregator() -> (Aggregator, Store) {
        let store = Store::open_in_memory().unwrap();
        (
            Aggregator::new(store.clone(), Duration::from_secs(75)),
            store,
        )
    }

    #[test]
    fn minute_boundary_flushes_previous_bucket() {
        let (agg, store) = aggregator();
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 10).unwrap();

        let mut s = sample("inst", t0);
        s.delta_tcp_in = 0; // baseline frame
        s.ping = Some(10);
        agg.record(s);

        let mut s = sample("inst", Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 40).unwrap());
        s.delta_tcp_in = 500;
        s.ping = Some(20);
        agg.record(s);

        // Nothing written yet; the 12:00 bucket is still open
        let since = Utc.with_ymd_and_hms(2025, 3, 1, 11, 0, 0).unwrap();
        assert!(store.query_service_history("inst", since).unwrap().is_empty());

        // Crossing into 12:01 flushes 12:00
        let mut s = sample("inst", Utc.with_ymd_and_hms(2025, 3, 1, 12, 1, 5).unwrap());
        s.delta_tcp_in = 200;
        s.reset = true;
        agg.record(s);

        let rows = store.query_service_history("inst", since).unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(
            row.record_time,
            Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
        );
        assert_eq!(row.delta_tcp_in, 500);
        assert!((row.avg_ping - 15.0).abs() < f64::EPSILON);
        assert!((row.avg_speed_in - 500.0 / 60.0).abs() < 1e-9);

        // The reset minute flushes with delta = post-reset accumulation
        agg.flush_all();
        let rows = store.query_service_history("inst", since).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].delta_tcp_in, 200);
    }

    #[test]
    fn averages_are_zero_without_gauge_samples() {
        let (agg, store) = aggregator();
        let t = Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 0).unwrap();
        let mut s = sample("inst", t);
        s.delta_tcp_out = 120;
        agg.record(s);
        agg.flush_all();

        let rows = store
            .query_service_history("inst", t - TimeDelta::minutes(1))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].avg_ping, 0.0);
        assert_eq!(rows[0].avg_pool, 0.0);
        assert_eq!(rows[0].delta_tcp_out, 120);
    }

    #[test]
    fn stale_sweep_flushes_quiet_instances() {
        let store = Store::open_in_memory().unwrap();
        let agg = Aggregator::new(store.clone(), Duration::from_millis(0));
        let t = Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 0).unwrap();
        agg.record(sample("inst", t));
        assert_eq!(agg.open_buckets(), 1);

        // Grace of zero makes the bucket immediately stale
        agg.flush_stale();
        assert_eq!(agg.open_buckets(), 0);
        assert_eq!(
            store
                .query_service_history("inst", t - TimeDelta::minutes(1))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn same_minute_reflush_replaces_row() {
        let (agg, store) = aggregator();
        let t = Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 10).unwrap();

        let mut s = sample("inst", t);
        s.delta_tcp_in = 100;
        agg.record(s);
        agg.flush_all();

        // Late sample for the same minute, flushed again: replace
        let mut s = sample("inst", t + TimeDelta::seconds(20));
        s.delta_tcp_in = 100;
        agg.record(s);
        agg.flush_all();

        let rows = store
            .query_service_history("inst", t - TimeDelta::minutes(1))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].delta_tcp_in, 100);
    }

    #[test]
    fn buckets_are_independent_per_instance() {
        let (agg, _store) = aggregator();
        let t = Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 0).unwrap();
        agg.record(sample("a", t));
        agg.record(sample("b", t));
        assert_eq!(agg.open_buckets(), 2);
        agg.flush_instance(1, "a");
        assert_eq!(agg.open_buckets(), 1);
    }
}
