//! Retention cleanup for the file log ring
//!
//! Walks `{base}/endpoint_*/{instance}/` and enforces two bounds:
//! files dated before `today - retention_days` are removed, and any day
//! whose line count exceeds `max_records_per_day` is truncated keeping the
//! newest lines. Runs on the cleanup ticker and on demand via the HTTP
//! trigger endpoint.

use super::parse_log_file_name;
use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, Utc};
use serde::Serialize;
use std::fs;
use std::path::Path;

/// What one cleanup pass did, surfaced by the stats endpoint
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupStats {
    pub files_scanned: u64,
    pub files_removed: u64,
    pub files_truncated: u64,
    pub lines_removed: u64,
    pub bytes_freed: u64,
    /// RFC3339, UTC
    pub finished_at: String,
}

pub(super) fn run_cleanup(
    base_dir: &Path,
    retention_days: u32,
    max_records_per_day: u64,
) -> Result<CleanupStats> {
    let cutoff = Utc::now().date_naive() - Duration::days(retention_days as i64);
    let mut stats = CleanupStats::default();

    let endpoints = match fs::read_dir(base_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            stats.finished_at = Utc::now().to_rfc3339();
            return Ok(stats);
        }
        Err(e) => return Err(e).with_context(|| format!("read {}", base_dir.display())),
    };

    for endpoint in endpoints.flatten() {
        if !endpoint.path().is_dir() {
            continue;
        }
        let instances = match fs::read_dir(endpoint.path()) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for instance in instances.flatten() {
            if !instance.path().is_dir() {
                continue;
            }
            clean_instance_dir(&instance.path(), cutoff, max_records_per_day, &mut stats);
        }
    }

    stats.finished_at = Utc::now().to_rfc3339();
    Ok(stats)
}

fn clean_instance_dir(
    dir: &Path,
    cutoff: NaiveDate,
    max_records_per_day: u64,
    stats: &mut CleanupStats,
) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let Some(date) = parse_log_file_name(&entry.file_name().to_string_lossy()) else {
            continue;
        };
        stats.files_scanned += 1;

        if date < cutoff {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            match fs::remove_file(&path) {
                Ok(()) => {
                    stats.files_removed += 1;
                    stats.bytes_freed += size;
                }
                Err(e) => tracing::warn!("Cleanup remove {} failed: {}", path.display(), e),
            }
            continue;
        }

        if max_records_per_day > 0 {
            if let Err(e) = truncate_over_cap(&path, max_records_per_day, stats) {
                tracing::warn!("Cleanup truncate {} failed: {}", path.display(), e);
            }
        }
    }
}

/// Keep only the newest `cap` lines of a day file
fn truncate_over_cap(path: &Path, cap: u64, stats: &mut CleanupStats) -> Result<()> {
    let contents = fs::read_to_string(path)?;
    let lines: Vec<&str> = contents.lines().collect();
    if lines.len() as u64 <= cap {
        return Ok(());
    }

    let drop_count = lines.len() as u64 - cap;
    let kept = &lines[drop_count as usize..];
    let mut rewritten = kept.join("\n");
    rewritten.push('\n');

    let before = contents.len() as u64;
    fs::write(path, &rewritten)?;
    stats.files_truncated += 1;
    stats.lines_removed += drop_count;
    stats.bytes_freed += before.saturating_sub(rewritten.len() as u64);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filelog::log_file_path;

    fn write_day(base: &Path, endpoint: i64, instance: &str, date: NaiveDate, lines: usize) {
        let path = log_file_path(base, endpoint, instance, date);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let body: String = (0..lines).map(|i| format!("line {i}\n")).collect();
        fs::write(path, body).unwrap();
    }

    #[test]
    fn removes_files_past_retention() {
        let dir = tempfile::tempdir().unwrap();
        let today = Utc::now().date_naive();
        let old = today - Duration::days(10);
        let fresh = today - Duration::days(1);

        write_day(dir.path(), 1, "inst", old, 3);
        write_day(dir.path(), 1, "inst", fresh, 3);

        let stats = run_cleanup(dir.path(), 7, 0).unwrap();
        assert_eq!(stats.files_removed, 1);

        assert!(!log_file_path(dir.path(), 1, "inst", old).exists());
        assert!(log_file_path(dir.path(), 1, "inst", fresh).exists());
    }

    #[test]
    fn truncates_days_over_cap_keeping_newest() {
        let dir = tempfile::tempdir().unwrap();
        let today = Utc::now().date_naive();
        write_day(dir.path(), 1, "inst", today, 10);

        let stats = run_cleanup(dir.path(), 7, 4).unwrap();
        assert_eq!(stats.files_truncated, 1);
        assert_eq!(stats.lines_removed, 6);

        let contents = fs::read_to_string(log_file_path(dir.path(), 1, "inst", today)).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines, vec!["line 6", "line 7", "line 8", "line 9"]);
    }

    #[test]
    fn cap_zero_leaves_files_alone() {
        let dir = tempfile::tempdir().unwrap();
        let today = Utc::now().date_naive();
        write_day(dir.path(), 1, "inst", today, 100);

        let stats = run_cleanup(dir.path(), 7, 0).unwrap();
        assert_eq!(stats.files_truncated, 0);
        assert_eq!(stats.files_scanned, 1);
    }

    #[test]
    fn empty_base_dir_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let stats = run_cleanup(&missing, 7, 0).unwrap();
        assert_eq!(stats.files_scanned, 0);
    }
}
