use crate::paths::AppPaths;
use crate::Result;
use serde::Serialize;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const LOG_ROTATE_BYTES: u64 = 10 * 1024 * 1024;
const LOG_MAX_BACKUPS: usize = 3;
const LOG_MAX_AGE_DAYS: u64 = 30;
const LOG_TOTAL_CAP_BYTES: u64 = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRetentionPolicy {
    pub rotate_bytes: u64,
    pub max_backups: usize,
    pub max_age_days: u64,
    pub total_cap_bytes: u64,
}

impl Default for LogRetentionPolicy {
    fn default() -> Self {
        Self {
            rotate_bytes: LOG_ROTATE_BYTES,
            max_backups: LOG_MAX_BACKUPS,
            max_age_days: LOG_MAX_AGE_DAYS,
            total_cap_bytes: LOG_TOTAL_CAP_BYTES,
        }
    }
}

pub fn download_log_path(paths: &AppPaths, scope: &str) -> PathBuf {
    paths.download_logs_dir().join(format!("{scope}.jsonl"))
}

/// Appends one JSON line to the per-download log for `scope`.
pub fn log_line(
    paths: &AppPaths,
    scope: &str,
    level: Level,
    event: &str,
    data: serde_json::Value,
) -> Result<()> {
    let path = download_log_path(paths, scope);
    append_line(&path, scope, level, event, data)
}

/// Same as [`log_line`] for events not tied to one download.
pub fn log_engine_line(
    paths: &AppPaths,
    level: Level,
    event: &str,
    data: serde_json::Value,
) -> Result<()> {
    append_line(&paths.engine_log_path(), "engine", level, event, data)
}

fn append_line(
    path: &Path,
    scope: &str,
    level: Level,
    event: &str,
    data: serde_json::Value,
) -> Result<()> {
    let line = serde_json::json!({
        "ts_ms": now_ms(),
        "scope": scope,
        "level": level,
        "event": event,
        "data": data
    })
    .to_string();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    rotate_if_needed(path, &LogRetentionPolicy::default())?;
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?
        .write_all(format!("{line}\n").as_bytes())?;
    Ok(())
}

fn rotate_if_needed(path: &Path, policy: &LogRetentionPolicy) -> Result<()> {
    let len = match std::fs::metadata(path) {
        Ok(m) => m.len(),
        Err(_) => return Ok(()),
    };
    if len < policy.rotate_bytes {
        return Ok(());
    }
    rotate_file_backups(path, policy.max_backups)?;
    Ok(())
}

pub(crate) fn rotate_file_backups(path: &Path, max_backups: usize) -> std::io::Result<()> {
    if max_backups == 0 {
        let _ = std::fs::remove_file(path);
        return Ok(());
    }

    for i in (1..=max_backups).rev() {
        let dst = path_with_suffix(path, &format!(".{i}"));
        let src = if i == 1 {
            path.to_path_buf()
        } else {
            path_with_suffix(path, &format!(".{}", i - 1))
        };
        if !src.exists() {
            continue;
        }
        if dst.exists() {
            let _ = std::fs::remove_file(&dst);
        }
        std::fs::rename(src, dst)?;
    }
    Ok(())
}

pub(crate) fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let file_name = match path.file_name() {
        Some(n) => n.to_string_lossy().to_string(),
        None => suffix.to_string(),
    };
    path.with_file_name(format!("{file_name}{suffix}"))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneSummary {
    pub removed_files: usize,
    pub removed_bytes: u64,
}

/// Drops per-download logs older than the retention age, then the oldest
/// remaining ones until the directory fits under the byte cap.
pub fn prune_logs(paths: &AppPaths, policy: &LogRetentionPolicy) -> Result<PruneSummary> {
    let dir = paths.download_logs_dir();
    let mut summary = PruneSummary::default();
    if !dir.exists() {
        return Ok(summary);
    }

    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(policy.max_age_days * 24 * 60 * 60))
        .unwrap_or(UNIX_EPOCH);

    let mut candidates: Vec<(PathBuf, SystemTime, u64)> = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = match entry {
            Ok(v) => v,
            Err(_) => continue,
        };
        let meta = match entry.metadata() {
            Ok(v) => v,
            Err(_) => continue,
        };
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(UNIX_EPOCH);
        let path = entry.path();
        let size = meta.len();

        if modified < cutoff {
            if std::fs::remove_file(&path).is_ok() {
                summary.removed_files += 1;
                summary.removed_bytes += size;
            }
            continue;
        }
        candidates.push((path, modified, size));
    }

    candidates.sort_by_key(|(_, modified, _)| *modified);
    let mut total: u64 = candidates.iter().map(|(_, _, size)| *size).sum();
    for (path, _modified, size) in candidates {
        if total <= policy.total_cap_bytes {
            break;
        }
        if std::fs::remove_file(&path).is_ok() {
            summary.removed_files += 1;
            summary.removed_bytes += size;
        }
        total = total.saturating_sub(size);
    }

    Ok(summary)
}

/// Last `limit` lines of a download's log, oldest first.
pub fn read_log_tail(
    paths: &AppPaths,
    scope: &str,
    limit: usize,
) -> Result<Vec<serde_json::Value>> {
    let path = download_log_path(paths, scope);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(std::fs::File::open(&path)?);
    let mut out: std::collections::VecDeque<serde_json::Value> =
        std::collections::VecDeque::with_capacity(limit.min(1024));
    for line in reader.lines().map_while(std::result::Result::ok) {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) else {
            continue;
        };
        if out.len() == limit {
            out.pop_front();
        }
        if limit > 0 {
            out.push_back(value);
        }
    }
    Ok(out.into_iter().collect())
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
