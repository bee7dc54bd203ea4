//! Persisted download entries backing the downloads list.

use crate::db::{self, OptionalRowExt};
use crate::diagnostics::now_ms;
use crate::paths::AppPaths;
use crate::{EngineError, Result};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl EntryStatus {
    fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Queued => "queued",
            EntryStatus::Running => "running",
            EntryStatus::Completed => "completed",
            EntryStatus::Failed => "failed",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(EntryStatus::Queued),
            "running" => Some(EntryStatus::Running),
            "completed" => Some(EntryStatus::Completed),
            "failed" => Some(EntryStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadEntry {
    pub id: String,
    pub created_at_ms: i64,
    pub url: String,
    pub title: String,
    pub channel: Option<String>,
    pub preset: String,
    pub format_label: String,
    pub status: EntryStatus,
    pub output_path: Option<String>,
    pub file_bytes: Option<i64>,
    pub error: Option<String>,
    pub finished_at_ms: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewEntry<'a> {
    pub url: &'a str,
    pub title: &'a str,
    pub channel: Option<&'a str>,
    pub preset: &'a str,
    pub format_label: &'a str,
}

const SELECT_COLUMNS: &str = r#"
SELECT
  id,
  created_at_ms,
  url,
  title,
  channel,
  preset,
  format_label,
  status,
  output_path,
  file_bytes,
  error,
  finished_at_ms
FROM download_entry
"#;

fn connect(paths: &AppPaths) -> Result<Connection> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;
    Ok(conn)
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<DownloadEntry> {
    let status: String = row.get(7)?;
    Ok(DownloadEntry {
        id: row.get(0)?,
        created_at_ms: row.get(1)?,
        url: row.get(2)?,
        title: row.get(3)?,
        channel: row.get(4)?,
        preset: row.get(5)?,
        format_label: row.get(6)?,
        status: EntryStatus::from_str(&status).unwrap_or(EntryStatus::Failed),
        output_path: row.get(8)?,
        file_bytes: row.get(9)?,
        error: row.get(10)?,
        finished_at_ms: row.get(11)?,
    })
}

pub fn insert_entry(paths: &AppPaths, new: &NewEntry<'_>) -> Result<DownloadEntry> {
    let url = new.url.trim();
    if url.is_empty() {
        return Err(EngineError::InvalidInput("url is required".to_string()));
    }
    let conn = connect(paths)?;
    let id = Uuid::new_v4().to_string();
    let created_at_ms = now_ms();
    let title = match new.title.trim() {
        "" => url,
        t => t,
    };
    conn.execute(
        r#"
INSERT INTO download_entry (
  id, created_at_ms, url, title, channel, preset, format_label, status
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
"#,
        params![
            &id,
            created_at_ms,
            url,
            title,
            new.channel,
            new.preset,
            new.format_label,
            EntryStatus::Queued.as_str(),
        ],
    )?;
    get_entry(paths, &id)
}

pub fn get_entry(paths: &AppPaths, id: &str) -> Result<DownloadEntry> {
    let conn = connect(paths)?;
    conn.query_row(&format!("{SELECT_COLUMNS} WHERE id=?1"), params![id], map_row)
        .optional()?
        .ok_or_else(|| EngineError::InvalidInput(format!("download entry not found: {id}")))
}

pub fn set_status(paths: &AppPaths, id: &str, status: EntryStatus) -> Result<()> {
    let conn = connect(paths)?;
    let changed = conn.execute(
        "UPDATE download_entry SET status=?2 WHERE id=?1",
        params![id, status.as_str()],
    )?;
    ensure_changed(changed, id)
}

pub fn mark_completed(paths: &AppPaths, id: &str, output_path: &Path) -> Result<()> {
    let conn = connect(paths)?;
    let file_bytes = std::fs::metadata(output_path).ok().map(|m| m.len() as i64);
    let changed = conn.execute(
        r#"
UPDATE download_entry
SET status=?2, output_path=?3, file_bytes=?4, error=NULL, finished_at_ms=?5
WHERE id=?1
"#,
        params![
            id,
            EntryStatus::Completed.as_str(),
            output_path.to_string_lossy().to_string(),
            file_bytes,
            now_ms(),
        ],
    )?;
    ensure_changed(changed, id)
}

pub fn mark_failed(paths: &AppPaths, id: &str, error: &str) -> Result<()> {
    let conn = connect(paths)?;
    let changed = conn.execute(
        "UPDATE download_entry SET status=?2, error=?3, finished_at_ms=?4 WHERE id=?1",
        params![id, EntryStatus::Failed.as_str(), error, now_ms()],
    )?;
    ensure_changed(changed, id)
}

/// In-place label correction after quality reconciliation.
pub fn update_format_label(paths: &AppPaths, id: &str, label: &str) -> Result<()> {
    let conn = connect(paths)?;
    let changed = conn.execute(
        "UPDATE download_entry SET format_label=?2 WHERE id=?1",
        params![id, label],
    )?;
    ensure_changed(changed, id)
}

pub fn list_entries(paths: &AppPaths, limit: usize, offset: usize) -> Result<Vec<DownloadEntry>> {
    let conn = connect(paths)?;
    let mut stmt = conn.prepare(&format!(
        "{SELECT_COLUMNS} ORDER BY created_at_ms DESC, rowid DESC LIMIT ?1 OFFSET ?2"
    ))?;
    let entries = stmt
        .query_map(params![limit as i64, offset as i64], map_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

/// Removing an unknown id is not an error.
pub fn remove_entry(paths: &AppPaths, id: &str) -> Result<bool> {
    let conn = connect(paths)?;
    let changed = conn.execute("DELETE FROM download_entry WHERE id=?1", params![id])?;
    Ok(changed > 0)
}

fn ensure_changed(changed: usize, id: &str) -> Result<()> {
    if changed == 0 {
        return Err(EngineError::InvalidInput(format!(
            "download entry not found: {id}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample<'a>(url: &'a str) -> NewEntry<'a> {
        NewEntry {
            url,
            title: "Some Clip",
            channel: Some("Channel"),
            preset: "video_1080",
            format_label: "Video • MP4 • 1080p",
        }
    }

    #[test]
    fn entries_round_through_lifecycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());

        let entry = insert_entry(&paths, &sample("https://youtu.be/abc")).expect("insert");
        assert_eq!(entry.status, EntryStatus::Queued);
        assert_eq!(entry.title, "Some Clip");

        set_status(&paths, &entry.id, EntryStatus::Running).expect("running");
        let out = dir.path().join("clip.mp4");
        std::fs::write(&out, vec![0u8; 2048]).expect("write");
        mark_completed(&paths, &entry.id, &out).expect("complete");

        let stored = get_entry(&paths, &entry.id).expect("get");
        assert_eq!(stored.status, EntryStatus::Completed);
        assert_eq!(stored.file_bytes, Some(2048));
        assert!(stored.finished_at_ms.is_some());
    }

    #[test]
    fn format_label_is_corrected_in_place() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let entry = insert_entry(&paths, &sample("https://youtu.be/abc")).expect("insert");

        update_format_label(&paths, &entry.id, "Video • MP4 • Adjusted to max quality (720p)")
            .expect("update");
        let listed = list_entries(&paths, 10, 0).expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, entry.id);
        assert!(listed[0].format_label.contains("720p"));
    }

    #[test]
    fn failures_and_removal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let a = insert_entry(&paths, &sample("https://youtu.be/a")).expect("a");
        let b = insert_entry(&paths, &sample("https://youtu.be/b")).expect("b");

        mark_failed(&paths, &a.id, "Video not available.").expect("fail");
        assert_eq!(
            get_entry(&paths, &a.id).expect("get").error.as_deref(),
            Some("Video not available.")
        );

        assert!(remove_entry(&paths, &b.id).expect("remove"));
        assert!(!remove_entry(&paths, &b.id).expect("remove again"));
        assert!(matches!(
            set_status(&paths, &b.id, EntryStatus::Running),
            Err(EngineError::InvalidInput(_))
        ));
        assert_eq!(list_entries(&paths, 10, 0).expect("list").len(), 1);
    }

    #[test]
    fn blank_url_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        assert!(insert_entry(&paths, &sample("  ")).is_err());
    }
}
