use crate::paths::AppPaths;
use crate::Result;
use rusqlite::{Connection, OpenFlags};
use std::time::Duration;

const SCHEMA_VERSION: i64 = 1;

pub fn open(paths: &AppPaths) -> Result<Connection> {
    std::fs::create_dir_all(paths.db_dir())?;

    let conn = Connection::open_with_flags(
        paths.db_path(),
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
    )?;

    conn.busy_timeout(Duration::from_secs(10))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;

    Ok(conn)
}

pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS meta (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS download_entry (
  id TEXT PRIMARY KEY,
  created_at_ms INTEGER NOT NULL,
  url TEXT NOT NULL,
  title TEXT NOT NULL,
  channel TEXT,
  preset TEXT NOT NULL,
  format_label TEXT NOT NULL,
  status TEXT NOT NULL,
  output_path TEXT,
  file_bytes INTEGER,
  error TEXT,
  finished_at_ms INTEGER
);

CREATE INDEX IF NOT EXISTS idx_download_entry_created
  ON download_entry(created_at_ms DESC);
CREATE INDEX IF NOT EXISTS idx_download_entry_url
  ON download_entry(url);
"#,
    )?;

    let existing: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key='schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    if existing.as_deref() != Some(SCHEMA_VERSION.to_string().as_str()) {
        conn.execute(
            "INSERT INTO meta(key, value) VALUES('schema_version', ?)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            [SCHEMA_VERSION.to_string()],
        )?;
    }

    Ok(())
}

pub fn ensure_schema(paths: &AppPaths) -> Result<()> {
    let conn = open(paths)?;
    migrate(&conn)?;
    Ok(())
}

pub(crate) trait OptionalRowExt<T> {
    fn optional(self) -> rusqlite::Result<Option<T>>;
}

impl<T> OptionalRowExt<T> for rusqlite::Result<T> {
    fn optional(self) -> rusqlite::Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_is_idempotent_and_records_version() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());

        let conn = open(&paths).expect("open");
        migrate(&conn).expect("migrate once");
        migrate(&conn).expect("migrate twice");

        let version: String = conn
            .query_row("SELECT value FROM meta WHERE key='schema_version'", [], |r| {
                r.get(0)
            })
            .expect("version");
        assert_eq!(version, SCHEMA_VERSION.to_string());

        let mut stmt = conn
            .prepare("PRAGMA table_info(download_entry)")
            .expect("table_info");
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .expect("query")
            .collect::<rusqlite::Result<_>>()
            .expect("columns");
        assert!(columns.contains(&"format_label".to_string()));
        assert!(columns.contains(&"finished_at_ms".to_string()));
        assert!(paths.db_path().exists());
    }
}
