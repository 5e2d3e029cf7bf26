//! SQLite archive for purged jobs
//!
//! Once a terminal job's record and results are deleted, a summary row is
//! kept here for a longer retention window.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Archive database file name
pub const ARCHIVE_DB: &str = "archive.db";

/// Summary fields retained after purge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveRecord {
    pub id: String,
    pub command: String,
    pub args: Vec<String>,
    pub status: String,
    pub operation_type: String,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub archived_at: DateTime<Utc>,
}

/// Archive of purged job summaries
#[derive(Clone)]
pub struct ArchiveStore {
    conn: Arc<Mutex<Connection>>,
}

impl ArchiveStore {
    /// Open (or create) the archive under `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| Error::Storage(format!("Failed to create data directory: {}", e)))?;

        let conn = Connection::open(data_dir.join(ARCHIVE_DB))
            .map_err(|e| Error::Storage(format!("Failed to open archive: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| Error::Storage(format!("Failed to set pragmas: {}", e)))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// In-memory archive (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("Failed to create in-memory archive: {}", e)))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Internal("Lock poisoned".to_string()))
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS job_archive (
                id TEXT PRIMARY KEY,
                command TEXT NOT NULL,
                args TEXT NOT NULL,
                status TEXT NOT NULL,
                operation_type TEXT NOT NULL,
                exit_code INTEGER,
                error TEXT,
                submitted_at TEXT NOT NULL,
                completed_at TEXT,
                archived_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_job_archive_archived
                ON job_archive(archived_at);
            "#,
        )
        .map_err(|e| Error::Storage(format!("Failed to initialize archive schema: {}", e)))?;
        Ok(())
    }

    /// Insert or replace a summary row
    pub fn insert(&self, record: &ArchiveRecord) -> Result<()> {
        let args = serde_json::to_string(&record.args)?;
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO job_archive
                (id, command, args, status, operation_type, exit_code, error,
                 submitted_at, completed_at, archived_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                record.id,
                record.command,
                args,
                record.status,
                record.operation_type,
                record.exit_code,
                record.error,
                record.submitted_at.to_rfc3339(),
                record.completed_at.map(|t| t.to_rfc3339()),
                record.archived_at.to_rfc3339(),
            ],
        )?;
        debug!(job_id = %record.id, "Archived job summary");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<ArchiveRecord>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                r#"
                SELECT id, command, args, status, operation_type, exit_code, error,
                       submitted_at, completed_at, archived_at
                FROM job_archive WHERE id = ?1
                "#,
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<i32>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, Option<String>>(8)?,
                        row.get::<_, String>(9)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            id,
            command,
            args,
            status,
            operation_type,
            exit_code,
            error,
            submitted_at,
            completed_at,
            archived_at,
        )) = row
        else {
            return Ok(None);
        };

        Ok(Some(ArchiveRecord {
            id,
            command,
            args: serde_json::from_str(&args)?,
            status,
            operation_type,
            exit_code,
            error,
            submitted_at: parse_time(&submitted_at)?,
            completed_at: completed_at.as_deref().map(parse_time).transpose()?,
            archived_at: parse_time(&archived_at)?,
        }))
    }

    /// Delete rows archived before `cutoff`
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM job_archive WHERE archived_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        if removed > 0 {
            debug!(removed, "Purged archived jobs");
        }
        Ok(removed)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM job_archive", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("Invalid timestamp '{}': {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(id: &str, archived_at: DateTime<Utc>) -> ArchiveRecord {
        ArchiveRecord {
            id: id.to_string(),
            command: "npm".to_string(),
            args: vec!["install".to_string()],
            status: "completed".to_string(),
            operation_type: "package_install".to_string(),
            exit_code: Some(0),
            error: None,
            submitted_at: archived_at - Duration::hours(25),
            completed_at: Some(archived_at - Duration::hours(24)),
            archived_at,
        }
    }

    #[test]
    fn test_insert_and_get() {
        let archive = ArchiveStore::in_memory().expect("Failed to create archive");
        let now = Utc::now();
        archive.insert(&record("job-1", now)).unwrap();

        let loaded = archive.get("job-1").unwrap().unwrap();
        assert_eq!(loaded.args, vec!["install".to_string()]);
        assert_eq!(loaded.exit_code, Some(0));
        assert_eq!(loaded.archived_at.timestamp(), now.timestamp());
        assert!(archive.get("job-2").unwrap().is_none());
    }

    #[test]
    fn test_purge_older_than() {
        let archive = ArchiveStore::in_memory().expect("Failed to create archive");
        let now = Utc::now();
        archive.insert(&record("old", now - Duration::days(8))).unwrap();
        archive.insert(&record("fresh", now - Duration::days(1))).unwrap();

        let removed = archive.purge_older_than(now - Duration::days(7)).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(archive.count().unwrap(), 1);
        assert!(archive.get("fresh").unwrap().is_some());
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ArchiveStore::open(dir.path()).unwrap();
        archive.insert(&record("job-1", Utc::now())).unwrap();
        drop(archive);

        let reopened = ArchiveStore::open(dir.path()).unwrap();
        assert_eq!(reopened.count().unwrap(), 1);
    }
}
