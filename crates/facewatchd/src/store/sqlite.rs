//! Local detection history: a SQLite table plus JPEG files on disk.

use super::{screenshot_relpath, DetectionFilter, DetectionRecord, DetectionStore, NewDetection, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use std::path::{Path, PathBuf};
use tokio_rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS detections (
    seq           INTEGER PRIMARY KEY AUTOINCREMENT,
    id            TEXT NOT NULL UNIQUE,
    timestamp_ms  INTEGER NOT NULL,
    roll_number   TEXT NOT NULL,
    student_name  TEXT NOT NULL,
    screenshot    TEXT NOT NULL,
    location      TEXT NOT NULL,
    camera_mode   TEXT NOT NULL,
    similarity    REAL NOT NULL,
    distance      REAL NOT NULL,
    created_by    TEXT NOT NULL,
    trigger_kind  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_detections_timestamp ON detections (timestamp_ms);
";

const COLUMNS: &str = "id, timestamp_ms, roll_number, student_name, screenshot, location, \
                       camera_mode, similarity, distance, created_by, trigger_kind";

/// SQLite-backed store keeping at most `max_records` detections.
pub struct SqliteStore {
    conn: Connection,
    screenshot_dir: PathBuf,
    max_records: usize,
}

impl SqliteStore {
    pub async fn open(db_path: &Path, screenshot_dir: &Path, max_records: usize) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let conn = Connection::open(db_path).await?;
        tracing::info!(path = %db_path.display(), "detection database opened");
        Self::init(conn, screenshot_dir, max_records).await
    }

    #[cfg(test)]
    pub async fn open_in_memory(screenshot_dir: &Path, max_records: usize) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn, screenshot_dir, max_records).await
    }

    async fn init(conn: Connection, screenshot_dir: &Path, max_records: usize) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self {
            conn,
            screenshot_dir: screenshot_dir.to_path_buf(),
            max_records: max_records.max(1),
        })
    }

    async fn remove_screenshots(&self, paths: Vec<String>) {
        for path in paths {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path, error = %e, "failed to remove screenshot"),
            }
        }
    }
}

/// A row as stored; converted with validation into a [`DetectionRecord`].
struct RawRow {
    id: String,
    timestamp_ms: i64,
    roll_number: String,
    student_name: String,
    screenshot: String,
    location: String,
    camera_mode: String,
    similarity: f64,
    distance: f64,
    created_by: String,
    trigger: String,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            timestamp_ms: row.get(1)?,
            roll_number: row.get(2)?,
            student_name: row.get(3)?,
            screenshot: row.get(4)?,
            location: row.get(5)?,
            camera_mode: row.get(6)?,
            similarity: row.get(7)?,
            distance: row.get(8)?,
            created_by: row.get(9)?,
            trigger: row.get(10)?,
        })
    }
}

impl TryFrom<RawRow> for DetectionRecord {
    type Error = StoreError;

    fn try_from(row: RawRow) -> Result<Self, Self::Error> {
        let timestamp = DateTime::<Utc>::from_timestamp_millis(row.timestamp_ms)
            .ok_or_else(|| StoreError::Corrupt(format!("{}: bad timestamp {}", row.id, row.timestamp_ms)))?;
        let camera_mode = row
            .camera_mode
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("{}: bad camera mode {}", row.id, row.camera_mode)))?;
        Ok(Self {
            timestamp,
            roll_number: row.roll_number,
            student_name: row.student_name,
            screenshot: row.screenshot,
            location: row.location,
            camera_mode,
            similarity: row.similarity as f32,
            distance: row.distance as f32,
            created_by: row.created_by.parse()?,
            trigger: row.trigger.parse()?,
            id: row.id,
        })
    }
}

#[async_trait]
impl DetectionStore for SqliteStore {
    async fn append(&self, detection: NewDetection) -> Result<DetectionRecord, StoreError> {
        detection.validate()?;

        let id = uuid::Uuid::new_v4().to_string();
        let path = self
            .screenshot_dir
            .join(screenshot_relpath(&detection.roll_number, &id, detection.timestamp));
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &detection.screenshot_jpeg).await?;

        let record = detection.into_record(id, path.to_string_lossy().into_owned());
        let row = record.clone();
        let keep = self.max_records;

        let inserted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    &format!("INSERT INTO detections ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
                    params![
                        row.id,
                        row.timestamp.timestamp_millis(),
                        row.roll_number,
                        row.student_name,
                        row.screenshot,
                        row.location,
                        row.camera_mode.to_string(),
                        row.similarity as f64,
                        row.distance as f64,
                        row.created_by.as_str(),
                        row.trigger.as_str(),
                    ],
                )?;

                let pruned = {
                    let mut stmt = tx.prepare(
                        "SELECT screenshot FROM detections ORDER BY timestamp_ms DESC, seq DESC LIMIT -1 OFFSET ?1",
                    )?;
                    let rows = stmt.query_map(params![keep as i64], |r| r.get::<_, String>(0))?;
                    rows.collect::<rusqlite::Result<Vec<String>>>()?
                };
                if !pruned.is_empty() {
                    tx.execute(
                        "DELETE FROM detections WHERE seq NOT IN \
                         (SELECT seq FROM detections ORDER BY timestamp_ms DESC, seq DESC LIMIT ?1)",
                        params![keep as i64],
                    )?;
                }
                tx.commit()?;
                Ok(pruned)
            })
            .await;

        match inserted {
            Ok(pruned) => {
                if !pruned.is_empty() {
                    tracing::debug!(count = pruned.len(), "pruned old detections");
                    self.remove_screenshots(pruned).await;
                }
                Ok(record)
            }
            Err(e) => {
                self.remove_screenshots(vec![record.screenshot]).await;
                Err(e.into())
            }
        }
    }

    async fn list(&self, filter: &DetectionFilter) -> Result<Vec<DetectionRecord>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM detections ORDER BY timestamp_ms DESC, seq DESC"
                ))?;
                let rows = stmt.query_map([], RawRow::from_row)?;
                Ok(rows.collect::<rusqlite::Result<Vec<RawRow>>>()?)
            })
            .await?;

        let records = rows
            .into_iter()
            .map(DetectionRecord::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(filter.apply(records))
    }

    async fn get(&self, id: &str) -> Result<Option<DetectionRecord>, StoreError> {
        let id = id.to_string();
        let row = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {COLUMNS} FROM detections WHERE id = ?1"),
                        params![id],
                        RawRow::from_row,
                    )
                    .optional()?)
            })
            .await?;
        row.map(DetectionRecord::try_from).transpose()
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_string();
        let removed = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let screenshot = tx
                    .query_row(
                        "SELECT screenshot FROM detections WHERE id = ?1",
                        params![id],
                        |r| r.get::<_, String>(0),
                    )
                    .optional()?;
                if screenshot.is_some() {
                    tx.execute("DELETE FROM detections WHERE id = ?1", params![id])?;
                }
                tx.commit()?;
                Ok(screenshot)
            })
            .await?;

        match removed {
            Some(screenshot) => {
                self.remove_screenshots(vec![screenshot]).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn clear(&self) -> Result<u64, StoreError> {
        let screenshots = self
            .conn
            .call(|conn| {
                let tx = conn.transaction()?;
                let screenshots = {
                    let mut stmt = tx.prepare("SELECT screenshot FROM detections")?;
                    let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
                    rows.collect::<rusqlite::Result<Vec<String>>>()?
                };
                tx.execute("DELETE FROM detections", [])?;
                tx.commit()?;
                Ok(screenshots)
            })
            .await?;

        let count = screenshots.len() as u64;
        self.remove_screenshots(screenshots).await;
        tracing::info!(count, "detection history cleared");
        Ok(count)
    }
}
