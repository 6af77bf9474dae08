//! Detection records and where they are kept.

pub mod rest;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use facewatch_hw::CameraMode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

pub use rest::RestStore;
pub use sqlite::SqliteStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("screenshot I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("detection API: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid store URL: {0}")]
    Url(String),
    #[error("invalid detection record: {0}")]
    InvalidRecord(String),
    #[error("corrupt detection row: {0}")]
    Corrupt(String),
}

/// Who started the session that produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    General,
    Student,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::General => "general",
            Role::Student => "student",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "general" => Ok(Role::General),
            "student" => Ok(Role::Student),
            other => Err(StoreError::InvalidRecord(format!("unknown role: {other}"))),
        }
    }
}

/// What caused a record to be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Match,
    Manual,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Match => "match",
            Trigger::Manual => "manual",
        }
    }
}

impl FromStr for Trigger {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "match" => Ok(Trigger::Match),
            "manual" => Ok(Trigger::Manual),
            other => Err(StoreError::InvalidRecord(format!("unknown trigger: {other}"))),
        }
    }
}

/// A persisted detection. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub roll_number: String,
    pub student_name: String,
    /// File path (SQLite store) or `data:` URL (REST store).
    pub screenshot: String,
    pub location: String,
    pub camera_mode: CameraMode,
    pub similarity: f32,
    pub distance: f32,
    pub created_by: Role,
    pub trigger: Trigger,
}

/// A detection about to be stored, with its screenshot still in memory.
#[derive(Debug, Clone)]
pub struct NewDetection {
    pub timestamp: DateTime<Utc>,
    pub roll_number: String,
    pub student_name: String,
    /// JPEG-encoded frame.
    pub screenshot_jpeg: Vec<u8>,
    pub location: String,
    pub camera_mode: CameraMode,
    pub similarity: f32,
    pub distance: f32,
    pub created_by: Role,
    pub trigger: Trigger,
}

impl NewDetection {
    /// Check the record invariants before anything is written.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.roll_number.trim().is_empty() {
            return Err(StoreError::InvalidRecord("missing roll number".into()));
        }
        if !(0.0..=1.0).contains(&self.similarity) {
            return Err(StoreError::InvalidRecord(format!(
                "similarity {} outside [0, 1]",
                self.similarity
            )));
        }
        if !self.distance.is_finite() {
            return Err(StoreError::InvalidRecord("distance is not finite".into()));
        }
        if self.screenshot_jpeg.is_empty() {
            return Err(StoreError::InvalidRecord("empty screenshot".into()));
        }
        Ok(())
    }

    /// Attach an id and the stored screenshot reference.
    pub fn into_record(self, id: String, screenshot: String) -> DetectionRecord {
        DetectionRecord {
            id,
            timestamp: self.timestamp,
            roll_number: self.roll_number,
            student_name: self.student_name,
            screenshot,
            location: self.location,
            camera_mode: self.camera_mode,
            similarity: self.similarity,
            distance: self.distance,
            created_by: self.created_by,
            trigger: self.trigger,
        }
    }
}

/// Detection history query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionFilter {
    /// Matches student name or location (case-insensitive) or roll number (substring).
    pub search: Option<String>,
    /// Exact roll number.
    pub roll_number: Option<String>,
    /// Calendar day (UTC).
    pub date: Option<NaiveDate>,
    pub limit: Option<usize>,
}

impl DetectionFilter {
    pub fn matches(&self, record: &DetectionRecord) -> bool {
        if let Some(search) = self.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            let needle = search.to_lowercase();
            let hit = record.student_name.to_lowercase().contains(&needle)
                || record.roll_number.contains(search)
                || record.location.to_lowercase().contains(&needle);
            if !hit {
                return false;
            }
        }
        if let Some(roll) = self.roll_number.as_deref() {
            if record.roll_number != roll {
                return false;
            }
        }
        if let Some(date) = self.date {
            if record.timestamp.date_naive() != date {
                return false;
            }
        }
        true
    }

    /// Filter, order newest first and truncate.
    pub fn apply(&self, mut records: Vec<DetectionRecord>) -> Vec<DetectionRecord> {
        records.retain(|r| self.matches(r));
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = self.limit {
            records.truncate(limit);
        }
        records
    }
}

/// Persistence for detection records.
#[async_trait]
pub trait DetectionStore: Send + Sync {
    async fn append(&self, detection: NewDetection) -> Result<DetectionRecord, StoreError>;

    /// Records matching `filter`, newest first.
    async fn list(&self, filter: &DetectionFilter) -> Result<Vec<DetectionRecord>, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<DetectionRecord>, StoreError>;

    /// Returns false when no record had this id.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// Remove every record, returning how many were removed.
    async fn clear(&self) -> Result<u64, StoreError>;
}

/// Screenshot location relative to the screenshot directory:
/// `YYYY-MM-DD/match_<roll>_<HH-MM-SS>_<millis>_<id prefix>.jpg`.
///
/// The id prefix keeps two records for the same roll and millisecond apart.
pub fn screenshot_relpath(roll_number: &str, id: &str, timestamp: DateTime<Utc>) -> PathBuf {
    let roll: String = roll_number
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    let tag: String = id.chars().filter(char::is_ascii_alphanumeric).take(8).collect();
    PathBuf::from(timestamp.format("%Y-%m-%d").to_string()).join(format!(
        "match_{roll}_{}_{}_{tag}.jpg",
        timestamp.format("%H-%M-%S"),
        timestamp.timestamp_millis()
    ))
}
