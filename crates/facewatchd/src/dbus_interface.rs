use crate::sessions::{SessionError, SessionManager, StartRequest};
use crate::store::{DetectionFilter, Role};
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "io.facewatch.Monitor1";
pub const OBJECT_PATH: &str = "/io/facewatch/Monitor1";

/// D-Bus interface for the facewatch monitoring daemon.
///
/// Bus name: io.facewatch.Monitor1
/// Object path: /io/facewatch/Monitor1
///
/// Structured replies are JSON strings.
pub struct MonitorService {
    sessions: Arc<SessionManager>,
}

impl MonitorService {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }
}

fn to_fdo(error: SessionError) -> zbus::fdo::Error {
    match error {
        SessionError::InvalidInput(_) | SessionError::Gallery(crate::gallery::GalleryError::UnknownRoll { .. }) => {
            zbus::fdo::Error::InvalidArgs(error.to_string())
        }
        SessionError::Monitor(crate::monitor::MonitorError::UnknownTarget(_)) => {
            zbus::fdo::Error::InvalidArgs(error.to_string())
        }
        _ => zbus::fdo::Error::Failed(error.to_string()),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[interface(name = "io.facewatch.Monitor1")]
impl MonitorService {
    /// Start monitoring for the given roll numbers. Returns the session id.
    ///
    /// `camera` may be empty for the configured default; `role` defaults to admin.
    async fn start(&self, roll_numbers: Vec<String>, camera: &str, role: &str) -> zbus::fdo::Result<String> {
        tracing::info!(?roll_numbers, camera, role, "start requested");
        let role = if role.trim().is_empty() {
            Role::Admin
        } else {
            role.parse::<Role>()
                .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?
        };
        self.sessions
            .start(StartRequest {
                roll_numbers,
                camera: Some(camera.to_string()),
                role,
            })
            .await
            .map_err(to_fdo)
    }

    /// Stop the running session. False when nothing was running.
    async fn stop(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("stop requested");
        Ok(self.sessions.stop().await)
    }

    /// Record the current frame for `roll_number` (empty: first target).
    async fn capture(&self, roll_number: &str) -> zbus::fdo::Result<String> {
        tracing::info!(roll_number, "capture requested");
        let roll = Some(roll_number.trim()).filter(|r| !r.is_empty());
        let record = self.sessions.capture(roll).await.map_err(to_fdo)?;
        to_json(&record)
    }

    /// Return daemon and session status.
    async fn status(&self) -> zbus::fdo::Result<String> {
        to_json(&self.sessions.status().await)
    }

    /// List detection records. `filter` is a JSON object; empty lists everything.
    async fn list_detections(&self, filter: &str) -> zbus::fdo::Result<String> {
        let filter: DetectionFilter = if filter.trim().is_empty() {
            DetectionFilter::default()
        } else {
            serde_json::from_str(filter).map_err(|e| zbus::fdo::Error::InvalidArgs(format!("filter: {e}")))?
        };
        let records = self.sessions.list(&filter).await.map_err(to_fdo)?;
        to_json(&records)
    }

    /// Fetch one detection record by id.
    async fn get_detection(&self, id: &str) -> zbus::fdo::Result<String> {
        match self.sessions.get(id).await.map_err(to_fdo)? {
            Some(record) => to_json(&record),
            None => Err(zbus::fdo::Error::InvalidArgs(format!("no detection with id {id}"))),
        }
    }

    /// Remove a detection record by id.
    async fn delete_detection(&self, id: &str) -> zbus::fdo::Result<bool> {
        self.sessions.delete(id).await.map_err(to_fdo)
    }

    /// Remove every detection record. Returns the count removed.
    async fn clear_detections(&self) -> zbus::fdo::Result<u32> {
        let removed = self.sessions.clear().await.map_err(to_fdo)?;
        tracing::info!(removed, "detections cleared");
        Ok(u32::try_from(removed).unwrap_or(u32::MAX))
    }

    /// List known students.
    async fn list_students(&self) -> zbus::fdo::Result<String> {
        let students = self.sessions.students().map_err(to_fdo)?;
        to_json(&students)
    }
}
