//! Session lifecycle: one monitoring session at a time.

use crate::engine::{FaceEngine, ModelState};
use crate::gallery::{Gallery, GalleryError, Student};
use crate::monitor::{describe_reference, Monitor, MonitorError, MonitorHandle, MonitorSettings, MonitorStatus, SessionTarget};
use crate::store::{DetectionFilter, DetectionRecord, DetectionStore, Role, StoreError};
use facewatch_hw::{open_source, CameraError, CameraSpec, FrameSource};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("face models unavailable: {0}")]
    ModelsUnavailable(String),
    #[error(transparent)]
    Gallery(#[from] GalleryError),
    #[error("camera: {0}")]
    Camera(#[from] CameraError),
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no monitoring session is running")]
    NoSession,
}

/// Parameters of a new session.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub roll_numbers: Vec<String>,
    /// Camera spec; the configured default when `None` or blank.
    pub camera: Option<String>,
    pub role: Role,
}

/// Daemon-wide status.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    pub version: &'static str,
    pub models: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_error: Option<String>,
    pub session: Option<MonitorStatus>,
}

pub struct SessionManager {
    engine: Arc<dyn FaceEngine>,
    gallery: Gallery,
    store: Arc<dyn DetectionStore>,
    settings: MonitorSettings,
    default_camera: String,
    current: Mutex<Option<MonitorHandle>>,
}

impl SessionManager {
    pub fn new(
        engine: Arc<dyn FaceEngine>,
        gallery: Gallery,
        store: Arc<dyn DetectionStore>,
        settings: MonitorSettings,
        default_camera: String,
    ) -> Self {
        Self {
            engine,
            gallery,
            store,
            settings,
            default_camera,
            current: Mutex::new(None),
        }
    }

    /// Validate, resolve targets, open the camera and start monitoring.
    ///
    /// A running session is replaced once the new camera is usable; a start
    /// that fails before that point leaves it running. Returns the new
    /// session id.
    pub async fn start(&self, request: StartRequest) -> Result<String, SessionError> {
        let camera = request
            .camera
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(&self.default_camera);
        let spec: CameraSpec = camera
            .parse()
            .map_err(|e: CameraError| SessionError::InvalidInput(e.to_string()))?;

        let targets = self.prepare_targets(&request.roll_numbers).await?;

        let mut current = self.current.lock().await;
        let source = match &spec {
            // The running session may hold this very device, so it is
            // released first. A missing node leaves that session alone.
            CameraSpec::Local(device) => {
                if !Path::new(device).exists() {
                    return Err(CameraError::DeviceNotFound(device.clone()).into());
                }
                Self::stop_current(&mut current).await;
                open_source(&spec).await?
            }
            CameraSpec::Network(_) => {
                let source = open_source(&spec).await?;
                Self::stop_current(&mut current).await;
                source
            }
        };
        tracing::info!(camera = %spec, "camera source opened");
        self.launch(&mut current, targets, source, request.role)
    }

    /// Start a session on an already opened source.
    pub async fn start_with_source(
        &self,
        roll_numbers: &[String],
        source: Box<dyn FrameSource>,
        role: Role,
    ) -> Result<String, SessionError> {
        let targets = self.prepare_targets(roll_numbers).await?;
        let mut current = self.current.lock().await;
        Self::stop_current(&mut current).await;
        self.launch(&mut current, targets, source, role)
    }

    async fn prepare_targets(&self, roll_numbers: &[String]) -> Result<Vec<SessionTarget>, SessionError> {
        let mut rolls: Vec<&str> = Vec::new();
        for roll in roll_numbers.iter().map(|r| r.trim()).filter(|r| !r.is_empty()) {
            if !rolls.iter().any(|r| r.eq_ignore_ascii_case(roll)) {
                rolls.push(roll);
            }
        }
        if rolls.is_empty() {
            return Err(SessionError::InvalidInput("at least one roll number is required".into()));
        }

        if let ModelState::Failed(reason) = self.engine.state() {
            return Err(SessionError::ModelsUnavailable(reason));
        }

        let mut targets = Vec::with_capacity(rolls.len());
        for roll in rolls {
            let reference = self.gallery.resolve(roll)?;
            let photo = Arc::new(self.gallery.load_photo(&reference).await?);

            let descriptor = match self.engine.state() {
                ModelState::Ready => {
                    Some(describe_reference(self.engine.as_ref(), &reference.roll_number, Arc::clone(&photo)).await?)
                }
                _ => {
                    tracing::info!(roll = %reference.roll_number, "models not ready; reference deferred");
                    None
                }
            };

            tracing::debug!(roll = %reference.roll_number, photo = %reference.photo, "target resolved");
            targets.push(SessionTarget {
                roll_number: reference.roll_number,
                name: reference.name,
                reference: photo,
                descriptor,
            });
        }
        Ok(targets)
    }

    fn launch(
        &self,
        current: &mut Option<MonitorHandle>,
        targets: Vec<SessionTarget>,
        source: Box<dyn FrameSource>,
        role: Role,
    ) -> Result<String, SessionError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let monitor = Monitor::new(
            session_id.clone(),
            source,
            Arc::clone(&self.engine),
            Arc::clone(&self.store),
            targets,
            self.settings,
            role,
        )?;
        *current = Some(monitor.spawn());
        tracing::info!(session = %session_id, role = %role, "session started");
        Ok(session_id)
    }

    async fn stop_current(current: &mut Option<MonitorHandle>) -> bool {
        match current.take() {
            Some(handle) => {
                let status = handle.stop().await;
                tracing::info!(session = %status.session_id, records = status.records, "session stopped");
                true
            }
            None => false,
        }
    }

    /// Stop the running session. Returns false when none was running.
    pub async fn stop(&self) -> bool {
        let mut current = self.current.lock().await;
        Self::stop_current(&mut current).await
    }

    /// Manually record the current frame of the running session.
    pub async fn capture(&self, roll_number: Option<&str>) -> Result<DetectionRecord, SessionError> {
        let current = self.current.lock().await;
        let handle = current.as_ref().ok_or(SessionError::NoSession)?;
        Ok(handle.capture(roll_number).await?)
    }

    pub async fn status(&self) -> DaemonStatus {
        let state = self.engine.state();
        let session = self.current.lock().await.as_ref().map(MonitorHandle::status);
        DaemonStatus {
            version: env!("CARGO_PKG_VERSION"),
            models: state.as_str(),
            model_error: match state {
                ModelState::Failed(reason) => Some(reason),
                _ => None,
            },
            session,
        }
    }

    pub async fn list(&self, filter: &DetectionFilter) -> Result<Vec<DetectionRecord>, SessionError> {
        Ok(self.store.list(filter).await?)
    }

    pub async fn get(&self, id: &str) -> Result<Option<DetectionRecord>, SessionError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn delete(&self, id: &str) -> Result<bool, SessionError> {
        let removed = self.store.delete(id).await?;
        tracing::info!(id, removed, "detection delete requested");
        Ok(removed)
    }

    pub async fn clear(&self) -> Result<u64, SessionError> {
        Ok(self.store.clear().await?)
    }

    pub fn students(&self) -> Result<Vec<Student>, SessionError> {
        Ok(self.gallery.students()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::tests::{scratch_dir, write_png};
    use crate::monitor::tests::{FakeEngine, FakeSource};
    use crate::monitor::MonitorState;
    use crate::store::tests::MemoryStore;
    use crate::store::Trigger;
    use std::path::PathBuf;
    use std::time::Duration;

    fn manager(engine: Arc<FakeEngine>, store: Arc<MemoryStore>) -> (SessionManager, PathBuf) {
        let dir = scratch_dir("sessions");
        write_png(&dir.join("21CS042.png"), 120);
        write_png(&dir.join("21CS050.png"), 130);
        let gallery = Gallery::open(&dir).unwrap();
        let manager = SessionManager::new(
            engine,
            gallery,
            store,
            MonitorSettings::default(),
            "local:/dev/facewatch-test-none".into(),
        );
        (manager, dir)
    }

    fn rolls(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_start_validates_input() {
        let (manager, dir) = manager(FakeEngine::ready(vec![vec![1.0, 0.0]]), Arc::new(MemoryStore::default()));

        let blank = manager
            .start(StartRequest {
                roll_numbers: rolls(&["  ", ""]),
                camera: Some("http://cam.local/video".into()),
                role: Role::Admin,
            })
            .await;
        assert!(matches!(blank, Err(SessionError::InvalidInput(_))));

        let bad_camera = manager
            .start(StartRequest {
                roll_numbers: rolls(&["21CS042"]),
                camera: Some("ftp://cam.local/video".into()),
                role: Role::Admin,
            })
            .await;
        assert!(matches!(bad_camera, Err(SessionError::InvalidInput(_))));

        let unknown = manager
            .start(StartRequest {
                roll_numbers: rolls(&["99XX"]),
                camera: Some("http://cam.local/video".into()),
                role: Role::Admin,
            })
            .await;
        assert!(matches!(unknown, Err(SessionError::Gallery(GalleryError::UnknownRoll { .. }))));
        assert!(manager.status().await.session.is_none());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_start_fails_when_models_failed() {
        let engine = FakeEngine::ready(vec![vec![1.0, 0.0]]);
        engine.set_state(ModelState::Failed("w600k_r50.onnx missing".into()));
        let (manager, dir) = manager(engine, Arc::new(MemoryStore::default()));

        let result = manager
            .start_with_source(&rolls(&["21CS042"]), Box::new(FakeSource::working()), Role::General)
            .await;
        assert!(matches!(result, Err(SessionError::ModelsUnavailable(_))));
        let status = manager.status().await;
        assert_eq!(status.models, "failed");
        assert!(status.model_error.is_some());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_start_local_camera_missing() {
        let (manager, dir) = manager(FakeEngine::ready(vec![vec![1.0, 0.0]]), Arc::new(MemoryStore::default()));
        let result = manager
            .start(StartRequest {
                roll_numbers: rolls(&["21CS042"]),
                camera: None,
                role: Role::Admin,
            })
            .await;
        assert!(matches!(result, Err(SessionError::Camera(CameraError::DeviceNotFound(_)))));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_failed_camera_keeps_running_session() {
        let (manager, dir) = manager(FakeEngine::ready(vec![vec![1.0, 0.0]]), Arc::new(MemoryStore::default()));
        let first = manager
            .start_with_source(&rolls(&["21CS042"]), Box::new(FakeSource::working()), Role::Admin)
            .await
            .unwrap();

        let result = manager
            .start(StartRequest {
                roll_numbers: rolls(&["21CS050"]),
                camera: Some("local:/dev/facewatch-test-none".into()),
                role: Role::Admin,
            })
            .await;
        assert!(matches!(result, Err(SessionError::Camera(CameraError::DeviceNotFound(_)))));

        let status = manager.status().await;
        assert_eq!(status.session.unwrap().session_id, first);
        assert!(manager.stop().await);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_session_records_and_replaces() {
        let store = Arc::new(MemoryStore::default());
        let (manager, dir) = manager(FakeEngine::ready(vec![vec![1.0, 0.0]]), store.clone());

        let first = manager
            .start_with_source(&rolls(&["21CS042", "21cs042"]), Box::new(FakeSource::working()), Role::Admin)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let status = manager.status().await;
        let session = status.session.unwrap();
        assert_eq!(session.session_id, first);
        assert_eq!(session.targets, vec!["21CS042".to_string()]);
        assert_eq!(session.state, MonitorState::Scanning);

        let second = manager
            .start_with_source(&rolls(&["21CS050"]), Box::new(FakeSource::working()), Role::Student)
            .await
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(manager.status().await.session.unwrap().session_id, second);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let manual = manager.capture(None).await.unwrap();
        assert_eq!(manual.trigger, Trigger::Manual);
        assert_eq!(manual.created_by, Role::Student);
        assert_eq!(manual.roll_number, "21CS050");

        assert!(manager.stop().await);
        assert!(!manager.stop().await);
        assert!(matches!(manager.capture(None).await, Err(SessionError::NoSession)));

        let records = manager.list(&DetectionFilter::default()).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(store.len(), 3);
        let by_roll = |roll: &str| records.iter().filter(|r| r.roll_number == roll).count();
        assert_eq!(by_roll("21CS042"), 1);
        assert_eq!(by_roll("21CS050"), 2);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_models_loading_defers_references() {
        let engine = FakeEngine::ready(vec![vec![1.0, 0.0]]);
        engine.set_state(ModelState::Loading);
        let store = Arc::new(MemoryStore::default());
        let (manager, dir) = manager(engine.clone(), store.clone());

        manager
            .start_with_source(&rolls(&["21CS042"]), Box::new(FakeSource::working()), Role::Admin)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(
            manager.status().await.session.unwrap().state,
            MonitorState::ModelsLoading
        );

        engine.set_state(ModelState::Ready);
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        manager.stop().await;
        assert_eq!(store.len(), 1);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_history_operations() {
        let store = Arc::new(MemoryStore::default());
        let (manager, dir) = manager(FakeEngine::ready(Vec::new()), store.clone());
        let a = store
            .append(crate::store::tests::sample("1", "Asha", chrono::Utc::now()))
            .await
            .unwrap();
        store
            .append(crate::store::tests::sample("2", "Ravi", chrono::Utc::now()))
            .await
            .unwrap();

        assert_eq!(manager.get(&a.id).await.unwrap().map(|r| r.roll_number), Some("1".to_string()));
        assert!(manager.delete(&a.id).await.unwrap());
        assert!(manager.get(&a.id).await.unwrap().is_none());
        assert!(!manager.delete(&a.id).await.unwrap());
        assert_eq!(manager.clear().await.unwrap(), 1);
        assert_eq!(manager.students().unwrap().len(), 2);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
