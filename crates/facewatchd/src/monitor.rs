//! The live matching loop.
//!
//! One monitor runs per session. Every tick it grabs a frame, asks the engine
//! for faces, compares them with each target descriptor and, when a target
//! matches outside its cooldown, stores a screenshot record.
//!
//! A cycle has two halves. Observation (capture, analysis, decision) races
//! the session's cancellation token and is simply dropped on stop. Persisting
//! starts only after a final cancellation check and is never interrupted, so a
//! stopped session leaves either a complete record or none.

use crate::engine::{EngineError, FaceEngine, ModelState};
use crate::store::{DetectionRecord, DetectionStore, NewDetection, Role, StoreError, Trigger};
use chrono::Utc;
use facewatch_core::{Cooldown, DetectedFace, Descriptor, DistanceMatcher, Matcher, Target};
use facewatch_hw::{CameraMode, Frame, FrameError, FrameSource};
use image::RgbImage;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Fraction of dark pixels above which a frame counts as no signal.
const DARK_FRAME_THRESHOLD: f32 = 0.95;
const SCREENSHOT_QUALITY: u8 = 85;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("a session needs at least one target")]
    NoTargets,
    #[error("roll number {0} is not part of this session")]
    UnknownTarget(String),
    #[error("no frame has been captured yet")]
    NoFrame,
    #[error("reference photo for {roll}: {reason}")]
    Reference { roll: String, reason: String },
    #[error("screenshot encoding failed: {0}")]
    Screenshot(#[from] FrameError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("session stopped")]
    Stopped,
}

/// Loop timing and match threshold.
#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    pub match_distance: f32,
    pub cooldown: Duration,
    /// Poll period for live cameras and streams.
    pub live_interval: Duration,
    /// Poll period for still-image URLs.
    pub snapshot_interval: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            match_distance: facewatch_core::DEFAULT_MATCH_DISTANCE,
            cooldown: facewatch_core::debounce::DEFAULT_COOLDOWN,
            live_interval: Duration::from_millis(1000),
            snapshot_interval: Duration::from_millis(2000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Starting,
    Scanning,
    CameraUnavailable,
    ModelsLoading,
    ModelFailed,
    ReferenceFailed,
    StoreFailed,
    Stopped,
}

/// Snapshot published after every cycle.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub session_id: String,
    pub state: MonitorState,
    pub camera: String,
    pub camera_mode: CameraMode,
    pub targets: Vec<String>,
    /// Faces found in the last analyzed frame.
    pub faces: usize,
    /// Best similarity per target roll number in the last analyzed frame.
    pub similarity: BTreeMap<String, f32>,
    /// Records written by this session.
    pub records: u64,
    pub last_error: Option<String>,
}

/// One identity a session looks for.
#[derive(Clone)]
pub struct SessionTarget {
    pub roll_number: String,
    pub name: String,
    pub reference: Arc<RgbImage>,
    /// Computed lazily by the loop when the models were not ready at start.
    pub descriptor: Option<Descriptor>,
}

/// Describe the most confident face of a reference photo.
pub async fn describe_reference(
    engine: &dyn FaceEngine,
    roll_number: &str,
    image: Arc<RgbImage>,
) -> Result<Descriptor, MonitorError> {
    let reference_error = |reason: String| MonitorError::Reference {
        roll: roll_number.to_string(),
        reason,
    };
    let faces = engine.analyze(image).await.map_err(|e| reference_error(e.to_string()))?;
    faces
        .into_iter()
        .max_by(|a, b| a.bbox.confidence.total_cmp(&b.bbox.confidence))
        .map(|face| face.descriptor)
        .ok_or_else(|| reference_error("no face found in the reference photo".into()))
}

struct Slot {
    roll_number: String,
    name: String,
    reference: Arc<RgbImage>,
    target: Option<Target>,
}

/// What the loop last saw; read by manual captures.
#[derive(Default)]
struct Live {
    frame: Option<Frame>,
    /// Last (similarity, distance) per roll number from a frame with faces.
    observed: HashMap<String, (f32, f32)>,
}

struct Shared {
    status: watch::Sender<MonitorStatus>,
    live: Mutex<Live>,
}

impl Shared {
    fn live(&self) -> std::sync::MutexGuard<'_, Live> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Labels copied into every record of a session.
#[derive(Clone)]
struct RecordContext {
    location: String,
    camera_mode: CameraMode,
    role: Role,
}

impl RecordContext {
    fn detection(
        &self,
        roll_number: &str,
        name: &str,
        jpeg: Vec<u8>,
        similarity: f32,
        distance: f32,
        trigger: Trigger,
    ) -> NewDetection {
        NewDetection {
            timestamp: Utc::now(),
            roll_number: roll_number.to_string(),
            student_name: name.to_string(),
            screenshot_jpeg: jpeg,
            location: self.location.clone(),
            camera_mode: self.camera_mode,
            similarity,
            distance,
            created_by: self.role,
            trigger,
        }
    }
}

/// A match that passed the threshold and the cooldown.
struct Hit {
    slot: usize,
    similarity: f32,
    distance: f32,
}

struct Cycle {
    frame: Frame,
    hits: Vec<Hit>,
    observed_at: std::time::Instant,
}

pub struct Monitor {
    session_id: String,
    source: Box<dyn FrameSource>,
    engine: Arc<dyn FaceEngine>,
    store: Arc<dyn DetectionStore>,
    slots: Vec<Slot>,
    matcher: DistanceMatcher,
    cooldown: Cooldown,
    settings: MonitorSettings,
    context: RecordContext,
    shared: Arc<Shared>,
}

impl Monitor {
    pub fn new(
        session_id: String,
        source: Box<dyn FrameSource>,
        engine: Arc<dyn FaceEngine>,
        store: Arc<dyn DetectionStore>,
        targets: Vec<SessionTarget>,
        settings: MonitorSettings,
        role: Role,
    ) -> Result<Self, MonitorError> {
        if targets.is_empty() {
            return Err(MonitorError::NoTargets);
        }

        let context = RecordContext {
            location: source.describe(),
            camera_mode: source.mode(),
            role,
        };
        let slots: Vec<Slot> = targets
            .into_iter()
            .map(|t| Slot {
                target: t.descriptor.map(|descriptor| Target {
                    id: t.roll_number.clone(),
                    label: t.name.clone(),
                    descriptor,
                }),
                roll_number: t.roll_number,
                name: t.name,
                reference: t.reference,
            })
            .collect();

        let (status, _) = watch::channel(MonitorStatus {
            session_id: session_id.clone(),
            state: MonitorState::Starting,
            camera: context.location.clone(),
            camera_mode: context.camera_mode,
            targets: slots.iter().map(|s| s.roll_number.clone()).collect(),
            faces: 0,
            similarity: BTreeMap::new(),
            records: 0,
            last_error: None,
        });

        Ok(Self {
            session_id,
            source,
            engine,
            store,
            slots,
            matcher: DistanceMatcher {
                max_distance: settings.match_distance,
            },
            cooldown: Cooldown::new(settings.cooldown),
            settings,
            context,
            shared: Arc::new(Shared {
                status,
                live: Mutex::new(Live::default()),
            }),
        })
    }

    /// Start the loop on the runtime.
    pub fn spawn(self) -> MonitorHandle {
        let cancel = CancellationToken::new();
        let session_id = self.session_id.clone();
        let shared = Arc::clone(&self.shared);
        let store = Arc::clone(&self.store);
        let targets = self
            .slots
            .iter()
            .map(|s| (s.roll_number.clone(), s.name.clone()))
            .collect();
        let context = self.context.clone();

        let task = tokio::spawn(self.run(cancel.clone()));
        MonitorHandle {
            session_id,
            cancel,
            task: Some(task),
            shared,
            store,
            targets,
            context,
        }
    }

    fn period(&self, snapshot: bool) -> Duration {
        if snapshot {
            self.settings.snapshot_interval
        } else {
            self.settings.live_interval
        }
    }

    async fn run(mut self, cancel: CancellationToken) {
        let mut snapshot = self.source.is_snapshot();
        let period = self.period(snapshot);
        tracing::info!(
            session = %self.session_id,
            camera = %self.context.location,
            period_ms = period.as_millis() as u64,
            targets = self.slots.len(),
            "monitor started"
        );

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let cycle = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                cycle = self.observe() => cycle,
            };

            if cancel.is_cancelled() {
                break;
            }
            if let Some(cycle) = cycle {
                self.persist(cycle, &cancel).await;
            }

            // A source may only learn what it is after the first grab.
            if self.source.is_snapshot() != snapshot {
                snapshot = !snapshot;
                let period = self.period(snapshot);
                tracing::info!(
                    session = %self.session_id,
                    snapshot,
                    period_ms = period.as_millis() as u64,
                    "poll period changed"
                );
                ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            }
        }

        self.shared.status.send_modify(|s| s.state = MonitorState::Stopped);
        tracing::info!(session = %self.session_id, "monitor stopped");
    }

    /// Capture, analyze and decide. Returns `None` when the cycle is skipped.
    async fn observe(&mut self) -> Option<Cycle> {
        match self.engine.state() {
            ModelState::Loading => {
                self.skip(MonitorState::ModelsLoading, EngineError::NotReady.to_string());
                return None;
            }
            ModelState::Failed(reason) => {
                self.skip(MonitorState::ModelFailed, reason);
                return None;
            }
            ModelState::Ready => {}
        }

        if let Err(e) = self.ensure_descriptors().await {
            self.skip(MonitorState::ReferenceFailed, e.to_string());
            return None;
        }

        let frame = match self.source.grab().await {
            Ok(frame) => frame,
            Err(e) => {
                self.skip(MonitorState::CameraUnavailable, e.to_string());
                return None;
            }
        };
        if frame.is_dark(DARK_FRAME_THRESHOLD) {
            self.skip(
                MonitorState::CameraUnavailable,
                "frame is dark (lens covered or no signal)".into(),
            );
            return None;
        }
        self.shared.live().frame = Some(frame.clone());

        let faces = match self.engine.analyze(Arc::clone(&frame.image)).await {
            Ok(faces) => faces,
            Err(EngineError::NotReady) => {
                self.skip(MonitorState::ModelsLoading, EngineError::NotReady.to_string());
                return None;
            }
            Err(e) => {
                self.skip(MonitorState::ModelFailed, e.to_string());
                return None;
            }
        };

        let observed_at = Instant::now().into_std();
        let (hits, similarity) = self.decide(&faces, observed_at);
        self.shared.status.send_modify(|s| {
            s.state = MonitorState::Scanning;
            s.faces = faces.len();
            s.similarity = similarity;
            s.last_error = None;
        });

        Some(Cycle {
            frame,
            hits,
            observed_at,
        })
    }

    fn decide(&self, faces: &[DetectedFace], now: std::time::Instant) -> (Vec<Hit>, BTreeMap<String, f32>) {
        let mut hits = Vec::new();
        let mut similarity = BTreeMap::new();
        let mut live = self.shared.live();

        for (idx, slot) in self.slots.iter().enumerate() {
            let Some(target) = &slot.target else {
                continue;
            };
            let result = self.matcher.compare(target, faces);
            similarity.insert(slot.roll_number.clone(), result.similarity);
            if result.face_index.is_some() {
                live.observed
                    .insert(slot.roll_number.clone(), (result.similarity, result.distance));
            }
            if !result.matched {
                continue;
            }
            if self.cooldown.ready(&slot.roll_number, now) {
                hits.push(Hit {
                    slot: idx,
                    similarity: result.similarity,
                    distance: result.distance,
                });
            } else {
                tracing::trace!(
                    roll = %slot.roll_number,
                    remaining_ms = self.cooldown.remaining(&slot.roll_number, now).as_millis() as u64,
                    "match suppressed by cooldown"
                );
            }
        }
        (hits, similarity)
    }

    async fn ensure_descriptors(&mut self) -> Result<(), MonitorError> {
        for slot in self.slots.iter_mut().filter(|s| s.target.is_none()) {
            let descriptor =
                describe_reference(self.engine.as_ref(), &slot.roll_number, Arc::clone(&slot.reference)).await?;
            tracing::info!(roll = %slot.roll_number, "reference descriptor computed");
            slot.target = Some(Target {
                id: slot.roll_number.clone(),
                label: slot.name.clone(),
                descriptor,
            });
        }
        Ok(())
    }

    async fn persist(&mut self, cycle: Cycle, cancel: &CancellationToken) {
        if cycle.hits.is_empty() {
            return;
        }
        let jpeg = match cycle.frame.to_jpeg(SCREENSHOT_QUALITY) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                self.skip(MonitorState::StoreFailed, format!("screenshot encoding failed: {e}"));
                return;
            }
        };

        for hit in cycle.hits {
            if cancel.is_cancelled() {
                return;
            }
            let slot = &self.slots[hit.slot];
            let detection = self.context.detection(
                &slot.roll_number,
                &slot.name,
                jpeg.clone(),
                hit.similarity,
                hit.distance,
                Trigger::Match,
            );

            match self.store.append(detection).await {
                Ok(record) => {
                    self.cooldown.arm(&slot.roll_number, cycle.observed_at);
                    self.shared.status.send_modify(|s| s.records += 1);
                    tracing::info!(
                        session = %self.session_id,
                        roll = %record.roll_number,
                        similarity = record.similarity,
                        id = %record.id,
                        "match recorded"
                    );
                }
                Err(e) => {
                    let roll = slot.roll_number.clone();
                    self.skip(MonitorState::StoreFailed, format!("saving match for {roll}: {e}"));
                }
            }
        }
    }

    fn skip(&self, state: MonitorState, error: String) {
        tracing::warn!(session = %self.session_id, state = ?state, error = %error, "cycle skipped");
        self.shared.status.send_modify(|s| {
            s.state = state;
            if state != MonitorState::StoreFailed {
                s.faces = 0;
                s.similarity.clear();
            }
            s.last_error = Some(error);
        });
    }
}

/// Control side of a running monitor.
pub struct MonitorHandle {
    session_id: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    shared: Arc<Shared>,
    store: Arc<dyn DetectionStore>,
    targets: Vec<(String, String)>,
    context: RecordContext,
}

impl MonitorHandle {
    pub fn status(&self) -> MonitorStatus {
        self.shared.status.borrow().clone()
    }

    /// Cancel the loop and wait for it to finish. Returns the final status.
    pub async fn stop(mut self) -> MonitorStatus {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!(session = %self.session_id, error = %e, "monitor task failed");
            }
        }
        let mut status = self.status();
        status.state = MonitorState::Stopped;
        status
    }

    /// Record the last frame for a target on demand.
    ///
    /// Uses the latest similarity seen for that target (0 when none) and
    /// leaves the cooldown untouched.
    pub async fn capture(&self, roll_number: Option<&str>) -> Result<DetectionRecord, MonitorError> {
        if self.cancel.is_cancelled() {
            return Err(MonitorError::Stopped);
        }

        let (roll, name) = match roll_number.map(str::trim).filter(|r| !r.is_empty()) {
            Some(wanted) => self
                .targets
                .iter()
                .find(|(roll, _)| roll.eq_ignore_ascii_case(wanted))
                .ok_or_else(|| MonitorError::UnknownTarget(wanted.to_string()))?,
            None => self.targets.first().ok_or(MonitorError::NoTargets)?,
        };

        let (frame, (similarity, distance)) = {
            let live = self.shared.live();
            let frame = live.frame.clone().ok_or(MonitorError::NoFrame)?;
            (frame, live.observed.get(roll).copied().unwrap_or((0.0, 1.0)))
        };

        let jpeg = frame.to_jpeg(SCREENSHOT_QUALITY)?;
        let detection = self
            .context
            .detection(roll, name, jpeg, similarity, distance, Trigger::Manual);
        let record = self.store.append(detection).await?;

        self.shared.status.send_modify(|s| s.records += 1);
        tracing::info!(session = %self.session_id, roll = %roll, id = %record.id, "manual capture recorded");
        Ok(record)
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::tests::MemoryStore;
    use async_trait::async_trait;
    use facewatch_core::BoundingBox;
    use facewatch_hw::CameraError;
    use image::Rgb;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Engine returning the same scripted faces for every image.
    pub(crate) struct FakeEngine {
        pub state: Mutex<ModelState>,
        pub faces: Mutex<Vec<Vec<f32>>>,
        pub delay: Duration,
        pub calls: AtomicUsize,
    }

    impl FakeEngine {
        pub fn ready(faces: Vec<Vec<f32>>) -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(ModelState::Ready),
                faces: Mutex::new(faces),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            })
        }

        pub fn set_state(&self, state: ModelState) {
            *self.state.lock().unwrap() = state;
        }

        pub fn set_faces(&self, faces: Vec<Vec<f32>>) {
            *self.faces.lock().unwrap() = faces;
        }
    }

    #[async_trait]
    impl FaceEngine for FakeEngine {
        fn state(&self) -> ModelState {
            self.state.lock().unwrap().clone()
        }

        async fn analyze(&self, _image: Arc<RgbImage>) -> Result<Vec<DetectedFace>, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match self.state() {
                ModelState::Loading => return Err(EngineError::NotReady),
                ModelState::Failed(reason) => return Err(EngineError::ModelFailed(reason)),
                ModelState::Ready => {}
            }
            let faces = self.faces.lock().unwrap().clone();
            Ok(faces
                .into_iter()
                .enumerate()
                .map(|(i, values)| DetectedFace {
                    bbox: BoundingBox {
                        x: 10.0 * i as f32,
                        y: 0.0,
                        width: 8.0,
                        height: 8.0,
                        confidence: 0.9 - 0.1 * i as f32,
                        landmarks: None,
                    },
                    descriptor: Descriptor::new(values),
                })
                .collect())
        }
    }

    /// Camera yielding a grey frame, or an error while `failing` is set.
    pub(crate) struct FakeSource {
        pub failing: Arc<AtomicBool>,
        pub dark: bool,
        pub snapshot: bool,
        /// Turn into a snapshot source on the first grab.
        pub becomes_snapshot: bool,
        pub grabs: Arc<AtomicUsize>,
    }

    impl FakeSource {
        pub fn working() -> Self {
            Self {
                failing: Arc::new(AtomicBool::new(false)),
                dark: false,
                snapshot: false,
                becomes_snapshot: false,
                grabs: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl FrameSource for FakeSource {
        async fn grab(&mut self) -> Result<Frame, CameraError> {
            let n = self.grabs.fetch_add(1, Ordering::SeqCst);
            if self.becomes_snapshot {
                self.snapshot = true;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(CameraError::Stream("connection refused".into()));
            }
            let shade = if self.dark { 5 } else { 120 };
            Ok(Frame::new(RgbImage::from_pixel(8, 8, Rgb([shade, shade, shade])), n as u32))
        }

        fn describe(&self) -> String {
            "Fake Camera".to_string()
        }

        fn mode(&self) -> CameraMode {
            CameraMode::Network
        }

        fn is_snapshot(&self) -> bool {
            self.snapshot
        }
    }

    pub(crate) fn target(roll: &str, descriptor: Option<Vec<f32>>) -> SessionTarget {
        SessionTarget {
            roll_number: roll.to_string(),
            name: format!("Student {roll}"),
            reference: Arc::new(RgbImage::new(4, 4)),
            descriptor: descriptor.map(Descriptor::new),
        }
    }

    fn start(
        engine: Arc<FakeEngine>,
        source: FakeSource,
        store: Arc<MemoryStore>,
        targets: Vec<SessionTarget>,
    ) -> MonitorHandle {
        Monitor::new(
            "session-1".into(),
            Box::new(source),
            engine,
            store,
            targets,
            MonitorSettings::default(),
            Role::Admin,
        )
        .unwrap()
        .spawn()
    }

    async fn run_for(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_records_once_per_cooldown_window() {
        let engine = FakeEngine::ready(vec![vec![1.0, 0.0]]);
        let store = Arc::new(MemoryStore::default());
        let handle = start(engine, FakeSource::working(), store.clone(), vec![target("7", Some(vec![1.0, 0.0]))]);

        // Ticks at 0..=10 s; records at 0, 5 and 10 s.
        run_for(10_500).await;
        let status = handle.stop().await;

        let records = store.snapshot();
        assert_eq!(records.len(), 3);
        assert_eq!(status.records, 3);
        for record in &records {
            assert_eq!(record.roll_number, "7");
            assert_eq!(record.trigger, Trigger::Match);
            assert_eq!(record.location, "Fake Camera");
            assert_eq!(record.camera_mode, CameraMode::Network);
            assert!((0.0..=1.0).contains(&record.similarity));
            assert_eq!(record.similarity, 1.0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_record_above_threshold() {
        let engine = FakeEngine::ready(vec![vec![0.0, 1.0], vec![0.0, 0.8]]);
        let store = Arc::new(MemoryStore::default());
        let handle = start(engine, FakeSource::working(), store.clone(), vec![target("7", Some(vec![1.0, 0.0]))]);

        run_for(3_500).await;
        let status = handle.status();
        assert_eq!(status.state, MonitorState::Scanning);
        assert_eq!(status.faces, 2);
        assert_eq!(status.similarity.get("7").copied(), Some(0.0));
        handle.stop().await;
        assert_eq!(store.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closest_face_is_used() {
        let engine = FakeEngine::ready(vec![vec![0.5, 0.0], vec![0.9, 0.0]]);
        let store = Arc::new(MemoryStore::default());
        let handle = start(engine, FakeSource::working(), store.clone(), vec![target("7", Some(vec![1.0, 0.0]))]);

        run_for(500).await;
        handle.stop().await;
        let records = store.snapshot();
        assert_eq!(records.len(), 1);
        assert!((records[0].distance - 0.1).abs() < 1e-5);
        assert!((records[0].similarity - 0.9).abs() < 1e-5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_analysis_records_nothing() {
        let engine = Arc::new(FakeEngine {
            state: Mutex::new(ModelState::Ready),
            faces: Mutex::new(vec![vec![1.0, 0.0]]),
            delay: Duration::from_secs(3),
            calls: AtomicUsize::new(0),
        });
        let store = Arc::new(MemoryStore::default());
        let handle = start(
            engine.clone(),
            FakeSource::working(),
            store.clone(),
            vec![target("7", Some(vec![1.0, 0.0]))],
        );

        run_for(1_000).await;
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
        let status = handle.stop().await;
        assert_eq!(status.state, MonitorState::Stopped);

        run_for(5_000).await;
        assert_eq!(store.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_models_loading_skips_cycles() {
        let engine = FakeEngine::ready(vec![vec![1.0, 0.0]]);
        engine.set_state(ModelState::Loading);
        let store = Arc::new(MemoryStore::default());
        let handle = start(
            engine.clone(),
            FakeSource::working(),
            store.clone(),
            vec![target("7", Some(vec![1.0, 0.0]))],
        );

        run_for(2_500).await;
        let status = handle.status();
        assert_eq!(status.state, MonitorState::ModelsLoading);
        assert!(status.last_error.is_some());
        assert_eq!(store.len(), 0);

        engine.set_state(ModelState::Ready);
        run_for(1_000).await;
        assert_eq!(store.len(), 1);
        assert_eq!(handle.status().state, MonitorState::Scanning);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_failure_is_reported() {
        let engine = FakeEngine::ready(vec![vec![1.0, 0.0]]);
        engine.set_state(ModelState::Failed("det_10g.onnx missing".into()));
        let store = Arc::new(MemoryStore::default());
        let handle = start(engine, FakeSource::working(), store.clone(), vec![target("7", Some(vec![1.0, 0.0]))]);

        run_for(1_500).await;
        let status = handle.status();
        assert_eq!(status.state, MonitorState::ModelFailed);
        assert_eq!(status.last_error.as_deref(), Some("det_10g.onnx missing"));
        handle.stop().await;
        assert_eq!(store.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_reference_descriptor() {
        let engine = FakeEngine::ready(vec![vec![1.0, 0.0]]);
        let store = Arc::new(MemoryStore::default());
        let handle = start(engine, FakeSource::working(), store.clone(), vec![target("7", None)]);

        run_for(500).await;
        handle.stop().await;
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reference_without_face_fails_and_retries() {
        let engine = FakeEngine::ready(Vec::new());
        let store = Arc::new(MemoryStore::default());
        let handle = start(engine.clone(), FakeSource::working(), store.clone(), vec![target("7", None)]);

        run_for(1_500).await;
        let status = handle.status();
        assert_eq!(status.state, MonitorState::ReferenceFailed);
        assert!(status.last_error.unwrap().contains('7'));

        engine.set_faces(vec![vec![1.0, 0.0]]);
        run_for(1_000).await;
        handle.stop().await;
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_camera_unavailable_then_recovers() {
        let engine = FakeEngine::ready(vec![vec![1.0, 0.0]]);
        let store = Arc::new(MemoryStore::default());
        let source = FakeSource::working();
        let failing = source.failing.clone();
        failing.store(true, Ordering::SeqCst);
        let handle = start(engine, source, store.clone(), vec![target("7", Some(vec![1.0, 0.0]))]);

        run_for(2_500).await;
        let status = handle.status();
        assert_eq!(status.state, MonitorState::CameraUnavailable);
        assert!(status.last_error.unwrap().contains("connection refused"));
        assert_eq!(store.len(), 0);

        failing.store(false, Ordering::SeqCst);
        run_for(1_000).await;
        handle.stop().await;
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dark_frames_are_skipped() {
        let engine = FakeEngine::ready(vec![vec![1.0, 0.0]]);
        let store = Arc::new(MemoryStore::default());
        let source = FakeSource {
            dark: true,
            ..FakeSource::working()
        };
        let handle = start(engine.clone(), source, store.clone(), vec![target("7", Some(vec![1.0, 0.0]))]);

        run_for(2_500).await;
        assert_eq!(handle.status().state, MonitorState::CameraUnavailable);
        handle.stop().await;
        assert_eq!(store.len(), 0);
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_targets_have_independent_cooldowns() {
        let engine = FakeEngine::ready(vec![vec![1.0, 0.0]]);
        let store = Arc::new(MemoryStore::default());
        let handle = start(
            engine.clone(),
            FakeSource::working(),
            store.clone(),
            vec![target("A", Some(vec![1.0, 0.0])), target("B", Some(vec![0.0, 1.0]))],
        );

        run_for(1_500).await;
        engine.set_faces(vec![vec![0.0, 1.0]]);
        run_for(1_000).await;
        handle.stop().await;

        let rolls: Vec<String> = store.snapshot().into_iter().map(|r| r.roll_number).collect();
        assert_eq!(rolls, vec!["A".to_string(), "B".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_does_not_arm_cooldown() {
        let engine = FakeEngine::ready(vec![vec![1.0, 0.0]]);
        let store = Arc::new(MemoryStore::default());
        *store.fail_appends.lock().unwrap() = 1;
        let handle = start(engine, FakeSource::working(), store.clone(), vec![target("7", Some(vec![1.0, 0.0]))]);

        run_for(500).await;
        let status = handle.status();
        assert_eq!(status.state, MonitorState::StoreFailed);
        assert!(status.last_error.is_some());
        assert_eq!(store.len(), 0);

        // The next matching frame retries immediately.
        run_for(1_000).await;
        let status = handle.stop().await;
        assert_eq!(store.len(), 1);
        assert_eq!(status.records, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_sources_poll_slower() {
        let engine = FakeEngine::ready(Vec::new());
        let store = Arc::new(MemoryStore::default());
        let source = FakeSource {
            snapshot: true,
            ..FakeSource::working()
        };
        let grabs = source.grabs.clone();
        let handle = start(engine, source, store, vec![target("7", Some(vec![1.0, 0.0]))]);

        run_for(4_500).await;
        handle.stop().await;
        assert_eq!(grabs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_turning_snapshot_slows_polling() {
        let engine = FakeEngine::ready(Vec::new());
        let store = Arc::new(MemoryStore::default());
        let source = FakeSource {
            becomes_snapshot: true,
            ..FakeSource::working()
        };
        let grabs = source.grabs.clone();
        let handle = start(engine, source, store, vec![target("7", Some(vec![1.0, 0.0]))]);

        // Grabs at 0s, 2s and 4s rather than once a second.
        run_for(4_500).await;
        handle.stop().await;
        assert_eq!(grabs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_saving_skips_remaining_hits() {
        let engine = FakeEngine::ready(vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        let store = Arc::new(MemoryStore {
            append_delay: Duration::from_millis(300),
            ..Default::default()
        });
        let handle = start(
            engine,
            FakeSource::working(),
            store.clone(),
            vec![target("A", Some(vec![1.0, 0.0])), target("B", Some(vec![0.0, 1.0]))],
        );

        // The first append is still sleeping when stop arrives.
        run_for(100).await;
        let status = handle.stop().await;

        let records = store.snapshot();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].roll_number, "A");
        assert_eq!(status.records, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_capture() {
        let engine = FakeEngine::ready(Vec::new());
        let store = Arc::new(MemoryStore::default());
        let handle = start(
            engine.clone(),
            FakeSource::working(),
            store.clone(),
            vec![target("A", Some(vec![1.0, 0.0])), target("B", Some(vec![0.0, 1.0]))],
        );

        assert!(matches!(handle.capture(None).await, Err(MonitorError::NoFrame)));
        run_for(500).await;

        let record = handle.capture(None).await.unwrap();
        assert_eq!(record.roll_number, "A");
        assert_eq!(record.trigger, Trigger::Manual);
        assert_eq!(record.similarity, 0.0);

        assert!(matches!(
            handle.capture(Some("Z")).await,
            Err(MonitorError::UnknownTarget(_))
        ));

        // A manual capture does not hold back the next real match.
        engine.set_faces(vec![vec![0.0, 1.0]]);
        let b = handle.capture(Some("b")).await.unwrap();
        assert_eq!(b.roll_number, "B");
        run_for(1_000).await;

        let status = handle.stop().await;
        let records = store.snapshot();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].roll_number, "B");
        assert_eq!(records[2].trigger, Trigger::Match);
        assert_eq!(status.records, 3);
    }

    #[test]
    fn test_needs_targets() {
        let result = Monitor::new(
            "s".into(),
            Box::new(FakeSource::working()),
            FakeEngine::ready(Vec::new()),
            Arc::new(MemoryStore::default()),
            Vec::new(),
            MonitorSettings::default(),
            Role::General,
        );
        assert!(matches!(result, Err(MonitorError::NoTargets)));
    }
}
