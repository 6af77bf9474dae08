use async_trait::async_trait;
use facewatch_core::{AnalyzerError, DetectedFace, FaceAnalyzer};
use image::RgbImage;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("face models are still loading")]
    NotReady,
    #[error("face models failed to load: {0}")]
    ModelFailed(String),
    #[error("analyzer error: {0}")]
    Analyzer(#[from] AnalyzerError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Load state of the face models, published by the engine thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelState {
    Loading,
    Ready,
    Failed(String),
}

impl ModelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelState::Loading => "loading",
            ModelState::Ready => "ready",
            ModelState::Failed(_) => "failed",
        }
    }
}

/// What the monitor needs from the inference side.
#[async_trait]
pub trait FaceEngine: Send + Sync {
    fn state(&self) -> ModelState;

    /// Detect and describe every face in `image`, highest confidence first.
    async fn analyze(&self, image: Arc<RgbImage>) -> Result<Vec<DetectedFace>, EngineError>;
}

/// Messages sent to the engine thread.
enum EngineRequest {
    Analyze {
        image: Arc<RgbImage>,
        reply: oneshot::Sender<Result<Vec<DetectedFace>, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    state: watch::Receiver<ModelState>,
}

impl EngineHandle {
    /// Wait until loading has finished, successfully or not.
    pub async fn loaded(&self) -> ModelState {
        let mut rx = self.state.clone();
        match rx.wait_for(|s| *s != ModelState::Loading).await {
            Ok(state) => state.clone(),
            Err(_) => ModelState::Failed("engine thread exited".into()),
        }
    }
}

#[async_trait]
impl FaceEngine for EngineHandle {
    fn state(&self) -> ModelState {
        self.state.borrow().clone()
    }

    async fn analyze(&self, image: Arc<RgbImage>) -> Result<Vec<DetectedFace>, EngineError> {
        match self.state() {
            ModelState::Loading => return Err(EngineError::NotReady),
            ModelState::Failed(reason) => return Err(EngineError::ModelFailed(reason)),
            ModelState::Ready => {}
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Analyze {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// `loader` runs on that thread, so the daemon comes up immediately and
/// callers observe progress through [`FaceEngine::state`].
pub fn spawn_engine<F>(loader: F) -> Result<EngineHandle, EngineError>
where
    F: FnOnce() -> Result<Box<dyn FaceAnalyzer>, AnalyzerError> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
    let (state_tx, state_rx) = watch::channel(ModelState::Loading);

    std::thread::Builder::new()
        .name("facewatch-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let loaded = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(loader)) {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(payload) => Err(panic_reason(payload.as_ref())),
            };
            let mut analyzer = match loaded {
                Ok(analyzer) => {
                    tracing::info!("face models loaded");
                    state_tx.send_replace(ModelState::Ready);
                    Ok(analyzer)
                }
                Err(reason) => {
                    tracing::error!(error = %reason, "face models failed to load");
                    state_tx.send_replace(ModelState::Failed(reason.clone()));
                    Err(reason)
                }
            };

            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Analyze { image, reply } => {
                        let result = match analyzer.as_mut() {
                            Ok(analyzer) => analyzer.analyze(&image).map_err(EngineError::from),
                            Err(reason) => Err(EngineError::ModelFailed(reason.clone())),
                        };
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, state: state_rx })
}

fn panic_reason(payload: &(dyn std::any::Any + Send)) -> String {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("model loading panicked: {message}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use facewatch_core::{BoundingBox, Descriptor};

    struct OneFace;

    impl FaceAnalyzer for OneFace {
        fn analyze(&mut self, frame: &RgbImage) -> Result<Vec<DetectedFace>, AnalyzerError> {
            Ok(vec![DetectedFace {
                bbox: BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: frame.width() as f32,
                    height: frame.height() as f32,
                    confidence: 0.9,
                    landmarks: None,
                },
                descriptor: Descriptor::new(vec![1.0, 0.0]),
            }])
        }
    }

    #[tokio::test]
    async fn test_analyze_after_load() {
        let engine = spawn_engine(|| Ok(Box::new(OneFace) as Box<dyn FaceAnalyzer>)).unwrap();
        assert_eq!(engine.loaded().await, ModelState::Ready);

        let faces = engine.analyze(Arc::new(RgbImage::new(4, 2))).await.unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].bbox.width, 4.0);
    }

    #[tokio::test]
    async fn test_load_failure_is_reported() {
        let engine = spawn_engine(|| {
            Err(AnalyzerError::Detector(
                facewatch_core::detector::DetectorError::ModelNotFound("det_10g.onnx".into()),
            ))
        })
        .unwrap();

        match engine.loaded().await {
            ModelState::Failed(reason) => assert!(reason.contains("det_10g.onnx"), "{reason}"),
            other => panic!("unexpected state: {other:?}"),
        }
        assert!(matches!(
            engine.analyze(Arc::new(RgbImage::new(1, 1))).await,
            Err(EngineError::ModelFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_load_panic_is_reported() {
        let engine = spawn_engine(|| panic!("ort init")).unwrap();

        match engine.loaded().await {
            ModelState::Failed(reason) => {
                assert!(reason.contains("panicked"), "{reason}");
                assert!(reason.contains("ort init"), "{reason}");
            }
            other => panic!("unexpected state: {other:?}"),
        }
        assert!(matches!(
            engine.analyze(Arc::new(RgbImage::new(1, 1))).await,
            Err(EngineError::ModelFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_not_ready_while_loading() {
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let engine = spawn_engine(move || {
            let _ = release_rx.recv();
            Ok(Box::new(OneFace) as Box<dyn FaceAnalyzer>)
        })
        .unwrap();

        assert_eq!(engine.state(), ModelState::Loading);
        assert!(matches!(
            engine.analyze(Arc::new(RgbImage::new(1, 1))).await,
            Err(EngineError::NotReady)
        ));

        release_tx.send(()).unwrap();
        assert_eq!(engine.loaded().await, ModelState::Ready);
    }
}
