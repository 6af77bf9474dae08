//! The face model seam: frame in, faces with descriptors out.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::DetectedFace;
use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

/// Faces described per frame; extra detections are ignored.
const MAX_FACES_PER_FRAME: usize = 8;

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Anything that can find faces in a frame and describe them.
///
/// Implementations are driven from a single dedicated thread and may hold
/// mutable inference state.
pub trait FaceAnalyzer: Send {
    /// Detect faces and compute a descriptor for each, highest confidence first.
    fn analyze(&mut self, frame: &RgbImage) -> Result<Vec<DetectedFace>, AnalyzerError>;
}

/// SCRFD detection followed by ArcFace description.
pub struct OnnxAnalyzer {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxAnalyzer {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, AnalyzerError> {
        let detector = FaceDetector::load(&model_dir.join(SCRFD_MODEL_FILE))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(ARCFACE_MODEL_FILE))?;
        Ok(Self { detector, recognizer })
    }
}

impl FaceAnalyzer for OnnxAnalyzer {
    fn analyze(&mut self, frame: &RgbImage) -> Result<Vec<DetectedFace>, AnalyzerError> {
        let boxes = self.detector.detect(frame)?;
        tracing::trace!(faces = boxes.len(), "detector pass");

        boxes
            .into_iter()
            .filter(|b| b.landmarks.is_some())
            .take(MAX_FACES_PER_FRAME)
            .map(|bbox| {
                let descriptor = self.recognizer.extract(frame, &bbox)?;
                Ok(DetectedFace { bbox, descriptor })
            })
            .collect()
    }
}

/// Default model directory: `$XDG_DATA_HOME/facewatch/models`, falling back
/// to `~/.local/share/facewatch/models`.
pub fn default_model_dir() -> PathBuf {
    data_home().join("facewatch").join("models")
}

fn data_home() -> PathBuf {
    std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = std::env::var_os("HOME").unwrap_or_else(|| "/tmp".into());
            PathBuf::from(home).join(".local/share")
        })
}
