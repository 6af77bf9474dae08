use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Face descriptor (embedding) produced by the recognizer for one face crop.
///
/// Lives only as long as the monitoring session that computed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    pub values: Vec<f32>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Euclidean distance between two descriptors.
    ///
    /// Descriptors of different lengths come from different models and are
    /// never comparable: the distance is `f32::INFINITY`.
    pub fn distance(&self, other: &Descriptor) -> f32 {
        if self.values.len() != other.values.len() || self.values.is_empty() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// Map a descriptor distance onto a similarity score in [0, 1].
pub fn similarity_from_distance(distance: f32) -> f32 {
    if !distance.is_finite() {
        return 0.0;
    }
    (1.0 - distance).clamp(0.0, 1.0)
}

/// One face found in a frame: where it is and what it looks like.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub descriptor: Descriptor,
}

/// The identity a session is searching for.
#[derive(Debug, Clone)]
pub struct Target {
    /// Stable identifier (the student's roll number).
    pub id: String,
    /// Display name.
    pub label: String,
    pub descriptor: Descriptor,
}

/// Result of comparing the faces of one frame against one target.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Smallest distance seen in the frame (`f32::INFINITY` when no faces).
    pub distance: f32,
    /// Similarity derived from `distance`, in [0, 1].
    pub similarity: f32,
    /// Index of the closest face in the analyzed frame.
    pub face_index: Option<usize>,
}

impl MatchResult {
    pub fn no_faces() -> Self {
        Self {
            matched: false,
            distance: f32::INFINITY,
            similarity: 0.0,
            face_index: None,
        }
    }
}
