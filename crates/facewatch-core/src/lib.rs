//! facewatch-core: face descriptors and target matching.
//!
//! The live monitor only needs three things from this crate: a way to turn a
//! frame into faces with descriptors ([`FaceAnalyzer`]), a distance test
//! against a target ([`DistanceMatcher`]), and per-target suppression of
//! repeated matches ([`Cooldown`]).

pub mod alignment;
pub mod analyzer;
pub mod debounce;
pub mod detector;
pub mod matcher;
pub mod recognizer;
pub mod types;

pub use analyzer::{default_model_dir, AnalyzerError, FaceAnalyzer, OnnxAnalyzer};
pub use debounce::Cooldown;
pub use detector::FaceDetector;
pub use matcher::{DistanceMatcher, Matcher, DEFAULT_MATCH_DISTANCE};
pub use recognizer::FaceRecognizer;
pub use types::{similarity_from_distance, BoundingBox, DetectedFace, Descriptor, MatchResult, Target};
