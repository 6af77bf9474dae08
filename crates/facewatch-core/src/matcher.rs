//! Target matching by descriptor distance.

use crate::types::{similarity_from_distance, DetectedFace, MatchResult, Target};

/// Default maximum descriptor distance for a positive match.
pub const DEFAULT_MATCH_DISTANCE: f32 = 0.6;

/// Strategy for deciding whether any face in a frame is the target.
pub trait Matcher {
    fn compare(&self, target: &Target, faces: &[DetectedFace]) -> MatchResult;
}

/// Euclidean-distance matcher.
///
/// A face matches when its distance to the target descriptor is strictly
/// below `max_distance`. When several faces qualify, the closest one wins.
#[derive(Debug, Clone, Copy)]
pub struct DistanceMatcher {
    pub max_distance: f32,
}

impl Default for DistanceMatcher {
    fn default() -> Self {
        Self {
            max_distance: DEFAULT_MATCH_DISTANCE,
        }
    }
}

impl Matcher for DistanceMatcher {
    fn compare(&self, target: &Target, faces: &[DetectedFace]) -> MatchResult {
        let closest = faces
            .iter()
            .enumerate()
            .map(|(i, face)| (i, face.descriptor.distance(&target.descriptor)))
            .fold(None::<(usize, f32)>, |best, (i, d)| match best {
                Some((_, best_d)) if best_d <= d => best,
                _ => Some((i, d)),
            });

        let Some((idx, distance)) = closest else {
            return MatchResult::no_faces();
        };

        MatchResult {
            matched: distance < self.max_distance,
            distance,
            similarity: similarity_from_distance(distance),
            face_index: Some(idx),
        }
    }
}
