//! Face alignment via a 4-DOF similarity transform.
//!
//! Maps the five detected landmarks onto the ArcFace reference layout with a
//! closed-form least-squares fit, then warps the RGB frame into a 112×112 crop.

use image::{Rgb, RgbImage};

/// ArcFace reference landmarks for a 112×112 output.
pub(crate) const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// Similarity transform `p' = [[a, -b], [b, a]] · p + (tx, ty)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct SimilarityTransform {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl SimilarityTransform {
    /// Least-squares fit from `src` points onto `dst` points.
    ///
    /// Returns `None` when the source points are degenerate (all coincident).
    pub fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<Self> {
        let n = src.len() as f32;
        let (sx, sy) = centroid(src);
        let (dx, dy) = centroid(dst);

        let mut num_a = 0.0f32;
        let mut num_b = 0.0f32;
        let mut spread = 0.0f32;
        for (&(x, y), &(u, v)) in src.iter().zip(dst.iter()) {
            let (x, y) = (x - sx, y - sy);
            let (u, v) = (u - dx, v - dy);
            num_a += x * u + y * v;
            num_b += x * v - y * u;
            spread += x * x + y * y;
        }

        if spread / n < 1e-9 {
            return None;
        }

        let a = num_a / spread;
        let b = num_b / spread;
        Some(Self {
            a,
            b,
            tx: dx - (a * sx - b * sy),
            ty: dy - (b * sx + a * sy),
        })
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    pub fn inverse(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let ia = self.a / det;
        let ib = -self.b / det;
        Some(Self {
            a: ia,
            b: ib,
            tx: -(ia * self.tx - ib * self.ty),
            ty: -(ib * self.tx + ia * self.ty),
        })
    }
}

fn centroid(points: &[(f32, f32); 5]) -> (f32, f32) {
    let n = points.len() as f32;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
    (sx / n, sy / n)
}

/// Bilinear RGB sample; out-of-bounds neighbours contribute black.
fn sample_bilinear(frame: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;
    let (w, h) = (frame.width() as i64, frame.height() as i64);

    let px = |px: i64, py: i64| -> [f32; 3] {
        if px >= 0 && px < w && py >= 0 && py < h {
            let p = frame.get_pixel(px as u32, py as u32).0;
            [p[0] as f32, p[1] as f32, p[2] as f32]
        } else {
            [0.0; 3]
        }
    };

    let (tl, tr, bl, br) = (px(x0, y0), px(x0 + 1, y0), px(x0, y0 + 1), px(x0 + 1, y0 + 1));
    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = tl[c] * (1.0 - fx) + tr[c] * fx;
        let bottom = bl[c] * (1.0 - fx) + br[c] * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// Align a detected face to a canonical 112×112 RGB crop.
///
/// Degenerate landmarks produce an all-black crop; the recognizer still runs
/// and the resulting descriptor simply fails to match anything.
pub fn align_face(frame: &RgbImage, landmarks: &[(f32, f32); 5]) -> RgbImage {
    let Some(inverse) = SimilarityTransform::estimate(landmarks, &REFERENCE_LANDMARKS_112)
        .and_then(|t| t.inverse())
    else {
        tracing::debug!("degenerate landmarks; emitting blank aligned crop");
        return RgbImage::new(ALIGNED_SIZE, ALIGNED_SIZE);
    };

    RgbImage::from_fn(ALIGNED_SIZE, ALIGNED_SIZE, |ox, oy| {
        let (sx, sy) = inverse.apply((ox as f32, oy as f32));
        sample_bilinear(frame, sx, sy)
    })
}
