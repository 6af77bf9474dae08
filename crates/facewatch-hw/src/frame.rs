//! Frame type and pixel conversion: YUYV to RGB, dark detection, JPEG codec.

use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, RgbImage};
use std::sync::Arc;

/// Luma below this value counts as a dark pixel.
const DARK_LUMA: u8 = 32;

/// A captured RGB frame.
///
/// The pixel buffer is shared so a frame can be handed to the analyzer and
/// kept for a screenshot without copying.
#[derive(Clone)]
pub struct Frame {
    pub image: Arc<RgbImage>,
    pub sequence: u32,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u32) -> Self {
        Self {
            image: Arc::new(image),
            sequence,
        }
    }

    /// Decode a JPEG/PNG/... payload into a frame.
    pub fn decode(bytes: &[u8], sequence: u32) -> Result<Self, FrameError> {
        let image = image::load_from_memory(bytes)?.to_rgb8();
        Ok(Self::new(image, sequence))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Average luma (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        let pixels = self.image.pixels().len();
        if pixels == 0 {
            return 0.0;
        }
        self.image.pixels().map(|p| luma(p.0) as f32).sum::<f32>() / pixels as f32
    }

    /// True when more than `threshold_pct` of pixels are dark.
    ///
    /// A covered lens or a camera without signal yields such frames.
    pub fn is_dark(&self, threshold_pct: f32) -> bool {
        let pixels = self.image.pixels().len();
        if pixels == 0 {
            return true;
        }
        let dark = self.image.pixels().filter(|p| luma(p.0) < DARK_LUMA).count();
        (dark as f32 / pixels as f32) > threshold_pct
    }

    /// Encode the frame as a JPEG screenshot.
    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>, FrameError> {
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, quality).encode(
            self.image.as_raw(),
            self.width(),
            self.height(),
            ExtendedColorType::Rgb8,
        )?;
        Ok(out)
    }
}

/// BT.601 luma of an RGB pixel.
pub fn luma([r, g, b]: [u8; 3]) -> u8 {
    ((77 * r as u32 + 150 * g as u32 + 29 * b as u32) >> 8) as u8
}

/// Convert packed YUYV (4:2:2) to RGB.
///
/// Every 4 bytes `[Y0, U, Y1, V]` carry two pixels sharing one chroma pair.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for quad in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }

    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected,
        actual: yuyv.len(),
    })
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;
    let clamp = |x: f32| x.round().clamp(0.0, 255.0) as u8;
    [
        clamp(y + 1.402 * v),
        clamp(y - 0.344_136 * u - 0.714_136 * v),
        clamp(y + 1.772 * u),
    ]
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid YUYV length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("image codec: {0}")]
    Codec(#[from] image::ImageError),
}
