//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame, FrameError};
use crate::source::{CameraMode, FrameSource};
use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const CAPTURE_WIDTH: u32 = 640;
const CAPTURE_HEIGHT: u32 = 480;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("invalid camera: {0}")]
    InvalidSpec(String),
    #[error("network camera: {0}")]
    Http(#[from] reqwest::Error),
    #[error("network camera: {0}")]
    Stream(String),
    #[error("timed out waiting for a frame")]
    Timeout,
    #[error("frame: {0}")]
    Frame(#[from] FrameError),
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed, converted to RGB.
    Yuyv,
    /// Motion JPEG, one JPEG per buffer.
    Mjpg,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(PixelFormat::Yuyv)
        } else if fourcc == FourCC::new(b"MJPG") {
            Some(PixelFormat::Mjpg)
        } else {
            None
        }
    }
}

/// V4L2 camera device handle.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0").
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        // YUYV first, MJPG when the driver refuses it at this size.
        let mut negotiated = None;
        for fourcc in [b"YUYV", b"MJPG"] {
            let mut fmt = device.format().map_err(|e| {
                CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
            })?;
            fmt.fourcc = FourCC::new(fourcc);
            fmt.width = CAPTURE_WIDTH;
            fmt.height = CAPTURE_HEIGHT;

            let got = device.set_format(&fmt).map_err(|e| {
                CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
            })?;
            if let Some(pixel_format) = PixelFormat::from_fourcc(got.fourcc) {
                negotiated = Some((got, pixel_format));
                break;
            }
            tracing::debug!(requested = ?FourCC::new(fourcc), got = ?got.fourcc, "format refused");
        }

        let Some((fmt, pixel_format)) = negotiated else {
            return Err(CameraError::FormatNegotiationFailed(
                "unsupported pixel format (need YUYV or MJPG)".into(),
            ));
        };

        tracing::info!(
            width = fmt.width,
            height = fmt.height,
            fourcc = ?fmt.fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: fmt.width,
            height: fmt.height,
            device_path: device_path.to_string(),
            pixel_format,
        })
    }

    /// Capture a single RGB frame.
    pub fn capture_frame(&self) -> Result<Frame, CameraError> {
        let mut stream =
            MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4).map_err(|e| {
                CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
            })?;

        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        match self.pixel_format {
            PixelFormat::Yuyv => {
                let rgb = frame::yuyv_to_rgb(buf, self.width, self.height)?;
                Ok(Frame::new(rgb, meta.sequence))
            }
            PixelFormat::Mjpg => {
                let used = (meta.bytesused as usize).min(buf.len());
                Ok(Frame::decode(&buf[..used], meta.sequence)?)
            }
        }
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

/// A local camera driven from the blocking pool.
pub struct LocalCamera {
    camera: Arc<Mutex<Camera>>,
    device_path: String,
}

impl LocalCamera {
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        let camera = Camera::open(device_path)?;
        Ok(Self {
            camera: Arc::new(Mutex::new(camera)),
            device_path: device_path.to_string(),
        })
    }
}

#[async_trait]
impl FrameSource for LocalCamera {
    async fn grab(&mut self) -> Result<Frame, CameraError> {
        let camera = Arc::clone(&self.camera);
        tokio::task::spawn_blocking(move || {
            let camera = camera
                .lock()
                .map_err(|_| CameraError::CaptureFailed("camera lock poisoned".into()))?;
            camera.capture_frame()
        })
        .await
        .map_err(|e| CameraError::CaptureFailed(format!("capture task failed: {e}")))?
    }

    fn describe(&self) -> String {
        format!("Local Camera ({})", self.device_path)
    }

    fn mode(&self) -> CameraMode {
        CameraMode::Local
    }
}
