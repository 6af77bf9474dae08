//! Camera specs and the frame-source seam used by the monitor.

use crate::camera::{CameraError, LocalCamera};
use crate::frame::Frame;
use crate::network::NetworkCamera;
use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where a monitoring session takes its frames from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraMode {
    Local,
    Network,
}

impl fmt::Display for CameraMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CameraMode::Local => "local",
            CameraMode::Network => "network",
        })
    }
}

impl FromStr for CameraMode {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(CameraMode::Local),
            "network" => Ok(CameraMode::Network),
            other => Err(CameraError::InvalidSpec(format!("unknown camera mode: {other}"))),
        }
    }
}

/// A parsed camera description.
///
/// Accepted forms: `local:/dev/videoN`, a bare `/dev/videoN` path, or an
/// `http(s)://` URL of a network camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraSpec {
    Local(String),
    Network(Url),
}

impl CameraSpec {
    pub fn mode(&self) -> CameraMode {
        match self {
            CameraSpec::Local(_) => CameraMode::Local,
            CameraSpec::Network(_) => CameraMode::Network,
        }
    }

    /// Whether the source is polled one still image at a time.
    pub fn is_snapshot(&self) -> bool {
        matches!(self, CameraSpec::Network(url) if is_image_url(url.as_str()))
    }
}

impl fmt::Display for CameraSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraSpec::Local(device) => write!(f, "local:{device}"),
            CameraSpec::Network(url) => write!(f, "{url}"),
        }
    }
}

impl FromStr for CameraSpec {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CameraError::InvalidSpec("camera spec is empty".into()));
        }
        if let Some(device) = s.strip_prefix("local:") {
            if device.is_empty() {
                return Err(CameraError::InvalidSpec("local camera needs a device path".into()));
            }
            return Ok(CameraSpec::Local(device.to_string()));
        }
        if s.starts_with('/') {
            return Ok(CameraSpec::Local(s.to_string()));
        }

        let url = Url::parse(s).map_err(|e| CameraError::InvalidSpec(format!("{s}: {e}")))?;
        match url.scheme() {
            "http" | "https" => Ok(CameraSpec::Network(url)),
            other => Err(CameraError::InvalidSpec(format!("unsupported scheme: {other}"))),
        }
    }
}

/// Whether a URL points at a still image rather than a stream.
pub fn is_image_url(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let Some((_, ext)) = path.rsplit_once('.') else {
        return false;
    };
    matches!(
        ext.to_ascii_lowercase().as_str(),
        "jpeg" | "jpg" | "png" | "gif" | "bmp" | "webp"
    )
}

/// Something that yields the current camera frame on demand.
#[async_trait]
pub trait FrameSource: Send {
    /// Capture the most recent frame.
    async fn grab(&mut self) -> Result<Frame, CameraError>;

    /// Human-readable location label stored with detections.
    fn describe(&self) -> String;

    fn mode(&self) -> CameraMode;

    /// True for sources polled as still images.
    fn is_snapshot(&self) -> bool {
        false
    }
}

/// Open the source described by `spec`.
///
/// Local devices are opened immediately; network sources connect lazily on
/// the first grab.
pub async fn open_source(spec: &CameraSpec) -> Result<Box<dyn FrameSource>, CameraError> {
    match spec {
        CameraSpec::Local(device) => {
            let device = device.clone();
            let camera = tokio::task::spawn_blocking(move || LocalCamera::open(&device))
                .await
                .map_err(|e| CameraError::CaptureFailed(format!("open task failed: {e}")))??;
            Ok(Box::new(camera))
        }
        CameraSpec::Network(url) => Ok(Box::new(NetworkCamera::new(url.clone())?)),
    }
}
