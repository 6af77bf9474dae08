//! facewatch-hw: frame capture for the monitoring loop.
//!
//! Local cameras are read through V4L2; network cameras are either polled
//! snapshot URLs or long-lived MJPEG streams. Both produce RGB [`Frame`]s
//! behind the [`FrameSource`] trait.

pub mod camera;
pub mod frame;
pub mod network;
pub mod source;

pub use camera::{Camera, CameraError, LocalCamera, PixelFormat};
pub use frame::{Frame, FrameError};
pub use network::{MjpegSplitter, NetworkCamera};
pub use source::{is_image_url, open_source, CameraMode, CameraSpec, FrameSource};
