//! Network cameras: polled snapshot URLs and MJPEG streams.

use crate::camera::CameraError;
use crate::frame::Frame;
use crate::source::{is_image_url, CameraMode, FrameSource};
use async_trait::async_trait;
use reqwest::{header, Client, Response, Url};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const GRAB_TIMEOUT: Duration = Duration::from_secs(5);

/// Partial data beyond this is discarded; no sane frame is this large.
const MAX_BUFFER: usize = 4 * 1024 * 1024;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Cuts complete JPEG images out of a `multipart/x-mixed-replace` body.
///
/// Part headers and boundaries are skipped; only SOI..EOI spans are kept.
#[derive(Debug, Default)]
pub struct MjpegSplitter {
    buf: Vec<u8>,
    latest: Option<Vec<u8>>,
}

impl MjpegSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk of the response body.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);

        loop {
            let Some(start) = find(&self.buf, &SOI, 0) else {
                // A lone trailing 0xFF may be the first half of the next SOI.
                let keep = usize::from(self.buf.last() == Some(&0xFF));
                let cut = self.buf.len() - keep;
                self.buf.drain(..cut);
                break;
            };
            let Some(end) = find(&self.buf, &EOI, start + SOI.len()) else {
                self.buf.drain(..start);
                break;
            };
            let stop = end + EOI.len();
            self.latest = Some(self.buf[start..stop].to_vec());
            self.buf.drain(..stop);
        }

        if self.buf.len() > MAX_BUFFER {
            tracing::warn!(bytes = self.buf.len(), "MJPEG buffer overflow, dropping partial frame");
            self.buf.clear();
        }
    }

    /// Take the most recent complete JPEG seen so far.
    pub fn latest_frame(&mut self) -> Option<Vec<u8>> {
        self.latest.take()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.latest = None;
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

#[derive(Default)]
struct Latest {
    jpeg: Option<Vec<u8>>,
    ended: Option<String>,
}

/// Reads one MJPEG connection in the background and keeps only the newest
/// complete JPEG, so a slow poller never falls behind the camera.
struct StreamReader {
    latest: Arc<Mutex<Latest>>,
    updated: Arc<Notify>,
    task: JoinHandle<()>,
}

impl StreamReader {
    fn spawn(mut response: Response) -> Self {
        let latest = Arc::new(Mutex::new(Latest::default()));
        let updated = Arc::new(Notify::new());
        let (slot, notify) = (Arc::clone(&latest), Arc::clone(&updated));

        let task = tokio::spawn(async move {
            let mut splitter = MjpegSplitter::new();
            let ended = loop {
                match response.chunk().await {
                    Ok(Some(chunk)) => {
                        splitter.push(&chunk);
                        if let Some(jpeg) = splitter.latest_frame() {
                            lock(&slot).jpeg = Some(jpeg);
                            notify.notify_one();
                        }
                    }
                    Ok(None) => break "stream ended".to_string(),
                    Err(e) => break e.to_string(),
                }
            };
            lock(&slot).ended = Some(ended);
            notify.notify_one();
        });

        Self { latest, updated, task }
    }

    /// Take the newest JPEG not yet taken, waiting while there is none.
    async fn next_jpeg(&self) -> Result<Vec<u8>, CameraError> {
        loop {
            {
                let mut latest = lock(&self.latest);
                if let Some(jpeg) = latest.jpeg.take() {
                    return Ok(jpeg);
                }
                if let Some(reason) = &latest.ended {
                    return Err(CameraError::Stream(reason.clone()));
                }
            }
            self.updated.notified().await;
        }
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn lock(latest: &Mutex<Latest>) -> MutexGuard<'_, Latest> {
    latest.lock().unwrap_or_else(PoisonError::into_inner)
}

fn is_image_response(response: &Response) -> bool {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.trim().to_ascii_lowercase().starts_with("image/"))
}

/// An IP camera reached over HTTP.
///
/// URLs without an image extension are opened as MJPEG streams; one that
/// answers with a single `image/*` body is polled as a snapshot from then on.
pub struct NetworkCamera {
    client: Client,
    url: Url,
    snapshot: bool,
    stream: Option<StreamReader>,
    sequence: u32,
}

impl NetworkCamera {
    /// Build a camera for `url`. No connection is made until the first grab.
    pub fn new(url: Url) -> Result<Self, CameraError> {
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        let snapshot = is_image_url(url.as_str());
        Ok(Self {
            client,
            url,
            snapshot,
            stream: None,
            sequence: 0,
        })
    }

    fn next_sequence(&mut self) -> u32 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }

    async fn grab_snapshot(&mut self) -> Result<Frame, CameraError> {
        let bytes = self
            .client
            .get(self.url.clone())
            .timeout(GRAB_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(Frame::decode(&bytes, self.next_sequence())?)
    }

    async fn grab_stream(&mut self) -> Result<Frame, CameraError> {
        if self.stream.is_none() {
            let response = self.client.get(self.url.clone()).send().await?.error_for_status()?;
            if is_image_response(&response) {
                tracing::info!(url = %self.url, "camera serves single images, polling as snapshots");
                self.snapshot = true;
                let bytes = response.bytes().await?;
                return Ok(Frame::decode(&bytes, self.next_sequence())?);
            }
            tracing::info!(url = %self.url, "connected to MJPEG stream");
            self.stream = Some(StreamReader::spawn(response));
        }
        let Some(reader) = self.stream.as_ref() else {
            return Err(CameraError::Stream("stream not connected".into()));
        };
        let jpeg = reader.next_jpeg().await?;
        Ok(Frame::decode(&jpeg, self.next_sequence())?)
    }
}

#[async_trait]
impl FrameSource for NetworkCamera {
    async fn grab(&mut self) -> Result<Frame, CameraError> {
        if self.snapshot {
            return self.grab_snapshot().await;
        }

        let result = match tokio::time::timeout(GRAB_TIMEOUT, self.grab_stream()).await {
            Ok(result) => result,
            Err(_) => Err(CameraError::Timeout),
        };
        if let Err(e) = &result {
            // Reconnect on the next grab.
            if self.stream.take().is_some() {
                tracing::debug!(url = %self.url, error = %e, "dropping MJPEG connection");
            }
        }
        result
    }

    fn describe(&self) -> String {
        match self.url.host_str() {
            Some(host) => format!("Network Camera ({host})"),
            None => "Network Camera".to_string(),
        }
    }

    fn mode(&self) -> CameraMode {
        CameraMode::Network
    }

    fn is_snapshot(&self) -> bool {
        self.snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn jpeg(shade: u8) -> Vec<u8> {
        Frame::new(RgbImage::from_pixel(8, 8, Rgb([shade, shade, shade])), 0)
            .to_jpeg(90)
            .unwrap()
    }

    fn jpeg_wide(width: u32) -> Vec<u8> {
        Frame::new(RgbImage::from_pixel(width, 8, Rgb([90, 90, 90])), 0)
            .to_jpeg(90)
            .unwrap()
    }

    fn mjpeg_part(jpeg: &[u8]) -> Vec<u8> {
        let mut part = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        part.extend_from_slice(jpeg);
        part.extend_from_slice(b"\r\n");
        part
    }

    #[test]
    fn test_splitter_extracts_frames_across_chunks() {
        let frame = [0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9];
        let mut body = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        body.extend_from_slice(&frame);
        body.extend_from_slice(b"\r\n--frame\r\n");

        let mut splitter = MjpegSplitter::new();
        for chunk in body.chunks(3) {
            splitter.push(chunk);
        }
        assert_eq!(splitter.latest_frame().unwrap(), frame.to_vec());
        assert!(splitter.latest_frame().is_none());
    }

    #[test]
    fn test_splitter_keeps_latest() {
        let mut splitter = MjpegSplitter::new();
        splitter.push(&[0xFF, 0xD8, 1, 0xFF, 0xD9, 0xFF, 0xD8, 2, 0xFF, 0xD9]);
        assert_eq!(splitter.latest_frame().unwrap(), vec![0xFF, 0xD8, 2, 0xFF, 0xD9]);
    }

    #[test]
    fn test_splitter_marker_split_between_chunks() {
        let mut splitter = MjpegSplitter::new();
        splitter.push(b"junk\xFF");
        splitter.push(&[0xD8, 7, 0xFF]);
        assert!(splitter.latest_frame().is_none());
        splitter.push(&[0xD9]);
        assert_eq!(splitter.latest_frame().unwrap(), vec![0xFF, 0xD8, 7, 0xFF, 0xD9]);
    }

    #[test]
    fn test_splitter_drops_oversized_partial() {
        let mut splitter = MjpegSplitter::new();
        splitter.push(&SOI);
        splitter.push(&vec![0u8; MAX_BUFFER + 1]);
        assert!(splitter.buf.is_empty());
        assert!(splitter.latest_frame().is_none());
    }

    async fn serve_once(response: Vec<u8>) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            socket.write_all(&response).await.unwrap();
            let _ = socket.shutdown().await;
        });
        Url::parse(&format!("http://{addr}/")).unwrap()
    }

    #[tokio::test]
    async fn test_snapshot_grab() {
        let body = jpeg(200);
        let mut response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )
        .into_bytes();
        response.extend_from_slice(&body);
        let base = serve_once(response).await;

        let mut camera = NetworkCamera::new(base.join("snap.jpg").unwrap()).unwrap();
        assert!(camera.is_snapshot());
        let frame = camera.grab().await.unwrap();
        assert_eq!((frame.width(), frame.height()), (8, 8));
        assert!(frame.avg_brightness() > 150.0);
    }

    #[tokio::test]
    async fn test_mjpeg_grab_then_reconnect_after_end() {
        let mut response = b"HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary=frame\r\nConnection: close\r\n\r\n".to_vec();
        response.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
        response.extend_from_slice(&jpeg(40));
        response.extend_from_slice(b"\r\n");
        let url = serve_once(response).await;

        let mut camera = NetworkCamera::new(url).unwrap();
        assert!(!camera.is_snapshot());
        assert_eq!(camera.mode(), CameraMode::Network);
        let frame = camera.grab().await.unwrap();
        assert_eq!(frame.width(), 8);

        // The server closed the stream; the error drops the connection.
        assert!(camera.grab().await.is_err());
        assert!(camera.stream.is_none());
    }

    #[tokio::test]
    async fn test_mjpeg_grab_skips_queued_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (more_tx, more_rx) = tokio::sync::oneshot::channel::<()>();
        let (sent_tx, sent_rx) = tokio::sync::oneshot::channel::<()>();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            let mut head = b"HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary=frame\r\n\r\n".to_vec();
            head.extend_from_slice(&mjpeg_part(&jpeg_wide(8)));
            socket.write_all(&head).await.unwrap();

            let _ = more_rx.await;
            for width in 9..=13 {
                socket.write_all(&mjpeg_part(&jpeg_wide(width))).await.unwrap();
            }
            let _ = sent_tx.send(());
            let _ = done_rx.await;
        });

        let mut camera = NetworkCamera::new(Url::parse(&format!("http://{addr}/video")).unwrap()).unwrap();
        assert_eq!(camera.grab().await.unwrap().width(), 8);

        more_tx.send(()).unwrap();
        sent_rx.await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Frames 9..12 were superseded while nobody was grabbing.
        assert_eq!(camera.grab().await.unwrap().width(), 13);
        let _ = done_tx.send(());
    }

    #[tokio::test]
    async fn test_image_response_switches_to_snapshot_polling() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { return };
                let mut request = [0u8; 1024];
                let _ = socket.read(&mut request).await;
                let body = jpeg(120);
                let mut response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                )
                .into_bytes();
                response.extend_from_slice(&body);
                let _ = socket.write_all(&response).await;
                let _ = socket.shutdown().await;
            }
        });

        let url = Url::parse(&format!("http://{addr}/snapshot.cgi")).unwrap();
        let mut camera = NetworkCamera::new(url).unwrap();
        assert!(!camera.is_snapshot());

        for _ in 0..6 {
            let frame = camera.grab().await.unwrap();
            assert_eq!(frame.width(), 8);
            assert!(camera.is_snapshot());
            assert!(camera.stream.is_none());
        }
    }

    #[test]
    fn test_describe_uses_host() {
        let camera = NetworkCamera::new(Url::parse("http://192.168.1.9:8080/video").unwrap()).unwrap();
        assert_eq!(camera.describe(), "Network Camera (192.168.1.9)");
    }
}
