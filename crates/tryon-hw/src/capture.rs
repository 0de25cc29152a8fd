//! Capture manager — owns the single live stream ("video sink") for a session.

use crate::camera::{CameraBackend, CameraError, StreamConstraints, VideoStream};
use crate::frame::Frame;

/// Resolution assumed when a stream cannot report its own.
pub const FALLBACK_WIDTH: u32 = 1280;
pub const FALLBACK_HEIGHT: u32 = 720;

/// Description of an acquired stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
}

/// Acquires and releases camera streams.
///
/// At most one stream is held at a time: `acquire` stops any stream it
/// already owns before opening a new one, and `release` is idempotent.
pub struct CaptureManager {
    backend: Box<dyn CameraBackend>,
    constraints: StreamConstraints,
    sink: Option<Box<dyn VideoStream>>,
}

impl CaptureManager {
    pub fn new(backend: Box<dyn CameraBackend>, constraints: StreamConstraints) -> Self {
        Self {
            backend,
            constraints,
            sink: None,
        }
    }

    pub fn acquire(&mut self) -> Result<StreamInfo, CameraError> {
        self.release();

        let stream = self.backend.open_stream(&self.constraints)?;
        let (mut width, mut height) = stream.resolution();
        if width == 0 || height == 0 {
            tracing::warn!(
                width = FALLBACK_WIDTH,
                height = FALLBACK_HEIGHT,
                "stream reported no resolution; assuming fallback"
            );
            width = FALLBACK_WIDTH;
            height = FALLBACK_HEIGHT;
        }
        self.sink = Some(stream);

        tracing::info!(width, height, "camera stream acquired");
        Ok(StreamInfo { width, height })
    }

    /// Stop every track of the held stream. Returns whether a stream was stopped.
    pub fn release(&mut self) -> bool {
        match self.sink.take() {
            Some(mut stream) => {
                stream.stop();
                tracing::debug!("camera stream released");
                true
            }
            None => false,
        }
    }

    pub fn read_frame(&mut self) -> Result<Frame, CameraError> {
        let stream = self.sink.as_mut().ok_or(CameraError::NotStreaming)?;
        stream.next_frame()
    }

    pub fn is_streaming(&self) -> bool {
        self.sink.as_ref().is_some_and(|s| s.is_active())
    }
}

impl Drop for CaptureManager {
    fn drop(&mut self) {
        self.release();
    }
}
