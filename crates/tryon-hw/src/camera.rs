//! Camera backends — the `CameraBackend`/`VideoStream` seam and the V4L2 implementation.

use crate::frame::{self, Frame};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("camera capture unsupported: {0}")]
    Unsupported(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("no active stream")]
    NotStreaming,
    #[error("camera error: {0}")]
    Unknown(String),
}

/// Coarse classification of a camera failure, as surfaced to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraFailure {
    PermissionDenied,
    DeviceNotFound,
    Unsupported,
    Unknown,
}

impl CameraError {
    pub fn kind(&self) -> CameraFailure {
        match self {
            CameraError::PermissionDenied(_) => CameraFailure::PermissionDenied,
            CameraError::DeviceNotFound(_) => CameraFailure::DeviceNotFound,
            CameraError::Unsupported(_) | CameraError::FormatNegotiationFailed(_) => {
                CameraFailure::Unsupported
            }
            CameraError::DeviceBusy
            | CameraError::CaptureFailed(_)
            | CameraError::NotStreaming
            | CameraError::Unknown(_) => CameraFailure::Unknown,
        }
    }

    /// Map an OS error raised while opening `device` to a typed camera error.
    pub fn from_open_error(device: &str, err: &io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EACCES) | Some(libc::EPERM) => {
                CameraError::PermissionDenied(format!("{device}: {err}"))
            }
            Some(libc::ENOENT) | Some(libc::ENODEV) | Some(libc::ENXIO) => {
                CameraError::DeviceNotFound(format!("{device}: {err}"))
            }
            Some(libc::EBUSY) => CameraError::DeviceBusy,
            _ => match err.kind() {
                io::ErrorKind::PermissionDenied => {
                    CameraError::PermissionDenied(format!("{device}: {err}"))
                }
                io::ErrorKind::NotFound => CameraError::DeviceNotFound(format!("{device}: {err}")),
                _ => CameraError::Unknown(format!("{device}: {err}")),
            },
        }
    }
}

/// Which way the requested camera should face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FacingMode {
    User,
    Environment,
}

/// Stream request — resolutions are ideals, the driver may negotiate something else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConstraints {
    pub facing: FacingMode,
    pub ideal_width: u32,
    pub ideal_height: u32,
}

impl Default for StreamConstraints {
    fn default() -> Self {
        Self {
            facing: FacingMode::User,
            ideal_width: 1280,
            ideal_height: 720,
        }
    }
}

/// A live video stream. Stopping must be idempotent.
pub trait VideoStream: Send {
    /// Negotiated (width, height). May be (0, 0) if the backend cannot tell.
    fn resolution(&self) -> (u32, u32);
    fn next_frame(&mut self) -> Result<Frame, CameraError>;
    fn stop(&mut self);
    fn is_active(&self) -> bool;
}

/// Source of video streams (a camera device, or a fake in tests).
pub trait CameraBackend: Send {
    fn open_stream(
        &mut self,
        constraints: &StreamConstraints,
    ) -> Result<Box<dyn VideoStream>, CameraError>;
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Packed RGB24 (3 bytes/pixel).
    Rgb3,
}

/// V4L2 camera backend bound to one device node.
pub struct V4lCamera {
    device_path: String,
}

impl V4lCamera {
    pub fn new(device_path: impl Into<String>) -> Self {
        Self {
            device_path: device_path.into(),
        }
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
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

impl CameraBackend for V4lCamera {
    fn open_stream(
        &mut self,
        constraints: &StreamConstraints,
    ) -> Result<Box<dyn VideoStream>, CameraError> {
        let device_path = self.device_path.as_str();
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }
        if constraints.facing != FacingMode::User {
            tracing::debug!(device = device_path, "V4L2 has no facing hint; using device as-is");
        }

        let device = Device::with_path(device_path)
            .map_err(|e| CameraError::from_open_error(device_path, &e))?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::from_open_error(device_path, &e))?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::Unsupported(format!(
                "{device_path} is not a video capture device"
            )));
        }
        if !caps.capabilities.contains(v4l::capability::Flags::STREAMING) {
            return Err(CameraError::Unsupported(format!(
                "{device_path} does not support streaming I/O"
            )));
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = constraints.ideal_width;
        fmt.height = constraints.ideal_height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = if fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if fourcc == FourCC::new(b"RGB3") {
            PixelFormat::Rgb3
        } else {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV or RGB3)"
            )));
        };

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, 4).map_err(|e| {
            CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
        })?;

        Ok(Box::new(V4lStream {
            device_path: device_path.to_string(),
            stream: Some(stream),
            device: Some(device),
            width: negotiated.width,
            height: negotiated.height,
            pixel_format,
        }))
    }
}

/// An open V4L2 mmap stream. Dropping the stream turns streaming off.
struct V4lStream {
    device_path: String,
    // Field order matters: the stream must be released before the device.
    stream: Option<MmapStream<'static>>,
    device: Option<Device>,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

impl V4lStream {
    fn buf_to_rgb(&self, buf: &[u8]) -> Result<Vec<u8>, CameraError> {
        let pixels = (self.width * self.height) as usize;
        match self.pixel_format {
            PixelFormat::Rgb3 => {
                let expected = pixels * 3;
                if buf.len() < expected {
                    return Err(CameraError::CaptureFailed(format!(
                        "RGB3 buffer too short: expected {expected}, got {}",
                        buf.len()
                    )));
                }
                Ok(buf[..expected].to_vec())
            }
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, self.width, self.height)
                .map_err(|e| CameraError::CaptureFailed(format!("YUYV conversion failed: {e}"))),
        }
    }
}

impl VideoStream for V4lStream {
    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        let stream = self.stream.as_mut().ok_or(CameraError::NotStreaming)?;
        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        let sequence = meta.sequence;
        let buf = buf.to_vec();

        let rgb = self.buf_to_rgb(&buf)?;
        Frame::from_rgb(rgb, self.width, self.height, sequence)
            .map_err(|e| CameraError::CaptureFailed(e.to_string()))
    }

    fn stop(&mut self) {
        if self.stream.take().is_some() {
            tracing::info!(device = %self.device_path, "camera stream stopped");
        }
        self.device.take();
    }

    fn is_active(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for V4lStream {
    fn drop(&mut self) {
        self.stop();
    }
}
