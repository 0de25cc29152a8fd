//! tryon-hw — Camera capture for the try-on session.
//!
//! Provides the camera backend seam, a V4L2 implementation, and the
//! capture manager that owns the live stream for one session.

pub mod camera;
pub mod capture;
pub mod frame;

pub use camera::{
    CameraBackend, CameraError, CameraFailure, FacingMode, StreamConstraints, V4lCamera,
    VideoStream,
};
pub use capture::{CaptureManager, StreamInfo};
pub use frame::Frame;
