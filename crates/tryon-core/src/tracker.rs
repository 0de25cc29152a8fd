//! Landmark detector seam.

use crate::landmarks::{FrameLandmarks, LandmarkError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("model file not found: {0} (place the ONNX models in the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("frame is {actual} bytes, expected {expected} for packed RGB")]
    InvalidFrame { expected: usize, actual: usize },
    #[error(transparent)]
    Landmarks(#[from] LandmarkError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    pub max_faces: usize,
    /// Produce the 478-point set with iris centers.
    pub refine_landmarks: bool,
    pub min_detection_confidence: f32,
    /// Face-presence score below which a tracked ROI is dropped and the face
    /// is located again.
    pub min_tracking_confidence: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_faces: 1,
            refine_landmarks: true,
            min_detection_confidence: 0.6,
            min_tracking_confidence: 0.5,
        }
    }
}

/// Produces at most one complete landmark set per frame.
///
/// Frames are packed RGB8 in raw (unmirrored) orientation. `Ok(None)` means
/// no face was found.
pub trait LandmarkDetector: Send {
    fn detect(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<FrameLandmarks>, TrackerError>;

    /// Drop any state carried between frames.
    fn reset(&mut self) {}
}

pub(crate) fn check_rgb_len(rgb: &[u8], width: u32, height: u32) -> Result<(), TrackerError> {
    let expected = width as usize * height as usize * 3;
    if rgb.len() != expected || expected == 0 {
        return Err(TrackerError::InvalidFrame {
            expected,
            actual: rgb.len(),
        });
    }
    Ok(())
}
