//! tryon-core — face tracking and overlay compositing for eyewear try-on.
//!
//! Landmarks from a face-mesh detector drive an anatomical estimator (anchor,
//! scale, roll) that places a 3D eyewear model in an orthographic scene; the
//! rendered overlay is composited over the raw video frame.

pub mod asset;
pub mod calibration;
pub mod catalog;
pub mod compositor;
pub mod detector;
pub mod estimator;
pub mod face_mesh;
pub mod landmarks;
pub mod render;
pub mod roi;
pub mod scene;
pub mod tracker;
pub mod types;

use std::path::PathBuf;

pub use asset::{AssetError, AssetLoader, GltfLoader, MaterialOverrides, OverlayAsset, RawAsset};
pub use calibration::{Calibration, CalibrationPhase, CalibrationResult, CalibrationSample};
pub use catalog::{list_products, lookup_product, Product};
pub use compositor::{CompositeError, Compositor};
pub use estimator::{EstimatorParams, SpanBlend};
pub use face_mesh::FaceMeshDetector;
pub use landmarks::{FaceMeasurements, FrameLandmarks, LandmarkPoint};
pub use render::{RenderError, Renderer, SoftwareRenderer};
pub use scene::{OverlayScene, SceneConfig, SceneError};
pub use tracker::{LandmarkDetector, TrackerConfig, TrackerError};
pub use types::{Anchor, BoundingBox, TrackingState};

/// Default location of the ONNX models.
pub fn default_model_dir() -> PathBuf {
    std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("/usr/share"))
        .join("tryon/models")
}
