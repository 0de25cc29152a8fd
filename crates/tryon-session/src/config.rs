use std::path::PathBuf;
use std::time::Duration;
use tryon_core::calibration::DEFAULT_SCAN_CAPACITY;
use tryon_core::estimator::{
    DEFAULT_OUTER_EYE_WEIGHT, DEFAULT_SMOOTHING, DEFAULT_TEMPLE_WEIGHT, MAX_SIZE_MULTIPLIER,
    MIN_SIZE_MULTIPLIER,
};
use tryon_core::{EstimatorParams, SceneConfig, SpanBlend, TrackerConfig};
use tryon_hw::StreamConstraints;

/// Session configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub capture_width: u32,
    pub capture_height: u32,
    /// Directory containing the ONNX models.
    pub model_dir: PathBuf,
    /// Directory containing the product `.glb` assets.
    pub asset_dir: PathBuf,
    /// Where captured PNGs are written.
    pub capture_dir: PathBuf,
    pub scan_capacity: usize,
    pub smoothing: f32,
    pub temple_weight: f32,
    pub outer_eye_weight: f32,
    pub min_multiplier: f32,
    pub max_multiplier: f32,
    pub min_detection_confidence: f32,
    pub min_tracking_confidence: f32,
    pub refine_landmarks: bool,
    pub occluder_width_pad: f32,
    pub occluder_height_pad: f32,
    pub target_fps: u32,
}

impl Default for Config {
    fn default() -> Self {
        let tracker = TrackerConfig::default();
        let scene = SceneConfig::default();
        Self {
            camera_device: "/dev/video0".to_string(),
            capture_width: 1280,
            capture_height: 720,
            model_dir: tryon_core::default_model_dir(),
            asset_dir: PathBuf::from("assets"),
            capture_dir: PathBuf::from("."),
            scan_capacity: DEFAULT_SCAN_CAPACITY,
            smoothing: DEFAULT_SMOOTHING,
            temple_weight: DEFAULT_TEMPLE_WEIGHT,
            outer_eye_weight: DEFAULT_OUTER_EYE_WEIGHT,
            min_multiplier: MIN_SIZE_MULTIPLIER,
            max_multiplier: MAX_SIZE_MULTIPLIER,
            min_detection_confidence: tracker.min_detection_confidence,
            min_tracking_confidence: tracker.min_tracking_confidence,
            refine_landmarks: tracker.refine_landmarks,
            occluder_width_pad: scene.occluder_width_pad,
            occluder_height_pad: scene.occluder_height_pad,
            target_fps: 30,
        }
    }
}

impl Config {
    /// Load configuration from `TRYON_*` environment variables with defaults.
    /// Unparseable or out-of-range values fall back to the default.
    pub fn from_env() -> Self {
        let d = Self::default();
        let cfg = Self {
            camera_device: std::env::var("TRYON_CAMERA_DEVICE").unwrap_or(d.camera_device),
            capture_width: env_parse("TRYON_CAPTURE_WIDTH", d.capture_width),
            capture_height: env_parse("TRYON_CAPTURE_HEIGHT", d.capture_height),
            model_dir: env_path("TRYON_MODEL_DIR").unwrap_or(d.model_dir),
            asset_dir: env_path("TRYON_ASSET_DIR").unwrap_or(d.asset_dir),
            capture_dir: env_path("TRYON_CAPTURE_DIR").unwrap_or(d.capture_dir),
            scan_capacity: env_parse("TRYON_SCAN_FRAMES", d.scan_capacity),
            smoothing: env_parse("TRYON_SMOOTHING", d.smoothing),
            temple_weight: env_parse("TRYON_TEMPLE_WEIGHT", d.temple_weight),
            outer_eye_weight: env_parse("TRYON_OUTER_EYE_WEIGHT", d.outer_eye_weight),
            min_multiplier: env_parse("TRYON_MIN_SIZE", d.min_multiplier),
            max_multiplier: env_parse("TRYON_MAX_SIZE", d.max_multiplier),
            min_detection_confidence: env_parse(
                "TRYON_MIN_DETECTION_CONFIDENCE",
                d.min_detection_confidence,
            ),
            min_tracking_confidence: env_parse(
                "TRYON_MIN_TRACKING_CONFIDENCE",
                d.min_tracking_confidence,
            ),
            refine_landmarks: std::env::var("TRYON_REFINE_LANDMARKS")
                .map(|v| v != "0")
                .unwrap_or(d.refine_landmarks),
            occluder_width_pad: env_parse("TRYON_OCCLUDER_WIDTH_PAD", d.occluder_width_pad),
            occluder_height_pad: env_parse("TRYON_OCCLUDER_HEIGHT_PAD", d.occluder_height_pad),
            target_fps: env_parse("TRYON_FPS", d.target_fps),
        };
        cfg.sanitized()
    }

    /// Replace values that would break the pipeline with their defaults.
    pub fn sanitized(mut self) -> Self {
        let d = Self::default();
        if self.capture_width == 0 || self.capture_height == 0 {
            self.capture_width = d.capture_width;
            self.capture_height = d.capture_height;
        }
        if self.scan_capacity == 0 {
            self.scan_capacity = d.scan_capacity;
        }
        if !(self.smoothing > 0.0 && self.smoothing <= 1.0) {
            self.smoothing = d.smoothing;
        }
        if !(self.temple_weight >= 0.0 && self.outer_eye_weight >= 0.0)
            || self.temple_weight + self.outer_eye_weight <= 0.0
        {
            self.temple_weight = d.temple_weight;
            self.outer_eye_weight = d.outer_eye_weight;
        }
        if !(self.min_multiplier > 0.0 && self.min_multiplier <= self.max_multiplier) {
            self.min_multiplier = d.min_multiplier;
            self.max_multiplier = d.max_multiplier;
        }
        if self.target_fps == 0 {
            self.target_fps = d.target_fps;
        }
        self
    }

    pub fn locator_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    pub fn face_mesh_model_path(&self) -> PathBuf {
        self.model_dir.join("face_landmarks_478.onnx")
    }

    pub fn stream_constraints(&self) -> StreamConstraints {
        StreamConstraints {
            ideal_width: self.capture_width,
            ideal_height: self.capture_height,
            ..StreamConstraints::default()
        }
    }

    pub fn estimator_params(&self) -> EstimatorParams {
        EstimatorParams {
            blend: SpanBlend {
                temple: self.temple_weight,
                outer_eye: self.outer_eye_weight,
            },
            smoothing: self.smoothing,
            min_multiplier: self.min_multiplier,
            max_multiplier: self.max_multiplier,
        }
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            refine_landmarks: self.refine_landmarks,
            min_detection_confidence: self.min_detection_confidence,
            min_tracking_confidence: self.min_tracking_confidence,
            ..TrackerConfig::default()
        }
    }

    /// Scene fit for a product with the given vertical offset.
    pub fn scene_config(&self, offset_y: f32) -> SceneConfig {
        SceneConfig {
            occluder_width_pad: self.occluder_width_pad,
            occluder_height_pad: self.occluder_height_pad,
            offset_y,
            ..SceneConfig::default()
        }
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.target_fps.max(1) as f64)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key).filter(|v| !v.is_empty()).map(PathBuf::from)
}
