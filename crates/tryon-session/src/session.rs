//! Session controller: start-up ordering, the per-frame loop, user controls
//! and deterministic teardown for one try-on session.
//!
//! ```text
//! Loading ──ok──▶ Scanning ──calibrated──▶ Running
//!    │               ▲                        │
//!    │               └────────rescan──────────┘
//!    └──failure──▶ Error ──retry──▶ Loading
//! ```
//!
//! Every resource (camera stream, tracker thread, scene and renderer) is
//! owned by the session and released by `stop`, which also runs on drop.

use crate::config::Config;
use crate::engine::{
    spawn_tracker, EngineError, SubmitOutcome, TrackerHandle, TrackerOutput, TrackerStats,
};
use chrono::{DateTime, Utc};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tryon_core::calibration::{CalibrationError, CalibrationPhase};
use tryon_core::{
    AssetError, AssetLoader, Calibration, CalibrationResult, CompositeError, Compositor,
    FaceMeasurements, LandmarkDetector, OverlayAsset, OverlayScene, Product, RenderError, Renderer,
    SceneError, TrackerConfig, TrackerError, TrackingState,
};
use tryon_hw::{CameraBackend, CameraError, CameraFailure, CaptureManager, Frame, StreamInfo};
use uuid::Uuid;

/// Step of the size stepper control.
pub const SIZE_STEP: f32 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Loading,
    Scanning,
    Running,
    Error,
}

/// User-facing failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    PermissionDenied,
    DeviceNotFound,
    UnsupportedEnvironment,
    AssetLoadFailure,
    TrackerInitFailure,
    RenderContextLost,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Every failure can be retried; a lost render context asks for a refresh.
    pub retryable: bool,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("product not found: {0}")]
    ProductNotFound(String),
    #[error("camera: {0}")]
    Camera(#[from] CameraError),
    #[error("asset: {0}")]
    Asset(#[from] AssetError),
    #[error("tracker: {0}")]
    Tracker(#[from] TrackerError),
    #[error("engine: {0}")]
    Engine(#[from] EngineError),
    #[error("render: {0}")]
    Render(#[from] RenderError),
    #[error("scene: {0}")]
    Scene(#[from] SceneError),
    #[error("calibration: {0}")]
    Calibration(#[from] CalibrationError),
    #[error("composite: {0}")]
    Composite(#[from] CompositeError),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("capture needs a running session (status is {0:?})")]
    NotRunning(SessionStatus),
    #[error("retry is only available after a failure (status is {0:?})")]
    NotFailed(SessionStatus),
}

impl SessionError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            SessionError::Camera(e) => match e.kind() {
                CameraFailure::PermissionDenied => FailureKind::PermissionDenied,
                CameraFailure::DeviceNotFound => FailureKind::DeviceNotFound,
                CameraFailure::Unsupported => FailureKind::UnsupportedEnvironment,
                CameraFailure::Unknown => FailureKind::Unknown,
            },
            SessionError::Asset(_)
            | SessionError::Calibration(_)
            | SessionError::ProductNotFound(_) => FailureKind::AssetLoadFailure,
            SessionError::Tracker(_) | SessionError::Engine(_) => FailureKind::TrackerInitFailure,
            SessionError::Render(RenderError::ContextLost)
            | SessionError::Scene(SceneError::Render(RenderError::ContextLost)) => {
                FailureKind::RenderContextLost
            }
            SessionError::Render(_) | SessionError::Scene(_) => FailureKind::UnsupportedEnvironment,
            _ => FailureKind::Unknown,
        }
    }

    fn to_failure(&self) -> SessionFailure {
        let kind = self.failure_kind();
        let hint = match kind {
            FailureKind::PermissionDenied => {
                "Camera access was denied. Allow camera access, then retry."
            }
            FailureKind::DeviceNotFound => "No camera was found. Connect a camera, then retry.",
            FailureKind::UnsupportedEnvironment => "This environment cannot run the try-on.",
            FailureKind::AssetLoadFailure => "The eyewear model could not be loaded.",
            FailureKind::TrackerInitFailure => "Face tracking could not be started.",
            FailureKind::RenderContextLost => {
                "The renderer stopped responding. Refresh to continue."
            }
            FailureKind::Unknown => "Something went wrong.",
        };
        SessionFailure {
            kind,
            message: format!("{hint} ({self})"),
            retryable: true,
        }
    }
}

pub type DetectorFactory =
    Box<dyn Fn(&TrackerConfig) -> Result<Box<dyn LandmarkDetector>, TrackerError> + Send>;
pub type RendererFactory = Box<dyn Fn(u32, u32) -> Result<Box<dyn Renderer>, RenderError> + Send>;

/// External collaborators of a session.
pub struct SessionBackends {
    pub camera: Box<dyn CameraBackend>,
    pub detector: DetectorFactory,
    pub assets: Box<dyn AssetLoader>,
    pub renderer: RendererFactory,
}

impl SessionBackends {
    /// V4L2 camera, ONNX face mesh, glTF assets, software renderer.
    pub fn system(config: &Config) -> Self {
        let locator = config.locator_model_path();
        let mesh = config.face_mesh_model_path();
        let detector =
            move |tc: &TrackerConfig| -> Result<Box<dyn LandmarkDetector>, TrackerError> {
                Ok(Box::new(tryon_core::FaceMeshDetector::load(&locator, &mesh, *tc)?))
            };
        Self {
            camera: Box::new(tryon_hw::V4lCamera::new(config.camera_device.clone())),
            detector: Box::new(detector),
            assets: Box::new(tryon_core::GltfLoader),
            renderer: Box::new(|w: u32, h: u32| -> Result<Box<dyn Renderer>, RenderError> {
                Ok(Box::new(tryon_core::SoftwareRenderer::new(w, h)?))
            }),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub status: SessionStatus,
    pub submitted: bool,
    /// Sequence number of the frame whose result was applied this tick.
    pub processed: Option<u32>,
}

/// Serializable view of the session for UIs and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub product_id: String,
    pub status: SessionStatus,
    pub failure: Option<SessionFailure>,
    pub live: bool,
    pub scan_progress: u8,
    pub face_live: bool,
    pub size_multiplier: f32,
    pub frames_presented: u64,
    pub stream: Option<(u32, u32)>,
    pub tracking: Option<TrackingState>,
    pub calibration: Option<CalibrationResult>,
    pub tracker: Option<TrackerStats>,
    pub started_at: Option<DateTime<Utc>>,
}

pub struct Session {
    id: Uuid,
    config: Config,
    product: Product,
    capture: CaptureManager,
    detector_factory: DetectorFactory,
    assets: Box<dyn AssetLoader>,
    renderer_factory: RendererFactory,

    tracker: Option<TrackerHandle>,
    asset: Option<OverlayAsset>,
    scene: Option<OverlayScene>,
    compositor: Option<Compositor>,
    calibration: Option<Calibration>,
    stream: Option<StreamInfo>,
    pending: Option<Arc<Frame>>,

    status: SessionStatus,
    failure: Option<SessionFailure>,
    live: bool,
    scan_progress: u8,
    face_live: bool,
    size_multiplier: f32,
    frames_presented: u64,
    started_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Create a session for `product_id`. Nothing is acquired until `start`.
    pub fn new(
        product_id: &str,
        config: Config,
        backends: SessionBackends,
    ) -> Result<Self, SessionError> {
        let product = tryon_core::lookup_product(product_id)
            .cloned()
            .ok_or_else(|| SessionError::ProductNotFound(product_id.to_string()))?;
        Ok(Self {
            id: Uuid::new_v4(),
            capture: CaptureManager::new(backends.camera, config.stream_constraints()),
            config,
            product,
            detector_factory: backends.detector,
            assets: backends.assets,
            renderer_factory: backends.renderer,
            tracker: None,
            asset: None,
            scene: None,
            compositor: None,
            calibration: None,
            stream: None,
            pending: None,
            status: SessionStatus::Loading,
            failure: None,
            live: false,
            scan_progress: 0,
            face_live: false,
            size_multiplier: 1.0,
            frames_presented: 0,
            started_at: None,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn failure(&self) -> Option<&SessionFailure> {
        self.failure.as_ref()
    }

    pub fn product(&self) -> &Product {
        &self.product
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn size_multiplier(&self) -> f32 {
        self.size_multiplier
    }

    /// Acquire the camera, load the asset, start the tracker, then begin the
    /// calibration scan. Failures release whatever was acquired and land in
    /// `Error`.
    pub fn start(&mut self) -> SessionStatus {
        self.teardown();
        self.status = SessionStatus::Loading;
        self.failure = None;
        tracing::info!(session = %self.id, product = %self.product.id, "session loading");

        match self.load() {
            Ok(()) => {
                self.live = true;
                self.started_at = Some(Utc::now());
                self.enter_scanning();
            }
            Err(e) => self.fail(e),
        }
        self.status
    }

    fn load(&mut self) -> Result<(), SessionError> {
        let stream = self.capture.acquire()?;
        self.stream = Some(stream);
        tracing::info!(
            session = %self.id,
            device = %self.config.camera_device,
            width = stream.width,
            height = stream.height,
            "camera acquired"
        );

        let path = self.product.model_path(&self.config.asset_dir);
        let raw = self.assets.load(&path)?;
        let asset = OverlayAsset::prepare(raw, &self.product.overrides())?;
        tracing::info!(
            session = %self.id,
            product = %self.product.id,
            native_width = asset.native_width,
            "asset loaded"
        );

        self.calibration = Some(Calibration::new(
            self.config.scan_capacity,
            self.config.estimator_params().blend,
            self.product.scale,
            asset.native_width,
        )?);
        self.build_surface(asset.clone(), stream.width, stream.height)?;
        self.asset = Some(asset);

        let detector = (self.detector_factory)(&self.config.tracker_config())?;
        self.tracker = Some(spawn_tracker(detector)?);
        Ok(())
    }

    fn build_surface(
        &mut self,
        asset: OverlayAsset,
        width: u32,
        height: u32,
    ) -> Result<(), SessionError> {
        if let Some(mut old) = self.scene.take() {
            old.dispose();
        }
        let renderer = (self.renderer_factory)(width, height)?;
        let scene_config = self.config.scene_config(self.product.offset_y);
        self.scene = Some(OverlayScene::new(asset, width, height, scene_config, renderer)?);
        self.compositor = Some(Compositor::new(width, height));
        Ok(())
    }

    fn enter_scanning(&mut self) {
        if let Some(cal) = self.calibration.as_mut() {
            cal.reset();
        }
        if let Some(scene) = self.scene.as_mut() {
            scene.reset_tracking();
            scene.hide();
        }
        if let Some(tracker) = self.tracker.as_mut() {
            tracker.reset();
        }
        // A result still in flight belongs to the previous scan; `apply` drops
        // it once nothing is pending.
        self.pending = None;
        self.scan_progress = 0;
        self.status = SessionStatus::Scanning;
        tracing::info!(session = %self.id, "calibration scan started");
    }

    fn fail(&mut self, err: SessionError) {
        self.teardown();
        let failure = err.to_failure();
        tracing::warn!(session = %self.id, kind = ?failure.kind, error = %err, "session failed");
        self.failure = Some(failure);
        self.status = SessionStatus::Error;
    }

    /// Retry after a failure: back through `Loading`.
    pub fn retry(&mut self) -> Result<SessionStatus, SessionError> {
        if self.status != SessionStatus::Error {
            return Err(SessionError::NotFailed(self.status));
        }
        Ok(self.start())
    }

    /// Re-run the calibration scan.
    pub fn rescan(&mut self) -> SessionStatus {
        if self.live && matches!(self.status, SessionStatus::Scanning | SessionStatus::Running) {
            self.enter_scanning();
        }
        self.status
    }

    /// Switch product: the session is torn down and rebuilt around the new one.
    pub fn select_product(&mut self, product_id: &str) -> Result<SessionStatus, SessionError> {
        let product = tryon_core::lookup_product(product_id)
            .cloned()
            .ok_or_else(|| SessionError::ProductNotFound(product_id.to_string()))?;
        self.stop();
        self.product = product;
        Ok(self.start())
    }

    /// Set the size multiplier, clamped to the configured bounds.
    pub fn set_size_multiplier(&mut self, value: f32) -> f32 {
        let params = self.config.estimator_params();
        self.size_multiplier = params.clamp_multiplier(value);
        self.size_multiplier
    }

    /// Nudge the multiplier by `steps` increments of 0.05, rounded to two decimals.
    pub fn step_size(&mut self, steps: i32) -> f32 {
        let next = ((self.size_multiplier + steps as f32 * SIZE_STEP) * 100.0).round() / 100.0;
        self.set_size_multiplier(next)
    }

    pub fn reset_size(&mut self) -> f32 {
        self.set_size_multiplier(1.0)
    }

    /// One non-blocking frame-loop iteration: apply a finished tracker result,
    /// then hand the next camera frame to the tracker if it is idle.
    pub fn tick(&mut self) -> TickReport {
        let mut report = TickReport {
            status: self.status,
            submitted: false,
            processed: None,
        };
        if !self.is_looping() {
            return report;
        }

        if let Some(output) = self.tracker.as_mut().and_then(|t| t.poll()) {
            report.processed = Some(output.sequence);
            self.apply(output);
        }
        if self.is_looping() {
            report.submitted = self.submit_next();
        }
        report.status = self.status;
        report
    }

    /// Capture one frame and wait for its result. Drives the loop one frame
    /// at a time; useful when the caller wants every frame processed.
    pub async fn step(&mut self) -> TickReport {
        let mut report = self.tick();
        if !self.is_looping() {
            return report;
        }
        if let Some(output) = self.wait_tracker().await {
            report.processed = Some(output.sequence);
            self.apply(output);
        }
        report.status = self.status;
        report
    }

    async fn wait_tracker(&mut self) -> Option<TrackerOutput> {
        self.tracker.as_mut()?.wait().await
    }

    fn is_looping(&self) -> bool {
        self.live && matches!(self.status, SessionStatus::Scanning | SessionStatus::Running)
    }

    fn submit_next(&mut self) -> bool {
        let Some(tracker) = self.tracker.as_mut() else {
            return false;
        };
        if tracker.is_busy() {
            return false;
        }
        let frame = match self.capture.read_frame() {
            Ok(frame) => Arc::new(frame),
            Err(e) => {
                tracing::warn!(session = %self.id, error = %e, "frame read failed");
                return false;
            }
        };
        match tracker.try_submit(frame.clone()) {
            Ok(SubmitOutcome::Submitted) => {
                self.pending = Some(frame);
                true
            }
            Ok(SubmitOutcome::Dropped) => false,
            Err(e) => {
                self.fail(e.into());
                false
            }
        }
    }

    /// Apply one tracker result: calibration or tracking, then composite.
    fn apply(&mut self, output: TrackerOutput) {
        let Some(frame) = self.pending.take().filter(|f| f.sequence == output.sequence) else {
            tracing::debug!(sequence = output.sequence, "result without a pending frame ignored");
            return;
        };
        if !self.is_looping() {
            return;
        }
        self.face_live = output.landmarks.is_some();

        if let Some(stream) = self.stream {
            if (frame.width, frame.height) != (stream.width, stream.height) {
                if let Err(e) = self.resize_surface(frame.width, frame.height) {
                    self.fail(e);
                    return;
                }
            }
        }

        let mut draw_overlay = false;
        match self.status {
            SessionStatus::Scanning => {
                if let (Some(lms), Some(cal)) = (&output.landmarks, self.calibration.as_mut()) {
                    let m = FaceMeasurements::from_landmarks(lms, frame.width, frame.height);
                    let progress = cal.push(m.sample());
                    self.scan_progress = progress.percent;
                    if progress.completed.is_some() {
                        self.status = SessionStatus::Running;
                        tracing::info!(session = %self.id, "calibration complete, tracking");
                    }
                }
            }
            SessionStatus::Running => {
                let ratio = self
                    .calibration
                    .as_ref()
                    .and_then(|c| c.result())
                    .map(|r| r.pixel_to_scene_ratio);
                if let (Some(ratio), Some(scene)) = (ratio, self.scene.as_mut()) {
                    let params = self.config.estimator_params();
                    let state = scene.track(
                        output.landmarks.as_ref(),
                        ratio,
                        self.size_multiplier,
                        &params,
                    );
                    draw_overlay = state.visible;
                }
            }
            SessionStatus::Loading | SessionStatus::Error => return,
        }

        if let Err(e) = self.present(&frame, draw_overlay) {
            if e.failure_kind() == FailureKind::RenderContextLost {
                self.fail(e);
            } else {
                tracing::warn!(session = %self.id, error = %e, "frame composite failed");
            }
        }
    }

    fn present(&mut self, frame: &Frame, draw_overlay: bool) -> Result<(), SessionError> {
        let Some(compositor) = self.compositor.as_mut() else {
            return Ok(());
        };
        let overlay = match (draw_overlay, self.scene.as_mut()) {
            (true, Some(scene)) => Some(scene.render()?),
            _ => None,
        };
        compositor.compose(&frame.data, frame.width, frame.height, overlay)?;
        self.frames_presented += 1;
        Ok(())
    }

    fn resize_surface(&mut self, width: u32, height: u32) -> Result<(), SessionError> {
        tracing::warn!(
            session = %self.id,
            width,
            height,
            "frame size differs from stream; rebuilding surface"
        );
        let Some(asset) = self.asset.clone() else {
            return Ok(());
        };
        let tracking = self.scene.as_ref().map(|s| *s.tracking());
        self.build_surface(asset, width, height)?;
        if let (Some(scene), Some(state)) = (self.scene.as_mut(), tracking) {
            scene.apply_tracking(state);
        }
        self.stream = Some(StreamInfo { width, height });
        Ok(())
    }

    /// The composited canvas as the user sees it (mirrored).
    pub fn presented(&self) -> Option<RgbaImage> {
        self.compositor
            .as_ref()
            .filter(|_| self.frames_presented > 0)
            .map(|c| c.present_mirrored())
    }

    /// PNG of the mirrored canvas.
    pub fn capture(&self) -> Result<Vec<u8>, SessionError> {
        match (self.status, self.compositor.as_ref()) {
            (SessionStatus::Running, Some(compositor)) if self.frames_presented > 0 => {
                Ok(compositor.encode_png()?)
            }
            _ => Err(SessionError::NotRunning(self.status)),
        }
    }

    /// Write a capture to `tryon-<unix-millis>.png` in the capture directory.
    pub fn save_capture(&self) -> Result<PathBuf, SessionError> {
        let png = self.capture()?;
        std::fs::create_dir_all(&self.config.capture_dir)?;
        let path = self
            .config
            .capture_dir
            .join(format!("tryon-{}.png", Utc::now().timestamp_millis()));
        std::fs::write(&path, png)?;
        tracing::info!(session = %self.id, path = %path.display(), "capture saved");
        Ok(path)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id,
            product_id: self.product.id.clone(),
            status: self.status,
            failure: self.failure.clone(),
            live: self.live,
            scan_progress: self.scan_progress,
            face_live: self.face_live,
            size_multiplier: self.size_multiplier,
            frames_presented: self.frames_presented,
            stream: self.stream.map(|s| (s.width, s.height)),
            tracking: self.scene.as_ref().map(|s| *s.tracking()),
            calibration: self
                .calibration
                .as_ref()
                .filter(|c| c.phase() == CalibrationPhase::Done)
                .and_then(|c| c.result().copied()),
            tracker: self.tracker.as_ref().map(|t| t.stats()),
            started_at: self.started_at,
        }
    }

    /// Release everything and reset all flags. Safe to call in any state and
    /// more than once.
    pub fn stop(&mut self) {
        let was_live = self.live;
        self.teardown();
        self.status = SessionStatus::Loading;
        self.failure = None;
        if was_live {
            tracing::info!(session = %self.id, frames = self.frames_presented, "session stopped");
        }
    }

    fn teardown(&mut self) {
        self.live = false;
        self.pending = None;
        if let Some(mut tracker) = self.tracker.take() {
            tracker.dispose();
        }
        self.capture.release();
        if let Some(mut scene) = self.scene.take() {
            scene.dispose();
        }
        self.asset = None;
        self.compositor = None;
        self.calibration = None;
        self.stream = None;
        self.scan_progress = 0;
        self.face_live = false;
        self.started_at = None;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}
