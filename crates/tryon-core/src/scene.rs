//! Overlay scene: the eyewear group, the depth-only face occluder and the
//! orthographic camera they are rendered through.
//!
//! Scene space is the raw video frame with the origin at its center, +x right
//! and +y up; one scene unit is one video pixel.

use crate::asset::{Material, MeshRole, OverlayAsset, SceneMesh};
use crate::estimator::{self, EstimatorParams};
use crate::landmarks::{FaceMeasurements, FrameLandmarks};
use crate::render::{RenderError, RenderItem, Renderer};
use crate::types::TrackingState;
use image::RgbaImage;
use nalgebra::{Isometry3, Matrix4, Orthographic3, Point3, Rotation3, Vector3};
use serde::{Deserialize, Serialize};
use std::f32::consts::TAU;
use thiserror::Error;

pub const CAMERA_Z: f32 = 500.0;
pub const CAMERA_NEAR: f32 = 1.0;
pub const CAMERA_FAR: f32 = 3000.0;
pub const OCCLUDER_RENDER_ORDER: i32 = 0;

#[derive(Error, Debug)]
pub enum SceneError {
    #[error("scene has been disposed")]
    Disposed,
    #[error("invalid surface size {0}x{1}")]
    InvalidSurface(u32, u32),
    #[error(transparent)]
    Render(#[from] RenderError),
}

/// Orthographic camera whose frustum matches the video frame pixel for pixel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrthoCamera {
    pub width: u32,
    pub height: u32,
    pub near: f32,
    pub far: f32,
    pub z: f32,
}

impl OrthoCamera {
    pub fn for_surface(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            near: CAMERA_NEAR,
            far: CAMERA_FAR,
            z: CAMERA_Z,
        }
    }

    fn half(&self) -> (f32, f32) {
        (self.width as f32 / 2.0, self.height as f32 / 2.0)
    }

    /// Raw image pixel to scene coordinates.
    pub fn image_to_scene(&self, px: f32, py: f32) -> (f32, f32) {
        let (hw, hh) = self.half();
        (px - hw, hh - py)
    }

    pub fn scene_to_image(&self, x: f32, y: f32) -> (f32, f32) {
        let (hw, hh) = self.half();
        (x + hw, hh - y)
    }

    /// World to clip transform: camera at +z looking at the origin.
    pub fn view_projection(&self) -> Matrix4<f32> {
        let (hw, hh) = self.half();
        let view = Isometry3::look_at_rh(
            &Point3::new(0.0, 0.0, self.z),
            &Point3::origin(),
            &Vector3::y(),
        );
        let proj = Orthographic3::new(-hw, hw, -hh, hh, self.near, self.far);
        proj.as_matrix() * view.to_homogeneous()
    }

    /// Project a world point to (pixel x, pixel y, ndc depth). Depth grows away
    /// from the camera; points outside [-1, 1] lie beyond the clip planes.
    pub fn project(&self, view_proj: &Matrix4<f32>, p: &Point3<f32>) -> (f32, f32, f32) {
        let ndc = view_proj.transform_point(p);
        let px = (ndc.x + 1.0) * 0.5 * self.width as f32;
        let py = (1.0 - ndc.y) * 0.5 * self.height as f32;
        (px, py, ndc.z)
    }
}

/// Translation, in-plane rotation and scale of a scene node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub translation: Vector3<f32>,
    pub rotation_z: f32,
    pub scale: Vector3<f32>,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            translation: Vector3::zeros(),
            rotation_z: 0.0,
            scale: Vector3::new(1.0, 1.0, 1.0),
        }
    }
}

impl Transform {
    pub fn to_matrix(&self) -> Matrix4<f32> {
        Matrix4::new_translation(&self.translation)
            * Rotation3::from_axis_angle(&Vector3::z_axis(), self.rotation_z).to_homogeneous()
            * Matrix4::new_nonuniform_scaling(&self.scale)
    }
}

/// Tunable fit of the occluder ellipse and the product placement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SceneConfig {
    /// Half-width as a fraction of the ear-to-ear distance.
    pub occluder_width_pad: f32,
    /// Half-height as a fraction of the forehead-to-chin distance.
    pub occluder_height_pad: f32,
    /// Occluder plane depth; behind the frame front, ahead of the temple tips.
    pub occluder_depth: f32,
    pub occluder_segments: u32,
    /// Vertical product nudge in scene pixels, positive up.
    pub offset_y: f32,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            occluder_width_pad: 0.58,
            occluder_height_pad: 0.56,
            occluder_depth: -20.0,
            occluder_segments: 40,
            offset_y: 0.0,
        }
    }
}

/// Face-oval ellipse in scene space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OccluderFit {
    pub center_x: f32,
    pub center_y: f32,
    pub half_width: f32,
    pub half_height: f32,
    pub roll: f32,
}

impl OccluderFit {
    pub fn from_measurements(
        m: &FaceMeasurements,
        camera: &OrthoCamera,
        config: &SceneConfig,
    ) -> Self {
        let mid_x = (m.cheek_left.x + m.cheek_right.x) / 2.0;
        let mid_y = (m.cheek_left.y + m.cheek_right.y) / 2.0;
        let (center_x, center_y) = camera.image_to_scene(mid_x, mid_y);
        Self {
            center_x,
            center_y,
            half_width: nalgebra::distance(&m.cheek_left, &m.cheek_right)
                * config.occluder_width_pad,
            half_height: (m.chin.y - m.forehead.y).abs() * config.occluder_height_pad,
            roll: m.roll(),
        }
    }

    fn transform(&self, depth: f32) -> Transform {
        Transform {
            translation: Vector3::new(self.center_x, self.center_y, depth),
            rotation_z: -self.roll,
            scale: Vector3::new(self.half_width, self.half_height, 1.0),
        }
    }
}

/// Unit disc in the xy-plane, wound to face +z.
pub fn ellipse_mesh(segments: u32) -> SceneMesh {
    let segments = segments.max(3);
    let mut positions = Vec::with_capacity(segments as usize + 1);
    positions.push(Point3::origin());
    for i in 0..segments {
        let theta = TAU * i as f32 / segments as f32;
        positions.push(Point3::new(theta.cos(), theta.sin(), 0.0));
    }
    let triangles = (0..segments)
        .map(|i| [0, i + 1, (i + 1) % segments + 1])
        .collect();
    SceneMesh {
        name: "face-occluder".into(),
        role: MeshRole::Occluder,
        positions,
        triangles,
        material: Material::depth_only(),
        render_order: OCCLUDER_RENDER_ORDER,
    }
}

/// Owns the overlay, the occluder, the tracking state and the renderer.
pub struct OverlayScene {
    camera: OrthoCamera,
    config: SceneConfig,
    overlay: Vec<SceneMesh>,
    overlay_transform: Transform,
    overlay_visible: bool,
    occluder: SceneMesh,
    occluder_transform: Transform,
    occluder_visible: bool,
    tracking: TrackingState,
    native_width: f32,
    renderer: Option<Box<dyn Renderer>>,
}

impl OverlayScene {
    /// Build the scene for a `width` x `height` video. Overlay and occluder
    /// start hidden.
    pub fn new(
        asset: OverlayAsset,
        width: u32,
        height: u32,
        config: SceneConfig,
        renderer: Box<dyn Renderer>,
    ) -> Result<Self, SceneError> {
        if width == 0 || height == 0 {
            return Err(SceneError::InvalidSurface(width, height));
        }
        let (rw, rh) = renderer.surface_size();
        if (rw, rh) != (width, height) {
            return Err(RenderError::SurfaceMismatch {
                expected: (width, height),
                actual: (rw, rh),
            }
            .into());
        }

        tracing::debug!(width, height, meshes = asset.meshes.len(), "overlay scene created");
        Ok(Self {
            camera: OrthoCamera::for_surface(width, height),
            occluder: ellipse_mesh(config.occluder_segments),
            config,
            native_width: asset.native_width,
            overlay: asset.meshes,
            overlay_transform: Transform::default(),
            overlay_visible: false,
            occluder_transform: Transform::default(),
            occluder_visible: false,
            tracking: TrackingState::default(),
            renderer: Some(renderer),
        })
    }

    pub fn camera(&self) -> &OrthoCamera {
        &self.camera
    }

    pub fn config(&self) -> &SceneConfig {
        &self.config
    }

    pub fn native_width(&self) -> f32 {
        self.native_width
    }

    pub fn tracking(&self) -> &TrackingState {
        &self.tracking
    }

    pub fn overlay_transform(&self) -> &Transform {
        &self.overlay_transform
    }

    pub fn occluder_transform(&self) -> &Transform {
        &self.occluder_transform
    }

    pub fn is_overlay_visible(&self) -> bool {
        self.overlay_visible
    }

    pub fn is_occluder_visible(&self) -> bool {
        self.occluder_visible
    }

    pub fn is_disposed(&self) -> bool {
        self.renderer.is_none()
    }

    /// Forget the smoothing history so the next acquisition snaps.
    pub fn reset_tracking(&mut self) {
        self.tracking = TrackingState::default();
    }

    /// Run one estimator step and place the overlay and occluder from it.
    pub fn track(
        &mut self,
        landmarks: Option<&FrameLandmarks>,
        pixel_to_scene_ratio: f32,
        multiplier: f32,
        params: &EstimatorParams,
    ) -> TrackingState {
        let frame = (self.camera.width, self.camera.height);
        let next = estimator::estimate(
            &self.tracking,
            landmarks,
            frame,
            pixel_to_scene_ratio,
            multiplier,
            params,
        );
        self.apply_tracking(next);
        match landmarks {
            Some(lms) => {
                let m = FaceMeasurements::from_landmarks(lms, frame.0, frame.1);
                self.fit_occluder(&m);
            }
            None => self.occluder_visible = false,
        }
        next
    }

    /// Store `state` and move the overlay group to it.
    pub fn apply_tracking(&mut self, state: TrackingState) {
        self.tracking = state;
        self.overlay_visible = state.visible;
        if !state.visible {
            return;
        }
        let (x, y) = self.camera.image_to_scene(state.anchor.x, state.anchor.y);
        self.overlay_transform = Transform {
            translation: Vector3::new(x, y + self.config.offset_y, 0.0),
            rotation_z: -state.roll,
            scale: Vector3::new(state.scale, state.scale, state.scale),
        };
    }

    /// Fit the occluder to the raw (unsmoothed) face oval and show it.
    pub fn fit_occluder(&mut self, m: &FaceMeasurements) {
        let fit = OccluderFit::from_measurements(m, &self.camera, &self.config);
        self.occluder_transform = fit.transform(self.config.occluder_depth);
        self.occluder_visible = true;
    }

    /// Hide the overlay and occluder; tracking values stay where they are.
    pub fn hide(&mut self) {
        self.overlay_visible = false;
        self.occluder_visible = false;
        self.tracking.visible = false;
    }

    /// Render visible nodes to the off-screen surface.
    pub fn render(&mut self) -> Result<&RgbaImage, SceneError> {
        let renderer = self.renderer.as_mut().ok_or(SceneError::Disposed)?;

        let mut items = Vec::with_capacity(self.overlay.len() + 1);
        if self.occluder_visible {
            items.push(RenderItem {
                mesh: &self.occluder,
                model: self.occluder_transform.to_matrix(),
            });
        }
        if self.overlay_visible {
            let model = self.overlay_transform.to_matrix();
            items.extend(self.overlay.iter().map(|mesh| RenderItem { mesh, model }));
        }

        Ok(renderer.render(&items, &self.camera)?)
    }

    /// Release the renderer and all geometry. Safe to call repeatedly.
    pub fn dispose(&mut self) {
        if let Some(mut renderer) = self.renderer.take() {
            renderer.dispose();
            tracing::debug!("overlay scene disposed");
        }
        self.overlay.clear();
        self.overlay_visible = false;
        self.occluder_visible = false;
    }
}

impl Drop for OverlayScene {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::tests::{box_mesh, lens_props};
    use crate::asset::{MaterialOverrides, MaterialProps, RawAsset};
    use crate::landmarks::tests::synthetic_face;
    use crate::render::SoftwareRenderer;

    fn glasses() -> OverlayAsset {
        let raw = RawAsset {
            meshes: vec![
                box_mesh(
                    "rim",
                    [-0.07, -0.02, -0.08],
                    [0.07, 0.02, -0.075],
                    MaterialProps::default(),
                ),
                box_mesh("lens", [-0.06, -0.015, -0.079], [0.06, 0.015, -0.076], lens_props()),
            ],
        };
        OverlayAsset::prepare(raw, &MaterialOverrides::default()).unwrap()
    }

    fn scene(w: u32, h: u32) -> OverlayScene {
        let renderer = SoftwareRenderer::new(w, h).unwrap();
        OverlayScene::new(glasses(), w, h, SceneConfig::default(), Box::new(renderer)).unwrap()
    }

    #[test]
    fn test_image_scene_round_trip() {
        let cam = OrthoCamera::for_surface(1280, 720);
        assert_eq!(cam.image_to_scene(640.0, 360.0), (0.0, 0.0));
        assert_eq!(cam.image_to_scene(0.0, 0.0), (-640.0, 360.0));
        let (x, y) = cam.image_to_scene(100.0, 50.0);
        assert_eq!(cam.scene_to_image(x, y), (100.0, 50.0));
    }

    #[test]
    fn test_projection_is_pixel_exact() {
        let cam = OrthoCamera::for_surface(640, 480);
        let vp = cam.view_projection();
        let (x, y) = cam.image_to_scene(123.0, 45.0);
        let (px, py, depth) = cam.project(&vp, &Point3::new(x, y, 0.0));
        assert!((px - 123.0).abs() < 1e-3);
        assert!((py - 45.0).abs() < 1e-3);
        assert!(depth > -1.0 && depth < 1.0);

        // Nearer points get smaller depth.
        let (_, _, near) = cam.project(&vp, &Point3::new(0.0, 0.0, 100.0));
        let (_, _, far) = cam.project(&vp, &Point3::new(0.0, 0.0, -100.0));
        assert!(near < far);
    }

    #[test]
    fn test_rejects_mismatched_renderer() {
        let renderer = SoftwareRenderer::new(320, 240).unwrap();
        let err =
            OverlayScene::new(glasses(), 640, 480, SceneConfig::default(), Box::new(renderer));
        assert!(matches!(
            err,
            Err(SceneError::Render(RenderError::SurfaceMismatch { .. }))
        ));
    }

    #[test]
    fn test_hidden_until_tracked() {
        let mut s = scene(1000, 1000);
        assert!(!s.is_overlay_visible());
        assert!(!s.is_occluder_visible());
        let surface = s.render().unwrap();
        assert!(surface.pixels().all(|p| p.0[3] == 0));
    }

    #[test]
    fn test_track_places_overlay() {
        let mut s = scene(1000, 1000);
        let lms = synthetic_face(150.0, 100.0);
        let state = s.track(Some(&lms), 1.0, 1.0, &EstimatorParams::default());
        assert!(state.visible);
        assert!(s.is_overlay_visible() && s.is_occluder_visible());

        // Anchor (500, 470) in image space is (0, 30) in scene space.
        let t = s.overlay_transform();
        assert!(t.translation.x.abs() < 1e-3);
        assert!((t.translation.y - 30.0).abs() < 1e-3);
        assert!((t.scale.x - 135.0).abs() < 1e-3);

        // Occluder: cheeks at x 425/575, y 500; forehead 380, chin 640.
        let o = s.occluder_transform();
        assert!((o.translation.y - 0.0).abs() < 1e-3);
        assert!((o.translation.z + 20.0).abs() < 1e-6);
        assert!((o.scale.x - 150.0 * 0.58).abs() < 1e-3);
        assert!((o.scale.y - 260.0 * 0.56).abs() < 1e-3);

        let surface = s.render().unwrap();
        assert!(surface.pixels().any(|p| p.0[3] > 0));
    }

    #[test]
    fn test_lost_face_hides_but_keeps_pose() {
        let mut s = scene(1000, 1000);
        let lms = synthetic_face(150.0, 100.0);
        let params = EstimatorParams::default();
        let tracked = s.track(Some(&lms), 1.0, 1.0, &params);
        let before = *s.overlay_transform();

        let lost = s.track(None, 1.0, 1.0, &params);
        assert!(!lost.visible);
        assert!(!s.is_overlay_visible() && !s.is_occluder_visible());
        assert_eq!(lost.anchor, tracked.anchor);
        assert_eq!(*s.overlay_transform(), before);
    }

    #[test]
    fn test_offset_moves_overlay_up() {
        let renderer = SoftwareRenderer::new(1000, 1000).unwrap();
        let config = SceneConfig {
            offset_y: 12.0,
            ..SceneConfig::default()
        };
        let mut s = OverlayScene::new(glasses(), 1000, 1000, config, Box::new(renderer)).unwrap();
        s.track(Some(&synthetic_face(150.0, 100.0)), 1.0, 1.0, &EstimatorParams::default());
        assert!((s.overlay_transform().translation.y - 42.0).abs() < 1e-3);
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let mut s = scene(64, 64);
        s.dispose();
        s.dispose();
        assert!(s.is_disposed());
        assert!(matches!(s.render(), Err(SceneError::Disposed)));
    }

    #[test]
    fn test_ellipse_mesh_faces_camera() {
        let disc = ellipse_mesh(40);
        assert_eq!(disc.positions.len(), 41);
        assert_eq!(disc.triangles.len(), 40);
        assert!(!disc.material.color_write);
        for [a, b, c] in &disc.triangles {
            let (a, b, c) = (
                disc.positions[*a as usize],
                disc.positions[*b as usize],
                disc.positions[*c as usize],
            );
            assert!((b - a).cross(&(c - a)).z > 0.0);
        }
    }
}
