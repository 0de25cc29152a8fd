//! Face-mesh landmark sets and the pixel-space measurements derived from them.
//!
//! Landmarks arrive normalized to the raw (unmirrored) video frame: x and y in
//! [0, 1], z relative depth. Every measurement here is taken in raw pixel
//! space; mirroring is a presentation concern handled by the compositor.

use crate::calibration::CalibrationSample;
use crate::estimator::SpanBlend;
use crate::types::Anchor;
use nalgebra::Point2;
use thiserror::Error;

/// Landmark count of the base face mesh.
pub const BASE_LANDMARK_COUNT: usize = 468;
/// Landmark count with refined iris points (468..478).
pub const REFINED_LANDMARK_COUNT: usize = 478;

/// Face-mesh indices the tracker depends on.
pub mod index {
    pub const OUTER_EYE_LEFT: usize = 33;
    pub const INNER_EYE_LEFT: usize = 133;
    pub const INNER_EYE_RIGHT: usize = 362;
    pub const OUTER_EYE_RIGHT: usize = 263;
    pub const IRIS_LEFT: usize = 468;
    pub const IRIS_RIGHT: usize = 473;
    pub const NOSE_BRIDGE: usize = 168;
    pub const GLABELLA: usize = 6;
    pub const TEMPLE_LEFT: usize = 127;
    pub const TEMPLE_RIGHT: usize = 356;
    pub const CHEEK_LEFT: usize = 234;
    pub const CHEEK_RIGHT: usize = 454;
    pub const FOREHEAD: usize = 10;
    pub const CHIN: usize = 152;
}

#[derive(Error, Debug)]
pub enum LandmarkError {
    #[error("incomplete landmark set: got {0} points, expected 468 or 478")]
    IncompleteSet(usize),
    #[error("landmark {0} is not finite")]
    NonFinite(usize),
}

/// One normalized landmark.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LandmarkPoint {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl LandmarkPoint {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// A complete landmark set for one processed frame. Partial sets cannot be built.
#[derive(Debug, Clone)]
pub struct FrameLandmarks {
    points: Vec<LandmarkPoint>,
}

impl FrameLandmarks {
    pub fn new(points: Vec<LandmarkPoint>) -> Result<Self, LandmarkError> {
        if points.len() != BASE_LANDMARK_COUNT && points.len() != REFINED_LANDMARK_COUNT {
            return Err(LandmarkError::IncompleteSet(points.len()));
        }
        if let Some(i) = points
            .iter()
            .position(|p| !(p.x.is_finite() && p.y.is_finite() && p.z.is_finite()))
        {
            return Err(LandmarkError::NonFinite(i));
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[LandmarkPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Whether the iris points are present.
    pub fn is_refined(&self) -> bool {
        self.points.len() == REFINED_LANDMARK_COUNT
    }

    pub fn get(&self, i: usize) -> Option<LandmarkPoint> {
        self.points.get(i).copied()
    }

    /// Drop the iris points, keeping the base mesh.
    pub fn without_iris(mut self) -> Self {
        self.points.truncate(BASE_LANDMARK_COUNT);
        self
    }

    fn pixel(&self, i: usize, width: f32, height: f32) -> Point2<f32> {
        let p = self.points[i];
        Point2::new(p.x * width, p.y * height)
    }

    /// Iris center, falling back to the inner eye corner on a base mesh.
    fn iris_or_corner(&self, iris: usize, corner: usize, width: f32, height: f32) -> Point2<f32> {
        if self.is_refined() {
            self.pixel(iris, width, height)
        } else {
            self.pixel(corner, width, height)
        }
    }
}

/// Pixel-space landmarks used for anchoring, scaling and occlusion.
#[derive(Debug, Clone, Copy)]
pub struct FaceMeasurements {
    pub iris_left: Point2<f32>,
    pub iris_right: Point2<f32>,
    pub outer_left: Point2<f32>,
    pub outer_right: Point2<f32>,
    pub inner_left: Point2<f32>,
    pub inner_right: Point2<f32>,
    pub nose_bridge: Point2<f32>,
    pub glabella: Point2<f32>,
    pub temple_left: Point2<f32>,
    pub temple_right: Point2<f32>,
    pub cheek_left: Point2<f32>,
    pub cheek_right: Point2<f32>,
    pub forehead: Point2<f32>,
    pub chin: Point2<f32>,
}

impl FaceMeasurements {
    /// Project a landmark set onto a `width` x `height` raw video frame.
    pub fn from_landmarks(lms: &FrameLandmarks, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        let px = |i| lms.pixel(i, w, h);
        Self {
            iris_left: lms.iris_or_corner(index::IRIS_LEFT, index::INNER_EYE_LEFT, w, h),
            iris_right: lms.iris_or_corner(index::IRIS_RIGHT, index::INNER_EYE_RIGHT, w, h),
            outer_left: px(index::OUTER_EYE_LEFT),
            outer_right: px(index::OUTER_EYE_RIGHT),
            inner_left: px(index::INNER_EYE_LEFT),
            inner_right: px(index::INNER_EYE_RIGHT),
            nose_bridge: px(index::NOSE_BRIDGE),
            glabella: px(index::GLABELLA),
            temple_left: px(index::TEMPLE_LEFT),
            temple_right: px(index::TEMPLE_RIGHT),
            cheek_left: px(index::CHEEK_LEFT),
            cheek_right: px(index::CHEEK_RIGHT),
            forehead: px(index::FOREHEAD),
            chin: px(index::CHIN),
        }
    }

    pub fn temple_span(&self) -> f32 {
        nalgebra::distance(&self.temple_left, &self.temple_right)
    }

    pub fn outer_eye_span(&self) -> f32 {
        nalgebra::distance(&self.outer_left, &self.outer_right)
    }

    pub fn blended_span(&self, blend: &SpanBlend) -> f32 {
        blend.apply(self.temple_span(), self.outer_eye_span())
    }

    /// X from the iris midpoint; Y from nose bridge and glabella, which do not
    /// follow the eyebrows.
    pub fn anchor(&self) -> Anchor {
        Anchor {
            x: (self.iris_left.x + self.iris_right.x) / 2.0,
            y: (self.nose_bridge.y + self.glabella.y) / 2.0,
        }
    }

    /// Head roll as the circular mean of the outer- and inner-corner angles.
    pub fn roll(&self) -> f32 {
        let outer = self.outer_right - self.outer_left;
        let inner = self.inner_right - self.inner_left;
        let a = outer.y.atan2(outer.x);
        let b = inner.y.atan2(inner.x);
        (a.sin() + b.sin()).atan2(a.cos() + b.cos())
    }

    pub fn sample(&self) -> CalibrationSample {
        CalibrationSample {
            temple_span_px: self.temple_span(),
            outer_eye_span_px: self.outer_eye_span(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Synthetic face for a 1000x1000 frame: positions in pixels / 1000.
    pub(crate) fn synthetic_face(temple_span_px: f32, eye_span_px: f32) -> FrameLandmarks {
        let mut points = vec![LandmarkPoint::new(0.5, 0.5, 0.0); REFINED_LANDMARK_COUNT];
        let c = 500.0;
        let mut set = |i: usize, x: f32, y: f32| {
            points[i] = LandmarkPoint::new(x / 1000.0, y / 1000.0, 0.0);
        };
        set(index::TEMPLE_LEFT, c - temple_span_px / 2.0, 480.0);
        set(index::TEMPLE_RIGHT, c + temple_span_px / 2.0, 480.0);
        set(index::OUTER_EYE_LEFT, c - eye_span_px / 2.0, 470.0);
        set(index::OUTER_EYE_RIGHT, c + eye_span_px / 2.0, 470.0);
        set(index::INNER_EYE_LEFT, c - 15.0, 470.0);
        set(index::INNER_EYE_RIGHT, c + 15.0, 470.0);
        set(index::IRIS_LEFT, c - 32.0, 470.0);
        set(index::IRIS_RIGHT, c + 32.0, 470.0);
        set(index::NOSE_BRIDGE, c, 480.0);
        set(index::GLABELLA, c, 460.0);
        set(index::CHEEK_LEFT, c - 75.0, 500.0);
        set(index::CHEEK_RIGHT, c + 75.0, 500.0);
        set(index::FOREHEAD, c, 380.0);
        set(index::CHIN, c, 640.0);
        FrameLandmarks::new(points).unwrap()
    }

    #[test]
    fn test_partial_sets_rejected() {
        let err = FrameLandmarks::new(vec![LandmarkPoint::default(); 100]).unwrap_err();
        assert!(matches!(err, LandmarkError::IncompleteSet(100)));
    }

    #[test]
    fn test_non_finite_rejected() {
        let mut points = vec![LandmarkPoint::default(); BASE_LANDMARK_COUNT];
        points[12].x = f32::NAN;
        assert!(matches!(
            FrameLandmarks::new(points),
            Err(LandmarkError::NonFinite(12))
        ));
    }

    #[test]
    fn test_spans_in_pixels() {
        let lms = synthetic_face(150.0, 100.0);
        let m = FaceMeasurements::from_landmarks(&lms, 1000, 1000);
        assert!((m.temple_span() - 150.0).abs() < 1e-3);
        assert!((m.outer_eye_span() - 100.0).abs() < 1e-3);
    }

    #[test]
    fn test_anchor_uses_iris_and_bridge() {
        let lms = synthetic_face(150.0, 100.0);
        let m = FaceMeasurements::from_landmarks(&lms, 1000, 1000);
        let anchor = m.anchor();
        assert!((anchor.x - 500.0).abs() < 1e-3);
        assert!((anchor.y - 470.0).abs() < 1e-3);
    }

    #[test]
    fn test_base_mesh_falls_back_to_inner_corners() {
        let mut points = synthetic_face(150.0, 100.0).points().to_vec();
        // Move the inner corners asymmetrically so the fallback is observable.
        points[index::INNER_EYE_LEFT].x = 0.480;
        points[index::INNER_EYE_RIGHT].x = 0.540;
        let lms = FrameLandmarks::new(points).unwrap().without_iris();
        assert!(!lms.is_refined());
        let m = FaceMeasurements::from_landmarks(&lms, 1000, 1000);
        assert!((m.anchor().x - 510.0).abs() < 1e-3);
    }

    #[test]
    fn test_roll_averages_corner_pairs() {
        let deg = |d: f32| d.to_radians();
        let mut points = vec![LandmarkPoint::default(); REFINED_LANDMARK_COUNT];
        let put = |points: &mut Vec<LandmarkPoint>, i: usize, x: f32, y: f32| {
            points[i] = LandmarkPoint::new(x / 1000.0, y / 1000.0, 0.0)
        };
        // Outer corners at 10 degrees, inner corners at 14 degrees.
        put(&mut points, index::OUTER_EYE_LEFT, 400.0, 500.0);
        put(
            &mut points,
            index::OUTER_EYE_RIGHT,
            400.0 + 200.0 * deg(10.0).cos(),
            500.0 + 200.0 * deg(10.0).sin(),
        );
        put(&mut points, index::INNER_EYE_LEFT, 460.0, 500.0);
        put(
            &mut points,
            index::INNER_EYE_RIGHT,
            460.0 + 80.0 * deg(14.0).cos(),
            500.0 + 80.0 * deg(14.0).sin(),
        );
        let lms = FrameLandmarks::new(points).unwrap();
        let m = FaceMeasurements::from_landmarks(&lms, 1000, 1000);
        assert!((m.roll().to_degrees() - 12.0).abs() < 1e-2, "roll = {}", m.roll().to_degrees());
    }
}
