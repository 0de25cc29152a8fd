//! Anatomical frame estimator — landmarks to a smoothed anchor, scale and roll.
//!
//! The estimator is a pure function of (previous state, landmarks, calibration
//! ratio, size multiplier). The only history it carries is the previous
//! `TrackingState` handed back in by its owner.

use crate::landmarks::{FaceMeasurements, FrameLandmarks};
use crate::types::{Anchor, TrackingState};
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

pub const DEFAULT_TEMPLE_WEIGHT: f32 = 0.7;
pub const DEFAULT_OUTER_EYE_WEIGHT: f32 = 0.3;
pub const DEFAULT_SMOOTHING: f32 = 0.35;
pub const MIN_SIZE_MULTIPLIER: f32 = 0.6;
pub const MAX_SIZE_MULTIPLIER: f32 = 1.5;

/// Weights for blending the temple-to-temple and outer-eye spans.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpanBlend {
    pub temple: f32,
    pub outer_eye: f32,
}

impl Default for SpanBlend {
    fn default() -> Self {
        Self {
            temple: DEFAULT_TEMPLE_WEIGHT,
            outer_eye: DEFAULT_OUTER_EYE_WEIGHT,
        }
    }
}

impl SpanBlend {
    pub fn apply(&self, temple_span: f32, outer_eye_span: f32) -> f32 {
        temple_span * self.temple + outer_eye_span * self.outer_eye
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EstimatorParams {
    pub blend: SpanBlend,
    /// Lerp factor applied per frame once a face has been acquired.
    pub smoothing: f32,
    pub min_multiplier: f32,
    pub max_multiplier: f32,
}

impl Default for EstimatorParams {
    fn default() -> Self {
        Self {
            blend: SpanBlend::default(),
            smoothing: DEFAULT_SMOOTHING,
            min_multiplier: MIN_SIZE_MULTIPLIER,
            max_multiplier: MAX_SIZE_MULTIPLIER,
        }
    }
}

impl EstimatorParams {
    pub fn clamp_multiplier(&self, multiplier: f32) -> f32 {
        if multiplier.is_finite() {
            multiplier.clamp(self.min_multiplier, self.max_multiplier)
        } else {
            1.0
        }
    }
}

/// Unsmoothed placement derived from a single frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackingTarget {
    pub anchor: Anchor,
    pub scale: f32,
    pub roll: f32,
}

impl TrackingTarget {
    pub fn from_measurements(
        m: &FaceMeasurements,
        pixel_to_scene_ratio: f32,
        multiplier: f32,
        params: &EstimatorParams,
    ) -> Self {
        Self {
            anchor: m.anchor(),
            scale: pixel_to_scene_ratio
                * m.blended_span(&params.blend)
                * params.clamp_multiplier(multiplier),
            roll: m.roll(),
        }
    }
}

pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Wrap an angle difference into (-PI, PI].
fn shortest_angle(delta: f32) -> f32 {
    let wrapped = (delta + PI).rem_euclid(2.0 * PI) - PI;
    if wrapped == -PI {
        PI
    } else {
        wrapped
    }
}

/// Move `prev` one smoothing step toward `target`.
///
/// The first acquisition after a (re)calibration snaps to the target.
pub fn smooth_toward(
    prev: &TrackingState,
    target: &TrackingTarget,
    smoothing: f32,
) -> TrackingState {
    if !prev.initialized {
        return TrackingState {
            anchor: target.anchor,
            scale: target.scale,
            roll: target.roll,
            visible: true,
            initialized: true,
        };
    }

    let t = smoothing.clamp(0.0, 1.0);
    TrackingState {
        anchor: Anchor {
            x: lerp(prev.anchor.x, target.anchor.x, t),
            y: lerp(prev.anchor.y, target.anchor.y, t),
        },
        scale: lerp(prev.scale, target.scale, t),
        roll: prev.roll + shortest_angle(target.roll - prev.roll) * t,
        visible: true,
        initialized: true,
    }
}

/// One estimator step for a `width` x `height` frame.
///
/// Without landmarks only `visible` changes; position, scale and roll stay
/// frozen where they were.
pub fn estimate(
    prev: &TrackingState,
    landmarks: Option<&FrameLandmarks>,
    frame_size: (u32, u32),
    pixel_to_scene_ratio: f32,
    multiplier: f32,
    params: &EstimatorParams,
) -> TrackingState {
    let Some(lms) = landmarks else {
        return TrackingState {
            visible: false,
            ..*prev
        };
    };

    let m = FaceMeasurements::from_landmarks(lms, frame_size.0, frame_size.1);
    let target = TrackingTarget::from_measurements(&m, pixel_to_scene_ratio, multiplier, params);
    smooth_toward(prev, &target, params.smoothing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landmarks::tests::synthetic_face;

    const FRAME: (u32, u32) = (1000, 1000);

    #[test]
    fn test_first_acquisition_snaps() {
        let lms = synthetic_face(150.0, 100.0);
        let params = EstimatorParams::default();
        let state = estimate(&TrackingState::default(), Some(&lms), FRAME, 2.0, 1.0, &params);
        assert!(state.visible);
        assert!(state.initialized);
        assert!((state.anchor.x - 500.0).abs() < 1e-3);
        // 2.0 * (0.7 * 150 + 0.3 * 100)
        assert!((state.scale - 270.0).abs() < 1e-3);
    }

    #[test]
    fn test_multiplier_is_bounded() {
        let lms = synthetic_face(150.0, 100.0);
        let params = EstimatorParams::default();
        let big = estimate(&TrackingState::default(), Some(&lms), FRAME, 1.0, 9.0, &params);
        let small = estimate(&TrackingState::default(), Some(&lms), FRAME, 1.0, 0.1, &params);
        assert!((big.scale - 135.0 * 1.5).abs() < 1e-3);
        assert!((small.scale - 135.0 * 0.6).abs() < 1e-3);
    }

    #[test]
    fn test_smoothing_converges_monotonically() {
        let params = EstimatorParams::default();
        let target = TrackingTarget {
            anchor: Anchor { x: 300.0, y: 200.0 },
            scale: 500.0,
            roll: 0.2,
        };
        let mut state = TrackingState {
            anchor: Anchor { x: 0.0, y: 0.0 },
            scale: 100.0,
            roll: 0.0,
            visible: true,
            initialized: true,
        };
        let mut last_gap = f32::INFINITY;
        for _ in 0..60 {
            state = smooth_toward(&state, &target, params.smoothing);
            let gap = (state.scale - target.scale).abs();
            assert!(gap <= last_gap);
            last_gap = gap;
        }
        assert!((state.scale - 500.0).abs() < 1e-3);
        assert!((state.anchor.x - 300.0).abs() < 1e-3);
        assert!((state.anchor.y - 200.0).abs() < 1e-3);
        assert!((state.roll - 0.2).abs() < 1e-5);
    }

    #[test]
    fn test_lost_face_freezes_state() {
        let lms = synthetic_face(150.0, 100.0);
        let params = EstimatorParams::default();
        let tracked = estimate(&TrackingState::default(), Some(&lms), FRAME, 2.0, 1.0, &params);

        let mut state = tracked;
        for _ in 0..10 {
            state = estimate(&state, None, FRAME, 2.0, 1.0, &params);
        }
        assert!(!state.visible);
        assert_eq!(state.anchor, tracked.anchor);
        assert_eq!(state.scale, tracked.scale);
        assert_eq!(state.roll, tracked.roll);

        // Reacquire a wider face: eases from the frozen values instead of snapping.
        let wider = synthetic_face(250.0, 100.0);
        let resumed = estimate(&state, Some(&wider), FRAME, 2.0, 1.0, &params);
        let target_scale = 2.0 * (0.7 * 250.0 + 0.3 * 100.0);
        let expected = lerp(tracked.scale, target_scale, params.smoothing);
        assert!(resumed.visible);
        assert!((resumed.scale - expected).abs() < 1e-3);
    }

    #[test]
    fn test_roll_eases_across_wraparound() {
        let prev = TrackingState {
            roll: PI - 0.05,
            visible: true,
            initialized: true,
            ..TrackingState::default()
        };
        let target = TrackingTarget {
            anchor: Anchor::default(),
            scale: 0.0,
            roll: -PI + 0.05,
        };
        let next = smooth_toward(&prev, &target, 0.5);
        // Moves through PI, not back through zero.
        assert!(next.roll > PI - 0.05);
    }

    #[test]
    fn test_non_finite_multiplier_defaults_to_one() {
        let params = EstimatorParams::default();
        assert_eq!(params.clamp_multiplier(f32::NAN), 1.0);
    }
}
