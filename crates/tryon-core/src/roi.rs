//! Rotated square regions of interest for the face-mesh model.
//!
//! The mesh model expects an upright face filling most of a square crop. A
//! `Roi` describes that crop in frame pixels; `warp_rgb` samples it.

use crate::landmarks::{index, FrameLandmarks};
use crate::types::BoundingBox;

/// Crop size relative to the detected face extent.
const ROI_SCALE: f32 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Roi {
    pub center_x: f32,
    pub center_y: f32,
    /// Side length in frame pixels.
    pub size: f32,
    /// Clockwise rotation in image coordinates (radians).
    pub rotation: f32,
}

impl Roi {
    /// Crop around a detector box, levelled on the eye keypoints when present.
    pub fn from_detection(bbox: &BoundingBox) -> Self {
        let (center_x, center_y) = bbox.center();
        let rotation = bbox
            .keypoints
            .map(|k| {
                let (l, r) = (k[0], k[1]);
                (r.1 - l.1).atan2(r.0 - l.0)
            })
            .unwrap_or(0.0);
        Self {
            center_x,
            center_y,
            size: bbox.width.max(bbox.height) * ROI_SCALE,
            rotation,
        }
    }

    /// Crop for the next frame, from this frame's landmarks.
    pub fn from_landmarks(lms: &FrameLandmarks, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        let (mut min_x, mut min_y) = (f32::INFINITY, f32::INFINITY);
        let (mut max_x, mut max_y) = (f32::NEG_INFINITY, f32::NEG_INFINITY);
        for p in lms.points() {
            min_x = min_x.min(p.x * w);
            max_x = max_x.max(p.x * w);
            min_y = min_y.min(p.y * h);
            max_y = max_y.max(p.y * h);
        }

        let rotation = match (lms.get(index::OUTER_EYE_LEFT), lms.get(index::OUTER_EYE_RIGHT)) {
            (Some(l), Some(r)) => ((r.y - l.y) * h).atan2((r.x - l.x) * w),
            _ => 0.0,
        };

        Self {
            center_x: (min_x + max_x) / 2.0,
            center_y: (min_y + max_y) / 2.0,
            size: (max_x - min_x).max(max_y - min_y) * ROI_SCALE,
            rotation,
        }
    }

    /// Map a normalized crop coordinate ([0, 1] on both axes) to frame pixels.
    pub fn crop_to_frame(&self, u: f32, v: f32) -> (f32, f32) {
        let (sin, cos) = self.rotation.sin_cos();
        let dx = (u - 0.5) * self.size;
        let dy = (v - 0.5) * self.size;
        (
            self.center_x + dx * cos - dy * sin,
            self.center_y + dx * sin + dy * cos,
        )
    }
}

/// Sample the ROI from a packed RGB frame into an `out_size` square.
///
/// Bilinear; pixels outside the frame are black.
pub fn warp_rgb(frame: &[u8], width: u32, height: u32, roi: &Roi, out_size: u32) -> Vec<u8> {
    let (w, h) = (width as i32, height as i32);
    let n = out_size as usize;
    let mut out = vec![0u8; n * n * 3];
    if roi.size <= 0.0 || frame.len() < (width * height * 3) as usize {
        return out;
    }

    let sample = |x: i32, y: i32, c: usize| -> f32 {
        if x >= 0 && x < w && y >= 0 && y < h {
            frame[(y as usize * width as usize + x as usize) * 3 + c] as f32
        } else {
            0.0
        }
    };

    for oy in 0..n {
        for ox in 0..n {
            let u = (ox as f32 + 0.5) / out_size as f32;
            let v = (oy as f32 + 0.5) / out_size as f32;
            let (sx, sy) = roi.crop_to_frame(u, v);
            let (sx, sy) = (sx - 0.5, sy - 0.5);

            let x0 = sx.floor() as i32;
            let y0 = sy.floor() as i32;
            let fx = sx - x0 as f32;
            let fy = sy - y0 as f32;

            for c in 0..3 {
                let val = sample(x0, y0, c) * (1.0 - fx) * (1.0 - fy)
                    + sample(x0 + 1, y0, c) * fx * (1.0 - fy)
                    + sample(x0, y0 + 1, c) * (1.0 - fx) * fy
                    + sample(x0 + 1, y0 + 1, c) * fx * fy;
                out[(oy * n + ox) * 3 + c] = val.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    out
}
