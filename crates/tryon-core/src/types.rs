use serde::{Deserialize, Serialize};

/// Bounding box for a located face, with optional five-point keypoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point keypoints: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub keypoints: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix = ((self.x + self.width).min(other.x + other.width) - self.x.max(other.x)).max(0.0);
        let iy =
            ((self.y + self.height).min(other.y + other.height) - self.y.max(other.y)).max(0.0);
        let inter = ix * iy;
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Optical anchor of the overlay, in raw (unmirrored) video pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Anchor {
    pub x: f32,
    pub y: f32,
}

/// Smoothed placement of the overlay for the current frame.
///
/// `roll` is the in-image head roll in radians (image y axis points down).
/// `initialized` records whether a face has been acquired since the last
/// calibration; until then the first visible frame snaps instead of easing.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TrackingState {
    pub anchor: Anchor,
    pub scale: f32,
    pub roll: f32,
    pub visible: bool,
    pub initialized: bool,
}
