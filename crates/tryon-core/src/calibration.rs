//! Calibration scan: average face spans over a fixed window before showing the overlay.

use crate::estimator::SpanBlend;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Samples collected before the scale is committed.
pub const DEFAULT_SCAN_CAPACITY: usize = 45;

#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("scan capacity must be at least 1")]
    ZeroCapacity,
    #[error("asset native width must be positive and finite, got {0}")]
    InvalidAssetWidth(f32),
}

/// Raw spans measured on one scanning frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSample {
    pub temple_span_px: f32,
    pub outer_eye_span_px: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationPhase {
    Scanning,
    Done,
}

/// Committed calibration. Immutable once produced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    /// Product target width over asset native width; multiplied by the live
    /// blended span each frame to get the overlay scale.
    pub pixel_to_scene_ratio: f32,
    pub mean_temple_span_px: f32,
    pub mean_outer_eye_span_px: f32,
    pub blended_span_px: f32,
    pub target_scene_width: f32,
    pub asset_native_width: f32,
}

impl CalibrationResult {
    /// Overlay scale a face at the calibrated distance would get.
    pub fn reference_scale(&self) -> f32 {
        self.pixel_to_scene_ratio * self.blended_span_px
    }

    /// Ratio normalized by the mean blended span: `target / (native * span)`.
    pub fn span_normalized_ratio(&self) -> f32 {
        self.target_scene_width / (self.asset_native_width * self.blended_span_px)
    }
}

/// Outcome of pushing one sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanProgress {
    pub percent: u8,
    /// Set on the push that completed the scan.
    pub completed: Option<CalibrationResult>,
}

/// Two-state scan: `Scanning` until `capacity` samples arrive, then `Done`
/// until an explicit `reset`.
#[derive(Debug, Clone)]
pub struct Calibration {
    capacity: usize,
    blend: SpanBlend,
    target_scene_width: f32,
    asset_native_width: f32,
    samples: Vec<CalibrationSample>,
    phase: CalibrationPhase,
    result: Option<CalibrationResult>,
}

impl Calibration {
    pub fn new(
        capacity: usize,
        blend: SpanBlend,
        target_scene_width: f32,
        asset_native_width: f32,
    ) -> Result<Self, CalibrationError> {
        if capacity == 0 {
            return Err(CalibrationError::ZeroCapacity);
        }
        if !(asset_native_width.is_finite() && asset_native_width > 0.0) {
            return Err(CalibrationError::InvalidAssetWidth(asset_native_width));
        }
        Ok(Self {
            capacity,
            blend,
            target_scene_width,
            asset_native_width,
            samples: Vec::with_capacity(capacity),
            phase: CalibrationPhase::Scanning,
            result: None,
        })
    }

    /// Discard collected samples and any result; back to `Scanning`.
    pub fn reset(&mut self) {
        self.samples = Vec::with_capacity(self.capacity);
        self.phase = CalibrationPhase::Scanning;
        self.result = None;
    }

    pub fn phase(&self) -> CalibrationPhase {
        self.phase
    }

    pub fn result(&self) -> Option<&CalibrationResult> {
        self.result.as_ref()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Scan progress in percent; reaches 100 only when the window is full.
    pub fn progress(&self) -> u8 {
        (self.samples.len().min(self.capacity) * 100 / self.capacity) as u8
    }

    /// Record one frame's spans. Ignored once calibration is done.
    pub fn push(&mut self, sample: CalibrationSample) -> ScanProgress {
        if self.phase == CalibrationPhase::Done {
            return ScanProgress {
                percent: 100,
                completed: None,
            };
        }

        self.samples.push(sample);
        let completed = if self.samples.len() >= self.capacity {
            let result = self.commit();
            tracing::info!(
                ratio = result.pixel_to_scene_ratio,
                temple_px = result.mean_temple_span_px,
                reference_scale = result.reference_scale(),
                "calibration committed"
            );
            Some(result)
        } else {
            None
        };

        ScanProgress {
            percent: self.progress(),
            completed,
        }
    }

    fn commit(&mut self) -> CalibrationResult {
        let n = self.samples.len() as f32;
        let mean_temple = self.samples.iter().map(|s| s.temple_span_px).sum::<f32>() / n;
        let mean_eye = self.samples.iter().map(|s| s.outer_eye_span_px).sum::<f32>() / n;

        let result = CalibrationResult {
            pixel_to_scene_ratio: self.target_scene_width / self.asset_native_width,
            mean_temple_span_px: mean_temple,
            mean_outer_eye_span_px: mean_eye,
            blended_span_px: self.blend.apply(mean_temple, mean_eye),
            target_scene_width: self.target_scene_width,
            asset_native_width: self.asset_native_width,
        };
        self.result = Some(result);
        self.phase = CalibrationPhase::Done;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(t: f32, e: f32) -> CalibrationSample {
        CalibrationSample {
            temple_span_px: t,
            outer_eye_span_px: e,
        }
    }

    #[test]
    fn test_rejects_bad_construction() {
        assert!(Calibration::new(0, SpanBlend::default(), 1.0, 1.0).is_err());
        assert!(Calibration::new(45, SpanBlend::default(), 1.0, 0.0).is_err());
        assert!(Calibration::new(45, SpanBlend::default(), 1.0, f32::NAN).is_err());
    }

    #[test]
    fn test_progress_hits_100_only_on_last_sample() {
        let mut cal = Calibration::new(45, SpanBlend::default(), 1.0, 0.14).unwrap();
        for i in 1..45 {
            let p = cal.push(sample(100.0, 60.0));
            assert!(p.percent < 100, "frame {i} reported {}", p.percent);
            assert!(p.completed.is_none());
            assert_eq!(cal.phase(), CalibrationPhase::Scanning);
        }
        let p = cal.push(sample(100.0, 60.0));
        assert_eq!(p.percent, 100);
        assert!(p.completed.is_some());
        assert_eq!(cal.phase(), CalibrationPhase::Done);
    }

    #[test]
    fn test_constant_stream_converges_to_formula() {
        let (target, native) = (1.0f32, 0.14f32);
        let run = || {
            let mut cal = Calibration::new(45, SpanBlend::default(), target, native).unwrap();
            let mut out = None;
            for _ in 0..45 {
                out = cal.push(sample(100.0, 60.0)).completed.or(out);
            }
            out.unwrap()
        };
        let a = run();
        let b = run();
        assert_eq!(a, b);

        let blended = 0.7 * 100.0 + 0.3 * 60.0;
        assert!((a.blended_span_px - blended).abs() < 1e-4);
        assert!((a.pixel_to_scene_ratio - target / native).abs() < 1e-4);
        let expected = target / (native * blended);
        assert!((a.span_normalized_ratio() - expected).abs() <= expected * 1e-6);
    }

    #[test]
    fn test_means_average_noise() {
        let mut cal = Calibration::new(4, SpanBlend::default(), 1.0, 1.0).unwrap();
        cal.push(sample(90.0, 50.0));
        cal.push(sample(110.0, 70.0));
        cal.push(sample(95.0, 55.0));
        let result = cal.push(sample(105.0, 65.0)).completed.unwrap();
        assert!((result.mean_temple_span_px - 100.0).abs() < 1e-4);
        assert!((result.mean_outer_eye_span_px - 60.0).abs() < 1e-4);
    }

    #[test]
    fn test_done_is_terminal_until_reset() {
        let mut cal = Calibration::new(2, SpanBlend::default(), 1.0, 1.0).unwrap();
        cal.push(sample(100.0, 60.0));
        let first = cal.push(sample(100.0, 60.0)).completed.unwrap();

        let ignored = cal.push(sample(500.0, 500.0));
        assert!(ignored.completed.is_none());
        assert_eq!(cal.sample_count(), 2);
        assert_eq!(cal.result(), Some(&first));

        cal.reset();
        assert_eq!(cal.phase(), CalibrationPhase::Scanning);
        assert_eq!(cal.progress(), 0);
        assert!(cal.result().is_none());
    }
}
