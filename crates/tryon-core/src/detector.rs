//! SCRFD face locator via ONNX Runtime.
//!
//! Finds the face box and five keypoints that seed the face-mesh ROI when no
//! face is being tracked. Three-stride anchor decoding followed by NMS.

use crate::tracker::{check_rgb_len, TrackerError};
use crate::types::BoundingBox;
use image::{imageops, imageops::FilterType, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// Maps letterboxed model coordinates back to the frame.
#[derive(Debug, Clone, Copy)]
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl LetterboxInfo {
    fn for_frame(width: u32, height: u32) -> Self {
        let size = SCRFD_INPUT_SIZE as f32;
        let scale = (size / width as f32).min(size / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((size - new_w) / 2.0).floor(),
            pad_y: ((size - new_h) / 2.0).floor(),
        }
    }

    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor indices for one stride: (score, bbox, kps).
type StrideOutputIndices = (usize, usize, usize);

pub struct FaceLocator {
    session: Session,
    confidence_threshold: f32,
    stride_indices: [StrideOutputIndices; 3],
}

impl FaceLocator {
    pub fn load(model_path: &Path, confidence_threshold: f32) -> Result<Self, TrackerError> {
        if !model_path.exists() {
            return Err(TrackerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();
        tracing::info!(path = %model_path.display(), outputs = ?output_names, "loaded SCRFD model");

        if output_names.len() < 9 {
            return Err(TrackerError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides x score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        Ok(Self {
            session,
            confidence_threshold,
            stride_indices: discover_output_indices(&output_names),
        })
    }

    /// Faces in a packed RGB frame, most confident first.
    pub fn locate(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, TrackerError> {
        check_rgb_len(rgb, width, height)?;
        let (input, letterbox) = preprocess(rgb, width, height)?;

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_indices[pos];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| {
                        TrackerError::InferenceFailed(format!("{what} stride {stride}: {e}"))
                    })
            };
            let scores = extract(score_idx, "scores")?;
            let bboxes = extract(bbox_idx, "bboxes")?;
            let kps = extract(kps_idx, "kps")?;
            all.extend(decode_stride(
                scores,
                bboxes,
                kps,
                stride,
                &letterbox,
                self.confidence_threshold,
            ));
        }

        Ok(nms(all, SCRFD_NMS_THRESHOLD))
    }
}

/// Letterbox the frame into the square model input, NCHW, normalized.
fn preprocess(
    rgb: &[u8],
    width: u32,
    height: u32,
) -> Result<(Array4<f32>, LetterboxInfo), TrackerError> {
    let letterbox = LetterboxInfo::for_frame(width, height);
    let frame = RgbImage::from_raw(width, height, rgb.to_vec()).ok_or(TrackerError::InvalidFrame {
        expected: width as usize * height as usize * 3,
        actual: rgb.len(),
    })?;
    let new_w = ((width as f32 * letterbox.scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let new_h = ((height as f32 * letterbox.scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let resized = imageops::resize(&frame, new_w, new_h, FilterType::Triangle);

    let size = SCRFD_INPUT_SIZE as usize;
    // Padding normalizes to zero.
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    let (ox, oy) = (letterbox.pad_x as u32, letterbox.pad_y as u32);
    for (x, y, px) in resized.enumerate_pixels() {
        let (tx, ty) = ((x + ox) as usize, (y + oy) as usize);
        if tx >= size || ty >= size {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (px.0[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }
    Ok((tensor, letterbox))
}

/// Map output tensors to strides, by name when exported as `score_8`,
/// `bbox_16`, ..., else positionally: [0-2] scores, [3-5] boxes, [6-8] kps.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?, find("kps", s)?)))
        .collect();

    match named {
        Some(v) if v.len() == 3 => [v[0], v[1], v[2]],
        _ => {
            tracing::debug!(?names, "SCRFD output names not recognized, using positional mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid = SCRFD_INPUT_SIZE as usize / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    let mut detections = Vec::new();
    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }
        let Some(b) = bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let ax = (cell % grid) as f32 * s;
        let ay = (cell / grid) as f32 * s;

        let (x1, y1) = letterbox.to_frame(ax - b[0] * s, ay - b[1] * s);
        let (x2, y2) = letterbox.to_frame(ax + b[2] * s, ay + b[3] * s);

        let keypoints = kps.get(idx * 10..idx * 10 + 10).map(|k| {
            std::array::from_fn(|i| letterbox.to_frame(ax + k[i * 2] * s, ay + k[i * 2 + 1] * s))
        });

        detections.push(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            keypoints,
        });
    }
    detections
}

/// Greedy non-maximum suppression, highest confidence first.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<BoundingBox> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| k.iou(&det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_bbox(x: f32, y: f32, w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: w,
            height: h,
            confidence: conf,
            keypoints: None,
        }
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let detections = vec![
            make_bbox(5.0, 5.0, 100.0, 100.0, 0.8),
            make_bbox(0.0, 0.0, 100.0, 100.0, 0.9),
            make_bbox(200.0, 200.0, 50.0, 50.0, 0.7),
        ];
        let result = nms(detections, 0.4);
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.9).abs() < 1e-6);
        assert!((result[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_wide_frame() {
        let lb = LetterboxInfo::for_frame(1280, 720);
        assert!((lb.scale - 0.5).abs() < 1e-6);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 140.0);
        let (x, y) = lb.to_frame(320.0, 320.0);
        assert!((x - 640.0).abs() < 1e-3);
        assert!((y - 360.0).abs() < 1e-3);
    }

    #[test]
    fn test_decode_single_anchor() {
        let lb = LetterboxInfo::for_frame(640, 640);
        let stride = 32;
        let grid = 640 / stride;
        let n = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0; n];
        let mut bboxes = vec![0.0; n * 4];
        let kps = vec![0.0; n * 10];
        // Cell (x 3, y 2), first anchor.
        let idx = (2 * grid + 3) * SCRFD_ANCHORS_PER_CELL;
        scores[idx] = 0.9;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 2.0, 2.0]);

        let dets = decode_stride(&scores, &bboxes, &kps, stride, &lb, 0.5);
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert_eq!((d.x, d.y), (96.0 - 32.0, 64.0 - 32.0));
        assert_eq!((d.width, d.height), (96.0, 96.0));
        assert_eq!(d.keypoints.unwrap()[0], (96.0, 64.0));
    }

    #[test]
    fn test_preprocess_pads_to_zero() {
        let rgb = vec![255u8; 64 * 32 * 3];
        let (tensor, lb) = preprocess(&rgb, 64, 32).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert_eq!(lb.pad_y, 160.0);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        assert!((tensor[[0, 1, 320, 320]] - (255.0 - 127.5) / 128.0).abs() < 1e-4);
    }

    #[test]
    fn test_discover_output_indices() {
        let named: Vec<String> = [
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32",
            "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(discover_output_indices(&named), [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);

        let numeric: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(discover_output_indices(&numeric), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }
}
