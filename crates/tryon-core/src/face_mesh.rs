//! Face-mesh landmark detector: SCRFD to find the face, then a 468/478-point
//! mesh regression over a rotated square crop.
//!
//! Between frames the crop follows the previous landmarks, so the locator
//! only runs when tracking is lost.

use crate::detector::FaceLocator;
use crate::landmarks::{FrameLandmarks, LandmarkPoint, BASE_LANDMARK_COUNT, REFINED_LANDMARK_COUNT};
use crate::roi::{warp_rgb, Roi};
use crate::tracker::{check_rgb_len, LandmarkDetector, TrackerConfig, TrackerError};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const MESH_INPUT_SIZE: u32 = 256;

pub struct FaceMeshDetector {
    locator: FaceLocator,
    mesh: Session,
    config: TrackerConfig,
    roi: Option<Roi>,
}

impl FaceMeshDetector {
    pub fn load(
        locator_model: &Path,
        mesh_model: &Path,
        config: TrackerConfig,
    ) -> Result<Self, TrackerError> {
        if !mesh_model.exists() {
            return Err(TrackerError::ModelNotFound(mesh_model.display().to_string()));
        }
        let locator = FaceLocator::load(locator_model, config.min_detection_confidence)?;
        let mesh = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(mesh_model)?;

        tracing::info!(
            path = %mesh_model.display(),
            outputs = ?mesh.outputs().iter().map(|o| o.name().to_string()).collect::<Vec<_>>(),
            refine = config.refine_landmarks,
            "loaded face mesh model"
        );
        if config.max_faces != 1 {
            tracing::warn!(max_faces = config.max_faces, "only the most confident face is tracked");
        }

        Ok(Self {
            locator,
            mesh,
            config,
            roi: None,
        })
    }

    fn locate(&mut self, rgb: &[u8], width: u32, height: u32) -> Result<Option<Roi>, TrackerError> {
        let faces = self.locator.locate(rgb, width, height)?;
        Ok(faces
            .first()
            .filter(|f| f.confidence >= self.config.min_detection_confidence)
            .map(Roi::from_detection))
    }

    /// Run the mesh model on one crop. Returns the raw landmark values and
    /// the face-presence probability.
    fn infer(&mut self, crop: &[u8]) -> Result<(Vec<f32>, f32), TrackerError> {
        let n = MESH_INPUT_SIZE as usize;
        let input = Array4::from_shape_fn((1, n, n, 3), |(_, y, x, c)| {
            crop[(y * n + x) * 3 + c] as f32 / 255.0
        });
        let outputs = self.mesh.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut coords = None;
        let mut presence = None;
        for (_, value) in outputs.iter() {
            let Ok((_, data)) = value.try_extract_tensor::<f32>() else {
                continue;
            };
            match data.len() {
                len if len == REFINED_LANDMARK_COUNT * 3 || len == BASE_LANDMARK_COUNT * 3 => {
                    if coords.as_ref().map_or(true, |c: &Vec<f32>| c.len() < len) {
                        coords = Some(data.to_vec());
                    }
                }
                1 if presence.is_none() => presence = Some(sigmoid(data[0])),
                _ => {}
            }
        }

        let coords = coords
            .ok_or_else(|| TrackerError::InferenceFailed("face mesh output not found".into()))?;
        Ok((coords, presence.unwrap_or(1.0)))
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Crop-space landmark values (pixels of the model input) to normalized
/// frame coordinates.
fn crop_to_landmarks(values: &[f32], roi: &Roi, width: u32, height: u32) -> Vec<LandmarkPoint> {
    let size = MESH_INPUT_SIZE as f32;
    values
        .chunks_exact(3)
        .map(|p| {
            let (x, y) = roi.crop_to_frame(p[0] / size, p[1] / size);
            let z = p[2] / size * roi.size / width as f32;
            LandmarkPoint::new(x / width as f32, y / height as f32, z)
        })
        .collect()
}

impl LandmarkDetector for FaceMeshDetector {
    fn detect(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<FrameLandmarks>, TrackerError> {
        check_rgb_len(rgb, width, height)?;

        let roi = match self.roi {
            Some(roi) => roi,
            None => match self.locate(rgb, width, height)? {
                Some(roi) => roi,
                None => return Ok(None),
            },
        };

        let crop = warp_rgb(rgb, width, height, &roi, MESH_INPUT_SIZE);
        let (values, presence) = self.infer(&crop)?;
        if presence < self.config.min_tracking_confidence {
            tracing::debug!(presence, "face lost");
            self.roi = None;
            return Ok(None);
        }

        let mut landmarks = FrameLandmarks::new(crop_to_landmarks(&values, &roi, width, height))?;
        if !self.config.refine_landmarks && landmarks.is_refined() {
            landmarks = landmarks.without_iris();
        }
        self.roi = Some(Roi::from_landmarks(&landmarks, width, height));
        Ok(Some(landmarks))
    }

    fn reset(&mut self) {
        self.roi = None;
    }
}
