//! YOLO-face detector via ONNX Runtime on the CUDA execution provider.
//!
//! Single-stage detector: one forward pass yields `[1, C, N]` predictions
//! where rows 0–3 are `cx, cy, w, h` and row 4 is the face score.

use super::letterbox::{letterbox_rgb, nms, Candidate, Letterbox, Normalization};
use super::{clip_boxes, Detector, DetectorError, DetectorKind};
use crate::types::BoundingBox;
use image::RgbImage;
use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const YOLO_INPUT_SIZE: usize = 640;
const YOLO_NORMALIZATION: Normalization = Normalization {
    mean: 0.0,
    std: 255.0,
    pad: 114.0,
};
const YOLO_CONFIDENCE_THRESHOLD: f32 = 0.3;
const YOLO_NMS_THRESHOLD: f32 = 0.45;

/// YOLOv8-face detector pinned to the GPU.
pub struct YoloFaceDetector {
    session: Session,
}

impl YoloFaceDetector {
    /// Load the YOLO-face ONNX model onto the CUDA provider.
    ///
    /// Fails with [`DetectorError::BackendUnavailable`] when CUDA is not usable,
    /// so the selector can fall back instead of silently running on CPU.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let cuda = CUDAExecutionProvider::default();
        match cuda.is_available() {
            Ok(true) => {}
            Ok(false) => {
                return Err(DetectorError::BackendUnavailable(
                    "CUDA execution provider not available".into(),
                ))
            }
            Err(e) => {
                return Err(DetectorError::BackendUnavailable(format!(
                    "CUDA execution provider probe failed: {e}"
                )))
            }
        }

        let session = Session::builder()?
            .with_execution_providers([cuda.build()])?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded YOLO-face model on CUDA"
        );

        Ok(Self { session })
    }
}

impl Detector for YoloFaceDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Gpu
    }

    fn locate_faces(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = letterbox_rgb(image, YOLO_INPUT_SIZE, YOLO_NORMALIZATION);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("predictions: {e}")))?;

        if shape.len() != 3 || shape[1] < 5 {
            return Err(DetectorError::InferenceFailed(format!(
                "expected [1, >=5, N] predictions, got {shape:?}"
            )));
        }
        let anchors = shape[2] as usize;

        let candidates = decode_predictions(data, anchors, &letterbox, YOLO_CONFIDENCE_THRESHOLD);
        let kept = nms(candidates, YOLO_NMS_THRESHOLD);
        Ok(clip_boxes(kept.into_iter().map(|c| c.bbox), image.width(), image.height()))
    }
}

/// Decode channel-major YOLO predictions into frame-space candidates.
fn decode_predictions(
    data: &[f32],
    anchors: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<Candidate> {
    if data.len() < anchors * 5 {
        return Vec::new();
    }

    (0..anchors)
        .filter_map(|i| {
            let score = data[4 * anchors + i];
            if score < threshold {
                return None;
            }
            let (cx, cy) = (data[i], data[anchors + i]);
            let (w, h) = (data[2 * anchors + i], data[3 * anchors + i]);
            let bbox = letterbox.unmap(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0);
            Some(Candidate { bbox, score })
        })
        .collect()
}
