//! Face embedding extraction.
//!
//! [`Embedder`] is the capability the pipeline consumes; [`ArcFaceEmbedder`]
//! implements it with an ArcFace ONNX model on 112×112 face crops.

use crate::types::{BoundingBox, Embedding};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (different from SCRFD!) ---
const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric, unlike SCRFD's 128.0
const ARCFACE_EMBEDDING_DIM: usize = 512;
/// Fraction of the box size added on each side before cropping.
const CROP_MARGIN: f32 = 0.1;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}; place the ArcFace ONNX model in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face box {0:?} lies outside the frame")]
    EmptyCrop(BoundingBox),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Produces one embedding per face box, in the same order.
pub trait Embedder: Send {
    fn embed_all(
        &mut self,
        image: &RgbImage,
        boxes: &[BoundingBox],
    ) -> Result<Vec<Embedding>, RecognizerError>;
}

/// ArcFace-based embedder.
pub struct ArcFaceEmbedder {
    session: Session,
}

impl ArcFaceEmbedder {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Extract an L2-normalized embedding for one face.
    pub fn embed(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, RecognizerError> {
        let crop = crop_face(image, face).ok_or(RecognizerError::EmptyCrop(*face))?;
        let input = preprocess(&crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw_data.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw_data.len()
            )));
        }

        Ok(Embedding::new(l2_normalize(raw_data)))
    }
}

impl Embedder for ArcFaceEmbedder {
    fn embed_all(
        &mut self,
        image: &RgbImage,
        boxes: &[BoundingBox],
    ) -> Result<Vec<Embedding>, RecognizerError> {
        boxes.iter().map(|b| self.embed(image, b)).collect()
    }
}

/// Crop the face (plus margin) and resize to the ArcFace input size.
fn crop_face(image: &RgbImage, face: &BoundingBox) -> Option<RgbImage> {
    let margin_x = face.width() * CROP_MARGIN;
    let margin_y = face.height() * CROP_MARGIN;
    let region = BoundingBox::new(
        face.top - margin_y,
        face.right + margin_x,
        face.bottom + margin_y,
        face.left - margin_x,
    )
    .clip_to_frame(image.width(), image.height())?;

    let x = region.left.floor() as u32;
    let y = region.top.floor() as u32;
    let w = (region.right.ceil() as u32).saturating_sub(x).max(1);
    let h = (region.bottom.ceil() as u32).saturating_sub(y).max(1);

    let cropped = imageops::crop_imm(image, x, y, w, h).to_image();
    Some(imageops::resize(
        &cropped,
        ARCFACE_INPUT_SIZE,
        ARCFACE_INPUT_SIZE,
        FilterType::Triangle,
    ))
}

/// Preprocess a 112x112 RGB face crop into a NCHW float tensor.
fn preprocess(face: &RgbImage) -> Array4<f32> {
    let size = ARCFACE_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for (x, y, pixel) in face.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }

    tensor
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_output_shape() {
        let face = RgbImage::from_pixel(ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE, Rgb([128, 128, 128]));
        let tensor = preprocess(&face);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
    }

    #[test]
    fn test_preprocess_normalization_per_channel() {
        let face = RgbImage::from_pixel(ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE, Rgb([0, 128, 255]));
        let tensor = preprocess(&face);
        assert!((tensor[[0, 0, 5, 5]] + 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 5, 5]] - (128.0 - ARCFACE_MEAN) / ARCFACE_STD).abs() < 1e-6);
        assert!((tensor[[0, 2, 5, 5]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_crop_face_resizes_to_input() {
        let image = RgbImage::from_pixel(200, 100, Rgb([10, 20, 30]));
        let crop = crop_face(&image, &BoundingBox::new(10.0, 80.0, 90.0, 20.0)).unwrap();
        assert_eq!(crop.dimensions(), (ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE));
    }

    #[test]
    fn test_crop_face_outside_frame() {
        let image = RgbImage::new(50, 50);
        assert!(crop_face(&image, &BoundingBox::new(60.0, 90.0, 90.0, 60.0)).is_none());
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6 && (v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_missing_model_reports_path() {
        match ArcFaceEmbedder::load("/nonexistent/w600k_r50.onnx") {
            Err(RecognizerError::ModelNotFound(p)) => assert!(p.ends_with("w600k_r50.onnx")),
            other => panic!("unexpected: {:?}", other.err()),
        }
    }
}
