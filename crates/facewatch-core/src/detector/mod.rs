//! Face detection strategies behind a single `locate_faces` capability.
//!
//! Three interchangeable implementations:
//! - [`ClassicDetector`]: model-free skin-region detector, always constructible.
//! - [`YoloFaceDetector`]: single-stage YOLO-face ONNX model on the CUDA provider.
//! - [`ScrfdDetector`]: multi-stride SCRFD ONNX model, highest accuracy.

mod classic;
mod letterbox;
mod scrfd;
mod yolo;

pub use classic::ClassicDetector;
pub use scrfd::ScrfdDetector;
pub use yolo::YoloFaceDetector;

use crate::types::BoundingBox;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; place the ONNX model in the model directory")]
    ModelNotFound(String),
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A concrete detection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectorKind {
    Fast,
    Gpu,
    Accurate,
}

impl DetectorKind {
    /// Human-readable name for status displays.
    pub fn display_name(&self) -> &'static str {
        match self {
            DetectorKind::Fast => "classic (skin-region)",
            DetectorKind::Gpu => "GPU (YOLO-face)",
            DetectorKind::Accurate => "accurate (SCRFD)",
        }
    }
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Configured detector preference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorChoice {
    #[default]
    Auto,
    Fast,
    Gpu,
    Accurate,
}

impl DetectorChoice {
    /// Strategies to try, in order, for this preference.
    ///
    /// A named strategy falls through the auto order starting from itself.
    pub fn resolution_order(&self) -> &'static [DetectorKind] {
        const FROM_ACCURATE: [DetectorKind; 3] =
            [DetectorKind::Accurate, DetectorKind::Gpu, DetectorKind::Fast];
        match self {
            DetectorChoice::Auto | DetectorChoice::Accurate => &FROM_ACCURATE,
            DetectorChoice::Gpu => &FROM_ACCURATE[1..],
            DetectorChoice::Fast => &FROM_ACCURATE[2..],
        }
    }
}

impl FromStr for DetectorChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "fast" | "hog" | "classic" => Ok(Self::Fast),
            "gpu" | "yolo" => Ok(Self::Gpu),
            "accurate" | "retinaface" | "scrfd" => Ok(Self::Accurate),
            other => Err(format!("unknown detector choice: {other}")),
        }
    }
}

impl fmt::Display for DetectorChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DetectorChoice::Auto => "auto",
            DetectorChoice::Fast => "fast",
            DetectorChoice::Gpu => "gpu",
            DetectorChoice::Accurate => "accurate",
        })
    }
}

/// Construction parameters shared by all strategies.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Directory holding `det_10g.onnx` and `yolov8n-face.onnx`.
    pub model_dir: PathBuf,
    /// Upsample level 0–2; the classic detector finds faces 2^n times smaller.
    pub upsample: u32,
}

impl DetectorConfig {
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir.join("det_10g.onnx").to_string_lossy().into_owned()
    }

    pub fn yolo_model_path(&self) -> String {
        self.model_dir
            .join("yolov8n-face.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

/// Uniform face-location capability.
///
/// Implementations must return boxes clipped to the image with
/// `0 <= left < right <= width` and `0 <= top < bottom <= height`.
pub trait Detector: Send {
    fn kind(&self) -> DetectorKind;

    fn locate_faces(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Clip raw boxes to the image and drop any that collapse.
pub(crate) fn clip_boxes(
    raw: impl IntoIterator<Item = BoundingBox>,
    width: u32,
    height: u32,
) -> Vec<BoundingBox> {
    raw.into_iter()
        .filter_map(|b| b.clip_to_frame(width, height))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_order() {
        use DetectorKind::*;
        assert_eq!(DetectorChoice::Auto.resolution_order(), &[Accurate, Gpu, Fast]);
        assert_eq!(DetectorChoice::Accurate.resolution_order(), &[Accurate, Gpu, Fast]);
        assert_eq!(DetectorChoice::Gpu.resolution_order(), &[Gpu, Fast]);
        assert_eq!(DetectorChoice::Fast.resolution_order(), &[Fast]);
    }

    #[test]
    fn test_choice_parsing() {
        assert_eq!("GPU".parse::<DetectorChoice>(), Ok(DetectorChoice::Gpu));
        assert_eq!("hog".parse::<DetectorChoice>(), Ok(DetectorChoice::Fast));
        assert_eq!("retinaface".parse::<DetectorChoice>(), Ok(DetectorChoice::Accurate));
        assert!("mtcnn".parse::<DetectorChoice>().is_err());
    }

    #[test]
    fn test_clip_boxes_drops_degenerate() {
        let boxes = clip_boxes(
            [
                BoundingBox::new(-5.0, 50.0, 40.0, 10.0),
                BoundingBox::new(10.0, 200.0, 20.0, 150.0),
            ],
            100,
            100,
        );
        assert_eq!(boxes, vec![BoundingBox::new(0.0, 50.0, 40.0, 10.0)]);
    }
}
