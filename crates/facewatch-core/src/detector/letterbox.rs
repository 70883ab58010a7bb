//! Letterbox preprocessing and NMS shared by the ONNX strategies.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;

/// Metadata for coordinate de-mapping after letterbox resize.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl Letterbox {
    /// Fit a `width × height` frame inside a square `input_size` canvas.
    pub fn fit(width: u32, height: u32, input_size: usize) -> (Self, u32, u32) {
        let scale = (input_size as f32 / width as f32).min(input_size as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, input_size as u32);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, input_size as u32);
        let pad_x = (input_size as u32 - new_w) as f32 / 2.0;
        let pad_y = (input_size as u32 - new_h) as f32 / 2.0;
        (Self { scale, pad_x, pad_y }, new_w, new_h)
    }

    /// Map a box from letterboxed input space back to the original frame.
    pub fn unmap(&self, x1: f32, y1: f32, x2: f32, y2: f32) -> BoundingBox {
        BoundingBox::from_corners(
            (x1 - self.pad_x) / self.scale,
            (y1 - self.pad_y) / self.scale,
            (x2 - self.pad_x) / self.scale,
            (y2 - self.pad_y) / self.scale,
        )
    }
}

/// Per-model pixel normalization: `(pixel - mean) / std`, padding with `pad`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Normalization {
    pub mean: f32,
    pub std: f32,
    pub pad: f32,
}

/// Resize an RGB frame into a letterboxed NCHW float tensor.
pub(crate) fn letterbox_rgb(
    image: &RgbImage,
    input_size: usize,
    norm: Normalization,
) -> (Array4<f32>, Letterbox) {
    let (letterbox, new_w, new_h) = Letterbox::fit(image.width(), image.height(), input_size);
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let pad_x_start = letterbox.pad_x.floor() as usize;
    let pad_y_start = letterbox.pad_y.floor() as usize;
    let (new_w, new_h) = (new_w as usize, new_h as usize);

    let pad_value = (norm.pad - norm.mean) / norm.std;
    let mut tensor = Array4::<f32>::from_elem((1, 3, input_size, input_size), pad_value);

    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = (x as usize + pad_x_start, y as usize + pad_y_start);
        if tx >= input_size || ty >= input_size || x as usize >= new_w || y as usize >= new_h {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel[c] as f32 - norm.mean) / norm.std;
        }
    }

    (tensor, letterbox)
}

/// A decoded box with its detector score, before suppression.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Candidate {
    pub bbox: BoundingBox,
    pub score: f32,
}

/// Non-Maximum Suppression: remove overlapping detections, highest score first.
pub(crate) fn nms(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; candidates.len()];

    for i in 0..candidates.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(candidates[i]);

        for j in (i + 1)..candidates.len() {
            if !suppressed[j] && candidates[i].bbox.iou(&candidates[j].bbox) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}
