//! Display-side box smoothing between inference frames.
//!
//! Each processed frame sets new *target* boxes; every displayed tick moves the
//! *smoothed* boxes a fraction `alpha` of the way toward them. When the number
//! of faces changes, the smoothed view snaps to the targets.

use crate::types::{BoundingBox, DetectionResult, FaceDetection};

#[derive(Debug, Clone)]
pub struct BoxSmoother {
    alpha: f32,
    smoothed: Vec<BoundingBox>,
    target: Vec<BoundingBox>,
    /// Labels of the latest detection result, paired with boxes by position.
    faces: Vec<FaceDetection>,
}

impl BoxSmoother {
    /// `alpha` is clamped into `(0, 1]`.
    pub fn new(alpha: f32) -> Self {
        Self {
            alpha: alpha.clamp(f32::EPSILON, 1.0),
            smoothed: Vec::new(),
            target: Vec::new(),
            faces: Vec::new(),
        }
    }

    /// Install the boxes of a freshly processed frame as the new targets.
    pub fn set_target(&mut self, result: &DetectionResult) {
        self.target = result.boxes();
        self.faces = result.faces.clone();
        if self.smoothed.len() != self.target.len() {
            tracing::debug!(
                from = self.smoothed.len(),
                to = self.target.len(),
                "face count changed; snapping boxes"
            );
            self.smoothed = self.target.clone();
        }
    }

    /// Advance every smoothed box one interpolation step toward its target.
    pub fn step(&mut self) {
        for (s, t) in self.smoothed.iter_mut().zip(self.target.iter()) {
            *s = s.step_toward(t, self.alpha);
        }
    }

    pub fn smoothed(&self) -> &[BoundingBox] {
        &self.smoothed
    }

    /// Smoothed boxes paired with the latest identity labels.
    pub fn view(&self) -> Vec<FaceDetection> {
        self.smoothed
            .iter()
            .zip(self.faces.iter())
            .map(|(bbox, face)| FaceDetection { bbox: *bbox, ..face.clone() })
            .collect()
    }

    pub fn clear(&mut self) {
        self.smoothed.clear();
        self.target.clear();
        self.faces.clear();
    }
}
