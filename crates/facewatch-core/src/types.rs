use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Label and dedup key used for faces that match no enrolled identity.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Magic prefix of a serialized embedding blob.
const EMBEDDING_BLOB_MAGIC: [u8; 4] = *b"FWE1";
const EMBEDDING_BLOB_HEADER: usize = 8;

/// Face location in pixel coordinates of the frame it was computed on.
///
/// Edges follow the `(top, right, bottom, left)` convention. A valid box has
/// `right > left` and `bottom > top`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
    pub left: f32,
}

impl BoundingBox {
    pub fn new(top: f32, right: f32, bottom: f32, left: f32) -> Self {
        Self { top, right, bottom, left }
    }

    /// Build from corner coordinates `(x1, y1)`–`(x2, y2)`.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { top: y1, right: x2, bottom: y2, left: x1 }
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn is_valid(&self) -> bool {
        self.right > self.left && self.bottom > self.top
    }

    /// Multiply every edge by `factor` (e.g. detection space → native frame).
    pub fn scaled(&self, factor: f32) -> Self {
        Self {
            top: self.top * factor,
            right: self.right * factor,
            bottom: self.bottom * factor,
            left: self.left * factor,
        }
    }

    /// Clamp every edge into `[0, width] × [0, height]`.
    pub fn clipped(&self, width: u32, height: u32) -> Self {
        let w = width as f32;
        let h = height as f32;
        Self {
            top: self.top.clamp(0.0, h),
            right: self.right.clamp(0.0, w),
            bottom: self.bottom.clamp(0.0, h),
            left: self.left.clamp(0.0, w),
        }
    }

    /// Clip to the frame and drop the box if nothing valid remains.
    pub fn clip_to_frame(&self, width: u32, height: u32) -> Option<Self> {
        let clipped = self.clipped(width, height);
        clipped.is_valid().then_some(clipped)
    }

    /// One interpolation step: `self + (target - self) * alpha`, per edge.
    pub fn step_toward(&self, target: &BoundingBox, alpha: f32) -> Self {
        Self {
            top: self.top + (target.top - self.top) * alpha,
            right: self.right + (target.right - self.right) * alpha,
            bottom: self.bottom + (target.bottom - self.bottom) * alpha,
            left: self.left + (target.left - self.left) * alpha,
        }
    }

    /// Largest per-edge absolute difference to `other`.
    pub fn max_edge_delta(&self, other: &BoundingBox) -> f32 {
        (self.top - other.top)
            .abs()
            .max((self.right - other.right).abs())
            .max((self.bottom - other.bottom).abs())
            .max((self.left - other.left).abs())
    }

    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter = BoundingBox {
            top: self.top.max(other.top),
            right: self.right.min(other.right),
            bottom: self.bottom.min(other.bottom),
            left: self.left.max(other.left),
        };
        let inter_area = inter.area();
        let union_area = self.area() + other.area() - inter_area;
        if union_area > 0.0 {
            inter_area / union_area
        } else {
            0.0
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EmbeddingError {
    #[error("embedding blob too short: {0} bytes")]
    Truncated(usize),
    #[error("embedding blob has wrong magic")]
    BadMagic,
    #[error("embedding blob declares {declared} values but carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },
}

/// Fixed-length face descriptor produced by an embedder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Serialize to the storage blob: `FWE1`, u32 LE dimension, f32 LE values.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(EMBEDDING_BLOB_HEADER + self.values.len() * 4);
        out.extend_from_slice(&EMBEDDING_BLOB_MAGIC);
        out.extend_from_slice(&(self.values.len() as u32).to_le_bytes());
        for v in &self.values {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// Parse a blob written by [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EmbeddingError> {
        if bytes.len() < EMBEDDING_BLOB_HEADER {
            return Err(EmbeddingError::Truncated(bytes.len()));
        }
        if bytes[..4] != EMBEDDING_BLOB_MAGIC {
            return Err(EmbeddingError::BadMagic);
        }
        let declared = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        let payload = &bytes[EMBEDDING_BLOB_HEADER..];
        if payload.len() != declared * 4 {
            return Err(EmbeddingError::LengthMismatch {
                declared,
                actual: payload.len() / 4,
            });
        }
        let values = payload
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self { values })
    }
}

/// An enrolled identity with its reference embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub identity_id: String,
    pub display_name: String,
    pub embedding: Embedding,
    pub enrolled_at: DateTime<Utc>,
}

impl IdentityRecord {
    /// New record with a fresh stable id, enrolled now.
    pub fn enroll(display_name: impl Into<String>, embedding: Embedding) -> Self {
        Self {
            identity_id: uuid::Uuid::new_v4().to_string(),
            display_name: display_name.into(),
            embedding,
            enrolled_at: Utc::now(),
        }
    }
}

/// One located, labeled face in a processed frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceDetection {
    pub bbox: BoundingBox,
    /// Stable key of the matched identity; `None` for unknown faces.
    pub identity_id: Option<String>,
    pub display_name: Option<String>,
    /// `max(0, 1 - distance)` of the nearest gallery entry, in `[0, 1]`.
    pub confidence: f32,
}

impl FaceDetection {
    pub fn is_known(&self) -> bool {
        self.identity_id.is_some()
    }

    /// Overlay label, e.g. `"alice 87%"` or `"unknown"`.
    pub fn label(&self, show_confidence: bool) -> String {
        match (&self.display_name, show_confidence) {
            (Some(name), true) => format!("{name} {:.0}%", self.confidence * 100.0),
            (Some(name), false) => name.clone(),
            (None, _) => UNKNOWN_LABEL.to_string(),
        }
    }
}

/// Output of one full inference pass, ordered as the detector returned boxes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectionResult {
    pub faces: Vec<FaceDetection>,
}

impl DetectionResult {
    pub fn boxes(&self) -> Vec<BoundingBox> {
        self.faces.iter().map(|f| f.bbox).collect()
    }

    pub fn len(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }
}
