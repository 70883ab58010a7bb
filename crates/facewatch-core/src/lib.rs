//! facewatch-core: Face detection, embedding, and identity matching.
//!
//! Detection strategies (classic, YOLO-face on CUDA, SCRFD) sit behind one
//! [`Detector`] trait and are chosen by the [`DetectorSelector`]. Embeddings
//! come from an [`Embedder`], are matched by the [`EuclideanMatcher`], and
//! displayed boxes are smoothed between inference frames.

pub mod detector;
pub mod matcher;
pub mod recognizer;
pub mod scheduler;
pub mod selector;
pub mod smoother;
pub mod types;

pub use detector::{Detector, DetectorChoice, DetectorConfig, DetectorError, DetectorKind};
pub use matcher::{EuclideanMatcher, Gallery, MatchResult, Matcher};
pub use recognizer::{ArcFaceEmbedder, Embedder, RecognizerError};
pub use scheduler::{FpsMeter, FrameScheduler, Tick};
pub use selector::{ActiveDetector, DetectorFactory, DetectorSelector, OnnxDetectorFactory};
pub use smoother::BoxSmoother;
pub use types::{
    BoundingBox, DetectionResult, Embedding, EmbeddingError, FaceDetection, IdentityRecord,
    UNKNOWN_LABEL,
};
