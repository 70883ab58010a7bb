//! facewatch-engine: Live recognition sessions.
//!
//! [`RecognitionEngine`] runs capture and inference on a dedicated pipeline
//! thread, logs recognitions through a deduplicating background writer, and
//! hands annotated frames to the caller through a bounded newest-wins queue.

pub mod annotate;
pub mod config;
pub mod engine;
pub mod event_log;
pub mod frame_queue;

pub use annotate::{annotate, AnnotatedFrame, FaceOverlay};
pub use config::{ConfigError, PipelineSettings, Preset};
pub use engine::{
    Backends, CameraOpener, DetectorStatus, EmbedderLoader, EngineError, EngineState,
    InferenceError, RecognitionEngine,
};
pub use event_log::{EventLogger, PendingEvent};
pub use frame_queue::LatestFrameQueue;
