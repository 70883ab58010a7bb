//! Detector selection with fallback.
//!
//! Resolves a [`DetectorChoice`] to a working [`Detector`], trying strategies
//! in preference order and degrading to the classic detector. Selection never
//! fails: the classic strategy has no external dependency.

use crate::detector::{
    ClassicDetector, Detector, DetectorChoice, DetectorConfig, DetectorError, DetectorKind,
    ScrfdDetector, YoloFaceDetector,
};
use std::sync::Arc;

/// Builds a concrete strategy. Separated from the selector so backends can be swapped.
pub trait DetectorFactory: Send + Sync {
    fn construct(
        &self,
        kind: DetectorKind,
        config: &DetectorConfig,
    ) -> Result<Box<dyn Detector>, DetectorError>;
}

impl<T: DetectorFactory + ?Sized> DetectorFactory for Arc<T> {
    fn construct(
        &self,
        kind: DetectorKind,
        config: &DetectorConfig,
    ) -> Result<Box<dyn Detector>, DetectorError> {
        (**self).construct(kind, config)
    }
}

/// Factory for the ONNX-backed strategies shipped in this crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct OnnxDetectorFactory;

impl DetectorFactory for OnnxDetectorFactory {
    fn construct(
        &self,
        kind: DetectorKind,
        config: &DetectorConfig,
    ) -> Result<Box<dyn Detector>, DetectorError> {
        Ok(match kind {
            DetectorKind::Fast => Box::new(ClassicDetector::new(config.upsample)),
            DetectorKind::Gpu => Box::new(YoloFaceDetector::load(&config.yolo_model_path())?),
            DetectorKind::Accurate => Box::new(ScrfdDetector::load(&config.scrfd_model_path())?),
        })
    }
}

/// The strategy chosen for a session, with the reason it was chosen.
pub struct ActiveDetector {
    pub detector: Box<dyn Detector>,
    pub kind: DetectorKind,
    pub reason: String,
}

pub struct DetectorSelector<F: DetectorFactory> {
    factory: F,
}

impl<F: DetectorFactory> DetectorSelector<F> {
    pub fn new(factory: F) -> Self {
        Self { factory }
    }

    /// Resolve `choice` to a working detector, never failing.
    pub fn select(&self, choice: DetectorChoice, config: &DetectorConfig) -> ActiveDetector {
        let mut failures: Vec<String> = Vec::new();

        for &kind in choice.resolution_order() {
            match self.factory.construct(kind, config) {
                Ok(detector) => {
                    let reason = if failures.is_empty() {
                        format!("{choice} preference")
                    } else {
                        format!("fallback after: {}", failures.join("; "))
                    };
                    tracing::info!(detector = %kind, choice = %choice, reason = %reason, "detector selected");
                    return ActiveDetector { detector, kind, reason };
                }
                Err(e) => {
                    tracing::warn!(detector = %kind, error = %e, "detector unavailable; trying next strategy");
                    failures.push(format!("{kind}: {e}"));
                }
            }
        }

        // A custom factory may refuse even the classic strategy.
        let reason = format!("built-in classic detector after: {}", failures.join("; "));
        tracing::warn!(reason = %reason, "all configured strategies failed");
        ActiveDetector {
            detector: Box::new(ClassicDetector::new(config.upsample)),
            kind: DetectorKind::Fast,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;
    use image::RgbImage;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::Mutex;

    struct StubDetector(DetectorKind);

    impl Detector for StubDetector {
        fn kind(&self) -> DetectorKind {
            self.0
        }
        fn locate_faces(&mut self, _image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
            Ok(Vec::new())
        }
    }

    /// Constructs every kind except the ones listed as broken, recording attempts.
    struct StubFactory {
        broken: HashSet<DetectorKind>,
        attempts: Mutex<Vec<DetectorKind>>,
    }

    impl StubFactory {
        fn broken(kinds: &[DetectorKind]) -> Self {
            Self {
                broken: kinds.iter().copied().collect(),
                attempts: Mutex::new(Vec::new()),
            }
        }
    }

    impl DetectorFactory for StubFactory {
        fn construct(
            &self,
            kind: DetectorKind,
            _config: &DetectorConfig,
        ) -> Result<Box<dyn Detector>, DetectorError> {
            self.attempts.lock().unwrap().push(kind);
            if self.broken.contains(&kind) {
                Err(DetectorError::ModelNotFound(format!("{kind:?}")))
            } else {
                Ok(Box::new(StubDetector(kind)))
            }
        }
    }

    fn config() -> DetectorConfig {
        DetectorConfig { model_dir: PathBuf::from("/nonexistent"), upsample: 1 }
    }

    #[test]
    fn test_accurate_falls_back_to_gpu() {
        let selector = DetectorSelector::new(StubFactory::broken(&[DetectorKind::Accurate]));
        let active = selector.select(DetectorChoice::Accurate, &config());
        assert_eq!(active.kind, DetectorKind::Gpu);
        assert_eq!(active.detector.kind(), DetectorKind::Gpu);
        assert!(active.reason.starts_with("fallback"));
    }

    #[test]
    fn test_accurate_and_gpu_broken_falls_back_to_fast() {
        let selector =
            DetectorSelector::new(StubFactory::broken(&[DetectorKind::Accurate, DetectorKind::Gpu]));
        let active = selector.select(DetectorChoice::Accurate, &config());
        assert_eq!(active.kind, DetectorKind::Fast);
    }

    #[test]
    fn test_gpu_choice_never_tries_accurate() {
        let factory = StubFactory::broken(&[DetectorKind::Gpu]);
        let selector = DetectorSelector::new(factory);
        let active = selector.select(DetectorChoice::Gpu, &config());
        assert_eq!(active.kind, DetectorKind::Fast);
        assert_eq!(
            *selector.factory.attempts.lock().unwrap(),
            vec![DetectorKind::Gpu, DetectorKind::Fast]
        );
    }

    #[test]
    fn test_everything_broken_still_yields_classic() {
        let selector = DetectorSelector::new(StubFactory::broken(&[
            DetectorKind::Accurate,
            DetectorKind::Gpu,
            DetectorKind::Fast,
        ]));
        let active = selector.select(DetectorChoice::Auto, &config());
        assert_eq!(active.kind, DetectorKind::Fast);
        assert!(active.reason.contains("built-in classic"));
    }

    #[test]
    fn test_onnx_factory_missing_models_degrade_to_classic() {
        let active = DetectorSelector::new(OnnxDetectorFactory).select(DetectorChoice::Auto, &config());
        assert_eq!(active.kind, DetectorKind::Fast);
    }
}
