use facewatch_core::{
    BoundingBox, Detector, DetectorConfig, DetectorError, DetectorFactory, DetectorKind, Embedder,
    Embedding, IdentityRecord, RecognizerError,
};
use facewatch_engine::{
    AnnotatedFrame, Backends, CameraOpener, EngineError, EngineState, PipelineSettings,
    RecognitionEngine,
};
use facewatch_hw::{CameraError, Frame, FrameSource};
use facewatch_store::FaceStore;
use image::{Rgb, RgbImage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

type CameraResult = Result<Box<dyn FrameSource>, CameraError>;
type EmbedderResult = Result<Box<dyn Embedder>, RecognizerError>;

const WIDTH: u32 = 320;
const HEIGHT: u32 = 240;

#[derive(Default)]
struct FakeCamera {
    sequence: u32,
    reads: Arc<AtomicUsize>,
}

impl FrameSource for FakeCamera {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        std::thread::sleep(Duration::from_millis(5));
        self.sequence += 1;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(Frame::new(
            RgbImage::from_pixel(WIDTH, HEIGHT, Rgb([90, 90, 90])),
            self.sequence,
        ))
    }

    fn resolution(&self) -> (u32, u32) {
        (WIDTH, HEIGHT)
    }
}

struct BrokenCamera;

impl FrameSource for BrokenCamera {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        Err(CameraError::CaptureFailed("unplugged".into()))
    }

    fn resolution(&self) -> (u32, u32) {
        (WIDTH, HEIGHT)
    }
}

/// Reports one face in the middle of the (downscaled) frame. With
/// `fail_first`, the first call errors.
struct ScriptedDetector {
    calls: Arc<AtomicUsize>,
    fail_first: bool,
}

impl Detector for ScriptedDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Accurate
    }

    fn locate_faces(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_first && n == 0 {
            return Err(DetectorError::InferenceFailed("transient".into()));
        }
        let (w, h) = (image.width() as f32, image.height() as f32);
        Ok(vec![BoundingBox::new(h * 0.25, w * 0.75, h * 0.75, w * 0.25)])
    }
}

#[derive(Clone, Default)]
struct ScriptedFactory {
    calls: Arc<AtomicUsize>,
    fail_first: bool,
    /// Time `construct` takes, like loading a model from disk.
    load_time: Duration,
}

impl DetectorFactory for ScriptedFactory {
    fn construct(
        &self,
        _kind: DetectorKind,
        _config: &DetectorConfig,
    ) -> Result<Box<dyn Detector>, DetectorError> {
        std::thread::sleep(self.load_time);
        Ok(Box::new(ScriptedDetector {
            calls: self.calls.clone(),
            fail_first: self.fail_first,
        }))
    }
}

/// Returns the same probe embedding for every face.
struct FixedEmbedder(Embedding);

impl Embedder for FixedEmbedder {
    fn embed_all(
        &mut self,
        _image: &RgbImage,
        boxes: &[BoundingBox],
    ) -> Result<Vec<Embedding>, RecognizerError> {
        Ok(boxes.iter().map(|_| self.0.clone()).collect())
    }
}

fn bob_embedding() -> Embedding {
    Embedding::new(vec![1.0, 0.0, 0.0, 0.0])
}

/// Euclidean distance 0.1 from bob.
fn probe_embedding() -> Embedding {
    Embedding::new(vec![1.0, 0.1, 0.0, 0.0])
}

fn store_with_bob() -> (Arc<FaceStore>, String) {
    let store = Arc::new(FaceStore::open_in_memory().unwrap());
    let bob = IdentityRecord::enroll("bob", bob_embedding());
    assert!(store.add(&bob).unwrap());
    (store, bob.identity_id)
}

fn working_camera() -> Arc<CameraOpener> {
    Arc::new(|_index: u32| -> CameraResult { Ok(Box::new(FakeCamera::default())) })
}

fn backends(store: Arc<FaceStore>, open_camera: Arc<CameraOpener>, detectors: ScriptedFactory) -> Backends {
    Backends {
        open_camera,
        detectors: Arc::new(detectors),
        load_embedder: Arc::new(|_settings: &PipelineSettings| -> EmbedderResult {
            Ok(Box::new(FixedEmbedder(probe_embedding())))
        }),
        gallery: store.clone(),
        events: store,
    }
}

fn test_settings() -> PipelineSettings {
    PipelineSettings {
        camera_open_timeout_ms: 2000,
        ..PipelineSettings::default()
    }
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

fn wait_for_frame(
    engine: &RecognitionEngine,
    mut accept: impl FnMut(&AnnotatedFrame) -> bool,
) -> Option<AnnotatedFrame> {
    let mut found = None;
    wait_until(Duration::from_secs(5), || match engine.poll_frame() {
        Some(frame) if accept(&frame) => {
            found = Some(frame);
            true
        }
        _ => false,
    });
    found
}

#[test]
fn recognizes_enrolled_face_and_logs_once() {
    let (store, bob_id) = store_with_bob();
    let mut engine = RecognitionEngine::new(
        backends(store.clone(), working_camera(), ScriptedFactory::default()),
        test_settings(),
    );

    engine.start(0, test_settings()).unwrap();
    assert!(engine.is_running());
    assert_eq!(engine.gallery().len(), 1);
    assert_eq!(
        engine.active_detector().map(|d| d.kind),
        Some(DetectorKind::Accurate)
    );

    let frame = wait_for_frame(&engine, |f| f.face_count == 1).expect("no annotated frame with a face");
    assert_eq!(frame.faces[0].label, "bob 90%");
    assert!(frame.faces[0].known);
    // Detected at quarter scale, reported at native resolution.
    let b = frame.faces[0].bbox;
    assert!((b.left - 80.0).abs() < 1.0 && (b.right - 240.0).abs() < 1.0, "{b:?}");
    assert!(b.bottom <= HEIGHT as f32 && b.right <= WIDTH as f32);

    assert!(wait_until(Duration::from_secs(5), || store.query_events(10).unwrap().len() == 1));
    // Still inside the cooldown: no second event.
    std::thread::sleep(Duration::from_millis(300));
    engine.stop();

    let events = store.query_events(10).unwrap();
    assert_eq!(events.len(), 1);
    assert!(events[0].matched);
    assert_eq!(events[0].display_name, "bob");
    assert_eq!(events[0].identity_id.as_deref(), Some(bob_id.as_str()));
}

#[test]
fn unknown_face_when_gallery_empty() {
    let store = Arc::new(FaceStore::open_in_memory().unwrap());
    let mut engine = RecognitionEngine::new(
        backends(store.clone(), working_camera(), ScriptedFactory::default()),
        test_settings(),
    );
    engine.start(0, test_settings()).unwrap();

    let frame = wait_for_frame(&engine, |f| f.face_count == 1).expect("no annotated frame with a face");
    assert_eq!(frame.faces[0].label, "unknown");
    assert!(!frame.faces[0].known);

    assert!(wait_until(Duration::from_secs(5), || !store.query_events(10).unwrap().is_empty()));
    engine.stop();
    let events = store.query_events(10).unwrap();
    assert_eq!(events.len(), 1);
    assert!(!events[0].matched);
    assert_eq!(events[0].identity_id, None);
}

#[test]
fn camera_failure_leaves_engine_idle() {
    let (store, _) = store_with_bob();
    let failing: Arc<CameraOpener> =
        Arc::new(|index: u32| -> CameraResult {
            Err(CameraError::DeviceNotFound(format!("/dev/video{index}")))
        });
    let mut engine = RecognitionEngine::new(
        backends(store, failing, ScriptedFactory::default()),
        test_settings(),
    );

    let err = engine.start(7, test_settings()).unwrap_err();
    assert!(matches!(err, EngineError::CameraUnavailable(_)), "{err}");
    assert_eq!(engine.state(), EngineState::Idle);
    assert!(!engine.is_running());
    assert!(engine.active_detector().is_none());
    assert!(engine.poll_frame().is_none());
}

#[test]
fn camera_open_timeout_aborts_start() {
    let (store, _) = store_with_bob();
    let slow: Arc<CameraOpener> = Arc::new(|_index: u32| -> CameraResult {
        std::thread::sleep(Duration::from_millis(500));
        Ok(Box::new(FakeCamera::default()))
    });
    let settings = PipelineSettings {
        camera_open_timeout_ms: 50,
        ..PipelineSettings::default()
    };
    let mut engine = RecognitionEngine::new(
        backends(store, slow, ScriptedFactory::default()),
        settings.clone(),
    );

    let started = Instant::now();
    assert!(matches!(
        engine.start(0, settings),
        Err(EngineError::CameraUnavailable(_))
    ));
    assert!(started.elapsed() < Duration::from_millis(450));
    assert_eq!(engine.state(), EngineState::Idle);
}

#[test]
fn slow_detector_load_does_not_count_against_camera_timeout() {
    let (store, _) = store_with_bob();
    let factory = ScriptedFactory {
        load_time: Duration::from_millis(600),
        ..Default::default()
    };
    let settings = PipelineSettings {
        camera_open_timeout_ms: 300,
        ..PipelineSettings::default()
    };
    let mut engine = RecognitionEngine::new(backends(store, working_camera(), factory), settings.clone());

    engine.start(0, settings).unwrap();
    assert!(engine.is_running());
    assert_eq!(
        engine.active_detector().map(|d| d.kind),
        Some(DetectorKind::Accurate)
    );
    let frame = wait_for_frame(&engine, |f| f.face_count == 1).expect("no annotated frame with a face");
    assert_eq!(frame.faces[0].label, "bob 90%");
    engine.stop();
}

#[test]
fn missing_embedder_rejects_start() {
    let (store, _) = store_with_bob();
    let mut b = backends(store, working_camera(), ScriptedFactory::default());
    b.load_embedder = Arc::new(|_settings: &PipelineSettings| -> EmbedderResult {
        Err(RecognizerError::ModelNotFound("w600k_r50.onnx".into()))
    });
    let mut engine = RecognitionEngine::new(b, test_settings());

    assert!(matches!(
        engine.start(0, test_settings()),
        Err(EngineError::EmbedderUnavailable(_))
    ));
    assert_eq!(engine.state(), EngineState::Idle);
}

#[test]
fn start_while_running_is_rejected_and_stop_is_idempotent() {
    let (store, _) = store_with_bob();
    let mut engine = RecognitionEngine::new(
        backends(store, working_camera(), ScriptedFactory::default()),
        test_settings(),
    );

    engine.start(0, test_settings()).unwrap();
    assert!(matches!(
        engine.start(0, test_settings()),
        Err(EngineError::InvalidState(EngineState::Capturing))
    ));
    assert!(matches!(
        engine.reload_gallery(),
        Err(EngineError::InvalidState(EngineState::Capturing))
    ));

    engine.stop();
    engine.stop();
    assert_eq!(engine.state(), EngineState::Idle);
    assert!(engine.poll_frame().is_none());
    assert!(engine.active_detector().is_none());
    assert_eq!(engine.reload_gallery().unwrap(), 1);

    // A stopped engine can start again.
    engine.start(0, test_settings()).unwrap();
    assert!(engine.is_running());
    engine.stop();
}

#[test]
fn detector_error_skips_frame_and_keeps_running() {
    let (store, _) = store_with_bob();
    let factory = ScriptedFactory {
        fail_first: true,
        ..Default::default()
    };
    let calls = factory.calls.clone();
    let settings = PipelineSettings {
        process_every_n_frames: 1,
        ..test_settings()
    };
    let mut engine = RecognitionEngine::new(backends(store, working_camera(), factory), settings.clone());
    engine.start(0, settings).unwrap();

    let frame = wait_for_frame(&engine, |f| f.face_count == 1).expect("loop stopped after detector error");
    assert!(calls.load(Ordering::SeqCst) >= 2);
    assert_eq!(frame.faces[0].label, "bob 90%");
    assert!(engine.is_running());
    engine.stop();
}

#[test]
fn only_every_nth_frame_runs_inference() {
    let (store, _) = store_with_bob();
    let factory = ScriptedFactory::default();
    let calls = factory.calls.clone();
    let settings = PipelineSettings {
        process_every_n_frames: 4,
        ..test_settings()
    };
    let reads = Arc::new(AtomicUsize::new(0));
    let camera_reads = reads.clone();
    let counting: Arc<CameraOpener> = Arc::new(move |_index: u32| -> CameraResult {
        Ok(Box::new(FakeCamera {
            sequence: 0,
            reads: camera_reads.clone(),
        }))
    });
    let mut engine = RecognitionEngine::new(backends(store, counting, factory), settings.clone());
    engine.start(0, settings).unwrap();

    wait_for_frame(&engine, |f| f.sequence >= 40).expect("pipeline stalled");
    engine.stop();
    let frames = reads.load(Ordering::SeqCst);
    assert!(frames >= 40);
    assert_eq!(calls.load(Ordering::SeqCst), frames / 4);
}

#[test]
fn apply_settings_restarts_running_session() {
    let (store, _) = store_with_bob();
    let mut engine = RecognitionEngine::new(
        backends(store, working_camera(), ScriptedFactory::default()),
        test_settings(),
    );
    engine.start(3, test_settings()).unwrap();

    let updated = PipelineSettings {
        show_confidence: false,
        ..test_settings()
    };
    engine.apply_settings(updated).unwrap();
    assert!(engine.is_running());
    assert!(!engine.settings().show_confidence);

    let frame = wait_for_frame(&engine, |f| f.face_count == 1).expect("no frame after restart");
    assert_eq!(frame.faces[0].label, "bob");
    engine.stop();

    let invalid = PipelineSettings {
        smoothing_factor: 0.0,
        ..test_settings()
    };
    assert!(matches!(engine.apply_settings(invalid), Err(EngineError::Config(_))));
}

#[test]
fn session_ends_after_repeated_capture_failures() {
    let (store, _) = store_with_bob();
    let broken: Arc<CameraOpener> =
        Arc::new(|_index: u32| -> CameraResult { Ok(Box::new(BrokenCamera)) });
    let mut engine = RecognitionEngine::new(
        backends(store, broken, ScriptedFactory::default()),
        test_settings(),
    );
    engine.start(0, test_settings()).unwrap();

    assert!(wait_until(Duration::from_secs(5), || !engine.is_running()));
    assert_eq!(engine.state(), EngineState::Idle);
    engine.stop();
    engine.start(0, test_settings()).unwrap();
    engine.stop();
}
