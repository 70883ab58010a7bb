//! Session orchestration.
//!
//! A session runs on two threads: the pipeline thread owns the camera and
//! does capture + inference, the log worker drains recognition events into
//! the store. The control side only ever touches [`RecognitionEngine`],
//! polling finished frames out of a bounded newest-wins queue.

use crate::annotate::{annotate, AnnotatedFrame};
use crate::config::{ConfigError, PipelineSettings};
use crate::event_log::EventLogger;
use crate::frame_queue::LatestFrameQueue;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use facewatch_core::scheduler::FPS_WINDOW;
use facewatch_core::{
    ArcFaceEmbedder, BoundingBox, BoxSmoother, DetectionResult, Detector, DetectorError,
    DetectorFactory, DetectorKind, DetectorSelector, Embedder, EuclideanMatcher, FpsMeter,
    FrameScheduler, Gallery, Matcher, OnnxDetectorFactory, RecognizerError,
};
use facewatch_hw::{Camera, CameraError, FrameSource};
use facewatch_store::{EventSink, FaceStore, GallerySource, StoreError};
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Consecutive capture failures after which the session gives up.
const MAX_CAPTURE_FAILURES: u32 = 50;
const CAPTURE_RETRY_DELAY: Duration = Duration::from_millis(20);

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),
    #[error("engine is {0}, expected idle")]
    InvalidState(EngineState),
    #[error("embedding model unavailable: {0}")]
    EmbedderUnavailable(#[source] RecognizerError),
    #[error("failed to load gallery: {0}")]
    Gallery(#[from] StoreError),
    #[error("invalid settings: {0}")]
    Config(#[from] ConfigError),
}

/// Failure of one frame's inference. The session keeps running.
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedder: {0}")]
    Embedder(#[from] RecognizerError),
    #[error("embedder returned {got} embeddings for {expected} faces")]
    EmbeddingCount { expected: usize, got: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Starting,
    Capturing,
    Stopping,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EngineState::Idle => "idle",
            EngineState::Starting => "starting",
            EngineState::Capturing => "capturing",
            EngineState::Stopping => "stopping",
        })
    }
}

/// Which detector strategy the current session is using, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorStatus {
    pub kind: DetectorKind,
    pub reason: String,
}

pub type CameraOpener = dyn Fn(u32) -> Result<Box<dyn FrameSource>, CameraError> + Send + Sync;
pub type EmbedderLoader =
    dyn Fn(&PipelineSettings) -> Result<Box<dyn Embedder>, RecognizerError> + Send + Sync;

/// Everything the engine needs from the outside world.
#[derive(Clone)]
pub struct Backends {
    pub open_camera: Arc<CameraOpener>,
    pub detectors: Arc<dyn DetectorFactory>,
    pub load_embedder: Arc<EmbedderLoader>,
    pub gallery: Arc<dyn GallerySource>,
    pub events: Arc<dyn EventSink>,
}

impl Backends {
    /// V4L2 camera, ONNX models from `model_dir`, SQLite store.
    pub fn hardware(store: Arc<FaceStore>) -> Self {
        Self {
            open_camera: Arc::new(|index: u32| {
                Camera::open_index(index).map(|c| Box::new(c) as Box<dyn FrameSource>)
            }),
            detectors: Arc::new(OnnxDetectorFactory),
            load_embedder: Arc::new(|settings: &PipelineSettings| {
                ArcFaceEmbedder::load(&settings.arcface_model_path())
                    .map(|e| Box::new(e) as Box<dyn Embedder>)
            }),
            gallery: store.clone(),
            events: store,
        }
    }
}

struct Session {
    running: Arc<AtomicBool>,
    pipeline: JoinHandle<()>,
    log_worker: JoinHandle<()>,
    camera_index: u32,
}

pub struct RecognitionEngine {
    backends: Backends,
    settings: PipelineSettings,
    state: Arc<Mutex<EngineState>>,
    frames: LatestFrameQueue<AnnotatedFrame>,
    active_detector: Arc<Mutex<Option<DetectorStatus>>>,
    gallery: Arc<Gallery>,
    session: Option<Session>,
}

impl RecognitionEngine {
    pub fn new(backends: Backends, settings: PipelineSettings) -> Self {
        Self {
            frames: LatestFrameQueue::new(settings.frame_queue_capacity),
            backends,
            settings,
            state: Arc::new(Mutex::new(EngineState::Idle)),
            active_detector: Arc::new(Mutex::new(None)),
            gallery: Arc::new(Gallery::default()),
            session: None,
        }
    }

    pub fn state(&self) -> EngineState {
        let state = *lock(&self.state);
        let pipeline_alive = self
            .session
            .as_ref()
            .is_some_and(|s| s.running.load(Ordering::Acquire));
        if state == EngineState::Capturing && !pipeline_alive {
            EngineState::Idle
        } else {
            state
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Capturing
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn active_detector(&self) -> Option<DetectorStatus> {
        lock(&self.active_detector).clone()
    }

    /// Enrolled identities used by the current (or next) session.
    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    /// Newest annotated frame, if one was published since the last poll.
    pub fn poll_frame(&self) -> Option<AnnotatedFrame> {
        self.frames.poll()
    }

    /// Re-read the gallery from the store. Only allowed between sessions.
    pub fn reload_gallery(&mut self) -> Result<usize, EngineError> {
        self.reap_finished_session();
        let state = self.state();
        if state != EngineState::Idle {
            return Err(EngineError::InvalidState(state));
        }
        self.reload_gallery_unchecked()?;
        Ok(self.gallery.len())
    }

    /// Open the camera and start a recognition session.
    ///
    /// Blocks while the detector is selected, then until the camera is open
    /// or `camera_open_timeout` expires.
    pub fn start(&mut self, camera_index: u32, settings: PipelineSettings) -> Result<(), EngineError> {
        self.reap_finished_session();
        let state = self.state();
        if state != EngineState::Idle {
            return Err(EngineError::InvalidState(state));
        }
        settings.validate()?;
        if settings.frame_queue_capacity != self.settings.frame_queue_capacity {
            self.frames = LatestFrameQueue::new(settings.frame_queue_capacity);
        }
        self.settings = settings;

        self.set_state(EngineState::Starting);
        match self.launch(camera_index) {
            Ok(session) => {
                self.session = Some(session);
                self.set_state(EngineState::Capturing);
                tracing::info!(camera = camera_index, "recognition session started");
                Ok(())
            }
            Err(e) => {
                *lock(&self.active_detector) = None;
                self.set_state(EngineState::Idle);
                tracing::warn!(camera = camera_index, error = %e, "failed to start session");
                Err(e)
            }
        }
    }

    fn launch(&mut self, camera_index: u32) -> Result<Session, EngineError> {
        self.reload_gallery_unchecked()?;
        let embedder =
            (self.backends.load_embedder)(&self.settings).map_err(EngineError::EmbedderUnavailable)?;

        let running = Arc::new(AtomicBool::new(true));
        let logger = EventLogger::new(
            self.settings.log_cooldown(),
            self.settings.unknown_cooldown_multiplier,
        );
        let log_worker = logger.spawn_worker(self.backends.events.clone(), running.clone());

        let (startup_tx, startup_rx) = bounded(2);
        let ctx = PipelineContext {
            camera_index,
            settings: self.settings.clone(),
            open_camera: self.backends.open_camera.clone(),
            detectors: self.backends.detectors.clone(),
            embedder,
            gallery: self.gallery.clone(),
            logger,
            frames: self.frames.clone(),
            active_detector: self.active_detector.clone(),
            running: running.clone(),
        };
        let pipeline = std::thread::Builder::new()
            .name("facewatch-pipeline".into())
            .spawn(move || run_session(ctx, startup_tx))
            .expect("failed to spawn pipeline thread");

        // Detector selection never fails and is not covered by the camera timeout.
        let timeout = self.settings.camera_open_timeout();
        let outcome = match startup_rx.recv() {
            Ok(Startup::DetectorSelected) => match startup_rx.recv_timeout(timeout) {
                Ok(Startup::CameraOpened(Ok(()))) => Ok(()),
                Ok(Startup::CameraOpened(Err(e))) => Err(EngineError::CameraUnavailable(e.to_string())),
                Ok(Startup::DetectorSelected) => Err(EngineError::CameraUnavailable(
                    "unexpected startup message".into(),
                )),
                Err(RecvTimeoutError::Timeout) => Err(EngineError::CameraUnavailable(format!(
                    "camera {camera_index} did not open within {timeout:?}"
                ))),
                Err(RecvTimeoutError::Disconnected) => Err(startup_exited()),
            },
            Ok(Startup::CameraOpened(_)) | Err(_) => Err(startup_exited()),
        };

        match outcome {
            Ok(()) => Ok(Session {
                running,
                pipeline,
                log_worker,
                camera_index,
            }),
            Err(e) => {
                running.store(false, Ordering::Release);
                // A camera stuck in open() keeps the pipeline thread alive; it
                // exits on its own once open returns and sees the flag.
                if pipeline.is_finished() {
                    join_thread(pipeline, "pipeline");
                }
                join_thread(log_worker, "log worker");
                Err(e)
            }
        }
    }

    /// End the session and release the camera. Harmless when already stopped.
    pub fn stop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        self.set_state(EngineState::Stopping);
        session.running.store(false, Ordering::Release);
        join_thread(session.pipeline, "pipeline");
        join_thread(session.log_worker, "log worker");

        self.frames.clear();
        *lock(&self.active_detector) = None;
        self.set_state(EngineState::Idle);
        tracing::info!("recognition session stopped");
    }

    /// Replace the settings, restarting the session if one is running.
    pub fn apply_settings(&mut self, settings: PipelineSettings) -> Result<(), EngineError> {
        settings.validate()?;
        self.reap_finished_session();
        let Some(camera_index) = self.session.as_ref().map(|s| s.camera_index) else {
            if settings.frame_queue_capacity != self.settings.frame_queue_capacity {
                self.frames = LatestFrameQueue::new(settings.frame_queue_capacity);
            }
            self.settings = settings;
            return Ok(());
        };
        tracing::info!("restarting session with new settings");
        self.stop();
        self.start(camera_index, settings)
    }

    fn reload_gallery_unchecked(&mut self) -> Result<(), EngineError> {
        let records = self.backends.gallery.load_all()?;
        self.gallery = Arc::new(Gallery::new(records));
        tracing::info!(identities = self.gallery.len(), "gallery loaded");
        Ok(())
    }

    /// Join a session whose pipeline gave up on its own.
    fn reap_finished_session(&mut self) {
        let finished = self
            .session
            .as_ref()
            .is_some_and(|s| !s.running.load(Ordering::Acquire));
        if finished {
            self.stop();
        }
    }

    fn set_state(&self, state: EngineState) {
        *lock(&self.state) = state;
    }
}

impl Drop for RecognitionEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn startup_exited() -> EngineError {
    EngineError::CameraUnavailable("pipeline thread exited during startup".into())
}

fn join_thread(handle: JoinHandle<()>, name: &str) {
    if handle.join().is_err() {
        tracing::warn!(thread = name, "thread panicked");
    }
}

/// Progress reported by the pipeline thread while a session starts.
enum Startup {
    DetectorSelected,
    CameraOpened(Result<(), CameraError>),
}

/// Everything moved onto the pipeline thread.
struct PipelineContext {
    camera_index: u32,
    settings: PipelineSettings,
    open_camera: Arc<CameraOpener>,
    detectors: Arc<dyn DetectorFactory>,
    embedder: Box<dyn Embedder>,
    gallery: Arc<Gallery>,
    logger: EventLogger,
    frames: LatestFrameQueue<AnnotatedFrame>,
    active_detector: Arc<Mutex<Option<DetectorStatus>>>,
    running: Arc<AtomicBool>,
}

fn run_session(ctx: PipelineContext, startup: Sender<Startup>) {
    let selected = DetectorSelector::new(ctx.detectors.clone())
        .select(ctx.settings.detector, &ctx.settings.detector_config());
    if ctx.running.load(Ordering::Acquire) {
        *lock(&ctx.active_detector) = Some(DetectorStatus {
            kind: selected.kind,
            reason: selected.reason,
        });
    }
    if startup.send(Startup::DetectorSelected).is_err() {
        return;
    }

    let source = match (ctx.open_camera)(ctx.camera_index) {
        Ok(source) => source,
        Err(e) => {
            let _ = startup.send(Startup::CameraOpened(Err(e)));
            return;
        }
    };
    if !ctx.running.load(Ordering::Acquire) || startup.send(Startup::CameraOpened(Ok(()))).is_err() {
        tracing::debug!("start abandoned; closing camera");
        return;
    }
    let (width, height) = source.resolution();
    tracing::info!(camera = ctx.camera_index, width, height, "camera opened");

    let mut pipeline = Pipeline {
        source,
        detector: selected.detector,
        embedder: ctx.embedder,
        matcher: EuclideanMatcher::new(ctx.settings.tolerance, ctx.settings.distance_threshold),
        gallery: ctx.gallery,
        scheduler: FrameScheduler::new(ctx.settings.process_every_n_frames),
        smoother: BoxSmoother::new(ctx.settings.smoothing_factor),
        fps: FpsMeter::default(),
        logger: ctx.logger,
        frames: ctx.frames,
        frame_scale: ctx.settings.frame_scale,
        show_confidence: ctx.settings.show_confidence,
    };
    pipeline.run(&ctx.running);
    // Also set when the loop gave up on its own, so the engine reports Idle.
    ctx.running.store(false, Ordering::Release);
}

/// Per-session inference state, owned by the pipeline thread.
struct Pipeline {
    source: Box<dyn FrameSource>,
    detector: Box<dyn Detector>,
    embedder: Box<dyn Embedder>,
    matcher: EuclideanMatcher,
    gallery: Arc<Gallery>,
    scheduler: FrameScheduler,
    smoother: BoxSmoother,
    fps: FpsMeter,
    logger: EventLogger,
    frames: LatestFrameQueue<AnnotatedFrame>,
    frame_scale: f32,
    show_confidence: bool,
}

impl Pipeline {
    fn run(&mut self, running: &AtomicBool) {
        let mut failures = 0u32;

        while running.load(Ordering::Acquire) {
            let frame = match self.source.read_frame() {
                Ok(frame) => {
                    failures = 0;
                    frame
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(error = %e, failures, "frame capture failed");
                    if failures >= MAX_CAPTURE_FAILURES {
                        tracing::warn!("too many capture failures; ending session");
                        break;
                    }
                    std::thread::sleep(CAPTURE_RETRY_DELAY);
                    continue;
                }
            };

            let tick = self.scheduler.tick();
            if tick.process {
                match self.infer(&frame.image) {
                    Ok(result) => {
                        for face in &result.faces {
                            self.logger.record(face);
                        }
                        self.smoother.set_target(&result);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, frame = tick.sequence, "inference failed; keeping previous boxes");
                    }
                }
            }
            self.smoother.step();

            let fps = self.fps.tick(Instant::now());
            if tick.sequence % FPS_WINDOW as u64 == 0 {
                tracing::debug!(frame = tick.sequence, fps = ?fps, faces = self.smoother.smoothed().len(), "pipeline");
            }

            let faces = self.smoother.view();
            self.frames
                .publish(annotate(frame.image, &faces, self.show_confidence, fps, tick.sequence));
        }

        self.smoother.clear();
        self.logger.clear();
    }

    /// Detect on the downscaled frame, then embed and match at full resolution.
    fn infer(&mut self, image: &RgbImage) -> Result<DetectionResult, InferenceError> {
        let (width, height) = image.dimensions();
        let small = downscale(image, self.frame_scale);
        let (sx, sy) = (
            width as f32 / small.width() as f32,
            height as f32 / small.height() as f32,
        );

        let boxes: Vec<_> = self
            .detector
            .locate_faces(&small)?
            .into_iter()
            .filter_map(|b| {
                BoundingBox::new(b.top * sy, b.right * sx, b.bottom * sy, b.left * sx)
                    .clip_to_frame(width, height)
            })
            .collect();

        if boxes.is_empty() {
            return Ok(DetectionResult::default());
        }

        let embeddings = self.embedder.embed_all(image, &boxes)?;
        if embeddings.len() != boxes.len() {
            return Err(InferenceError::EmbeddingCount {
                expected: boxes.len(),
                got: embeddings.len(),
            });
        }

        let faces = boxes
            .into_iter()
            .zip(embeddings.iter())
            .map(|(bbox, embedding)| self.matcher.compare(embedding, &self.gallery).into_detection(bbox))
            .collect();
        Ok(DetectionResult { faces })
    }
}

fn downscale(image: &RgbImage, scale: f32) -> Cow<'_, RgbImage> {
    if scale >= 1.0 {
        return Cow::Borrowed(image);
    }
    let w = ((image.width() as f32 * scale).round() as u32).max(1);
    let h = ((image.height() as f32 * scale).round() as u32).max(1);
    Cow::Owned(imageops::resize(image, w, h, FilterType::Triangle))
}
