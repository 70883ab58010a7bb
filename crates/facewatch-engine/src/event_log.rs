//! Deduplicated, non-blocking recognition event logging.
//!
//! The pipeline calls [`EventLogger::record`] for every face on every
//! processed frame. Repeats of the same key within the cooldown are dropped
//! on the spot; accepted events go onto an unbounded queue drained by a
//! worker thread that writes to the [`EventSink`].

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use facewatch_core::{FaceDetection, UNKNOWN_LABEL};
use facewatch_store::EventSink;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How long the worker waits on an empty queue before re-checking shutdown.
const WORKER_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEvent {
    pub display_name: String,
    pub identity_id: Option<String>,
    pub matched: bool,
}

impl PendingEvent {
    fn from_face(face: &FaceDetection) -> Self {
        match (&face.identity_id, &face.display_name) {
            (Some(id), Some(name)) => Self {
                display_name: name.clone(),
                identity_id: Some(id.clone()),
                matched: true,
            },
            _ => Self {
                display_name: UNKNOWN_LABEL.to_string(),
                identity_id: None,
                matched: false,
            },
        }
    }

    /// Dedup key: the identity for matched faces, a shared key for unknowns.
    fn key(&self) -> &str {
        self.identity_id.as_deref().unwrap_or(UNKNOWN_LABEL)
    }
}

pub struct EventLogger {
    cooldown: Duration,
    unknown_cooldown: Duration,
    last_logged: HashMap<String, Instant>,
    tx: Sender<PendingEvent>,
    rx: Receiver<PendingEvent>,
}

impl EventLogger {
    pub fn new(cooldown: Duration, unknown_multiplier: f32) -> Self {
        let (tx, rx) = unbounded();
        Self {
            cooldown,
            unknown_cooldown: Duration::try_from_secs_f64(
                cooldown.as_secs_f64() * f64::from(unknown_multiplier.max(1.0)),
            )
            .unwrap_or(Duration::MAX),
            last_logged: HashMap::new(),
            tx,
            rx,
        }
    }

    /// Queue an event for `face` unless its key is still cooling down.
    /// Returns whether the event was accepted.
    pub fn record(&mut self, face: &FaceDetection) -> bool {
        self.record_at(face, Instant::now())
    }

    pub fn record_at(&mut self, face: &FaceDetection, now: Instant) -> bool {
        let event = PendingEvent::from_face(face);
        let cooldown = if event.matched {
            self.cooldown
        } else {
            self.unknown_cooldown
        };

        if let Some(last) = self.last_logged.get(event.key()) {
            if now.saturating_duration_since(*last) < cooldown {
                return false;
            }
        }
        self.last_logged.insert(event.key().to_string(), now);

        // The logger holds a receiver, so the channel can't be disconnected.
        let _ = self.tx.send(event);
        true
    }

    /// Events accepted but not yet taken by a worker.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Drop queued events and forget cooldown history.
    pub fn clear(&mut self) {
        self.last_logged.clear();
        while self.rx.try_recv().is_ok() {}
    }

    /// Start the thread that writes queued events to `sink` until `running` goes false.
    pub fn spawn_worker(&self, sink: Arc<dyn EventSink>, running: Arc<AtomicBool>) -> JoinHandle<()> {
        let rx = self.rx.clone();
        std::thread::Builder::new()
            .name("facewatch-log".into())
            .spawn(move || run_worker(rx, sink, running))
            .expect("failed to spawn log worker thread")
    }
}

fn run_worker(rx: Receiver<PendingEvent>, sink: Arc<dyn EventSink>, running: Arc<AtomicBool>) {
    tracing::debug!("log worker started");
    while running.load(Ordering::Acquire) {
        match rx.recv_timeout(WORKER_POLL) {
            Ok(event) => write_event(sink.as_ref(), &event),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    tracing::debug!("log worker exiting");
}

fn write_event(sink: &dyn EventSink, event: &PendingEvent) {
    match sink.append_event(&event.display_name, event.identity_id.as_deref(), event.matched) {
        Ok(()) => tracing::debug!(name = %event.display_name, matched = event.matched, "event logged"),
        Err(e) => tracing::warn!(error = %e, name = %event.display_name, "failed to write event; dropped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facewatch_core::BoundingBox;
    use facewatch_store::StoreError;
    use std::sync::Mutex;

    fn known(id: &str, name: &str) -> FaceDetection {
        FaceDetection {
            bbox: BoundingBox::new(0.0, 10.0, 10.0, 0.0),
            identity_id: Some(id.into()),
            display_name: Some(name.into()),
            confidence: 0.9,
        }
    }

    fn unknown() -> FaceDetection {
        FaceDetection {
            bbox: BoundingBox::new(0.0, 10.0, 10.0, 0.0),
            identity_id: None,
            display_name: None,
            confidence: 0.0,
        }
    }

    #[derive(Default)]
    struct MemorySink {
        events: Mutex<Vec<PendingEvent>>,
        fail: bool,
    }

    impl EventSink for MemorySink {
        fn append_event(
            &self,
            display_name: &str,
            identity_id: Option<&str>,
            matched: bool,
        ) -> Result<(), StoreError> {
            if self.fail {
                return Err(StoreError::Poisoned);
            }
            self.events.lock().unwrap().push(PendingEvent {
                display_name: display_name.into(),
                identity_id: identity_id.map(String::from),
                matched,
            });
            Ok(())
        }
    }

    #[test]
    fn test_cooldown_suppresses_repeats() {
        let mut logger = EventLogger::new(Duration::from_secs(5), 2.0);
        let t0 = Instant::now();
        let alice = known("id-a", "alice");

        assert!(logger.record_at(&alice, t0));
        assert!(!logger.record_at(&alice, t0 + Duration::from_secs(1)));
        assert!(!logger.record_at(&alice, t0 + Duration::from_millis(4999)));
        assert!(logger.record_at(&alice, t0 + Duration::from_secs(5)));
        assert_eq!(logger.pending(), 2);
    }

    #[test]
    fn test_keys_are_independent() {
        let mut logger = EventLogger::new(Duration::from_secs(5), 2.0);
        let t0 = Instant::now();
        assert!(logger.record_at(&known("id-a", "alice"), t0));
        assert!(logger.record_at(&known("id-b", "bob"), t0));
        assert!(logger.record_at(&unknown(), t0));
        assert_eq!(logger.pending(), 3);
    }

    #[test]
    fn test_unknown_uses_longer_cooldown() {
        let mut logger = EventLogger::new(Duration::from_secs(5), 2.0);
        let t0 = Instant::now();
        assert!(logger.record_at(&unknown(), t0));
        assert!(!logger.record_at(&unknown(), t0 + Duration::from_secs(7)));
        assert!(logger.record_at(&unknown(), t0 + Duration::from_secs(10)));
    }

    #[test]
    fn test_oversized_unknown_cooldown_saturates() {
        let mut logger = EventLogger::new(Duration::MAX, 1e30);
        let t0 = Instant::now();
        assert!(logger.record_at(&unknown(), t0));
        assert!(!logger.record_at(&unknown(), t0 + Duration::from_secs(3600)));
    }

    #[test]
    fn test_clear_resets_history_and_queue() {
        let mut logger = EventLogger::new(Duration::from_secs(5), 2.0);
        let t0 = Instant::now();
        logger.record_at(&known("id-a", "alice"), t0);
        logger.clear();
        assert_eq!(logger.pending(), 0);
        assert!(logger.record_at(&known("id-a", "alice"), t0));
    }

    #[test]
    fn test_worker_drains_to_sink() {
        let mut logger = EventLogger::new(Duration::from_secs(5), 2.0);
        let sink = Arc::new(MemorySink::default());
        let running = Arc::new(AtomicBool::new(true));
        let handle = logger.spawn_worker(sink.clone(), running.clone());

        logger.record(&known("id-a", "alice"));
        logger.record(&unknown());

        let deadline = Instant::now() + Duration::from_secs(2);
        while sink.events.lock().unwrap().len() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        running.store(false, Ordering::Release);
        handle.join().unwrap();

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].display_name, "alice");
        assert!(events[0].matched);
        assert_eq!(events[1].display_name, UNKNOWN_LABEL);
        assert_eq!(events[1].identity_id, None);
    }

    #[test]
    fn test_worker_survives_write_errors() {
        let mut logger = EventLogger::new(Duration::ZERO, 1.0);
        let sink = Arc::new(MemorySink { fail: true, ..Default::default() });
        let running = Arc::new(AtomicBool::new(true));
        let handle = logger.spawn_worker(sink, running.clone());

        logger.record(&known("id-a", "alice"));
        logger.record(&known("id-a", "alice"));

        let deadline = Instant::now() + Duration::from_secs(2);
        while logger.pending() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(logger.pending(), 0);
        assert!(!handle.is_finished());

        running.store(false, Ordering::Release);
        handle.join().unwrap();
    }
}
