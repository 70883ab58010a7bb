//! Frame subsampling and throughput bookkeeping.

use std::collections::VecDeque;
use std::time::Instant;

/// Frames per throughput window.
pub const FPS_WINDOW: usize = 30;

/// Decision for one captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// 1-based index of the frame within the session.
    pub sequence: u64,
    /// Whether this frame gets full detection + embedding + matching.
    pub process: bool,
}

/// Runs full inference on every `stride`-th captured frame.
#[derive(Debug, Clone)]
pub struct FrameScheduler {
    stride: u64,
    counter: u64,
}

impl FrameScheduler {
    pub fn new(stride: u32) -> Self {
        Self {
            stride: u64::from(stride.max(1)),
            counter: 0,
        }
    }

    /// Count a captured frame and decide whether to process it.
    pub fn tick(&mut self) -> Tick {
        self.counter += 1;
        Tick {
            sequence: self.counter,
            process: self.counter % self.stride == 0,
        }
    }

    pub fn frames_seen(&self) -> u64 {
        self.counter
    }

    pub fn reset(&mut self) {
        self.counter = 0;
    }
}

/// Approximate frames-per-second over a rolling window of display ticks.
///
/// Diagnostics only; nothing in the control path reads it.
#[derive(Debug, Clone)]
pub struct FpsMeter {
    stamps: VecDeque<Instant>,
    window: usize,
}

impl Default for FpsMeter {
    fn default() -> Self {
        Self::new(FPS_WINDOW)
    }
}

impl FpsMeter {
    pub fn new(window: usize) -> Self {
        Self {
            stamps: VecDeque::with_capacity(window + 1),
            window: window.max(2),
        }
    }

    /// Record a displayed frame at `now` and return the updated estimate.
    pub fn tick(&mut self, now: Instant) -> Option<f32> {
        self.stamps.push_back(now);
        while self.stamps.len() > self.window {
            self.stamps.pop_front();
        }
        self.fps()
    }

    /// Current estimate, `None` until two frames with distinct times are seen.
    pub fn fps(&self) -> Option<f32> {
        let (first, last) = (self.stamps.front()?, self.stamps.back()?);
        let elapsed = last.duration_since(*first).as_secs_f32();
        (elapsed > 0.0).then(|| (self.stamps.len() - 1) as f32 / elapsed)
    }

    pub fn reset(&mut self) {
        self.stamps.clear();
    }
}
