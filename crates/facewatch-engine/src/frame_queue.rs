//! Bounded newest-wins handoff between the pipeline thread and the display.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

/// A bounded queue where a full queue evicts its oldest item instead of
/// blocking the producer.
pub struct LatestFrameQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Clone for LatestFrameQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T> LatestFrameQueue<T> {
    /// `capacity` is clamped to at least one slot.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self { tx, rx }
    }

    /// Push without blocking, dropping the oldest entries while full.
    pub fn publish(&self, mut item: T) {
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    let _ = self.rx.try_recv();
                    item = back;
                }
                // Both ends live in `self`.
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Take the newest item, discarding anything older. `None` if empty.
    pub fn poll(&self) -> Option<T> {
        let mut newest = None;
        while let Ok(item) = self.rx.try_recv() {
            newest = Some(item);
        }
        newest
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn clear(&self) {
        while self.rx.try_recv().is_ok() {}
    }
}
