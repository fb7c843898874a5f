//! Generation bookkeeping for cancellation.
//!
//! Two counters gate the stream: `active` decides whether captured audio may
//! enter the queue at all, `current` decides what the consumer may still be
//! handed. Capture is gated off the moment an utterance ends or aborts, while
//! `current` stays open long enough for the terminal marker to drain.

use std::sync::atomic::{AtomicU32, Ordering};

pub(crate) struct GenerationGate {
    counter: AtomicU32,
    active: AtomicU32,
    current: AtomicU32,
}

impl GenerationGate {
    pub fn new() -> Self {
        GenerationGate {
            counter: AtomicU32::new(1),
            active: AtomicU32::new(0),
            current: AtomicU32::new(0),
        }
    }

    /// Open a fresh generation for both capture and delivery.
    pub fn begin(&self) -> u32 {
        let gen = self.counter.fetch_add(1, Ordering::Relaxed);
        self.current.store(gen, Ordering::Relaxed);
        self.active.store(gen, Ordering::Relaxed);
        gen
    }

    /// Open a generation for delivery only; capture stays gated off. Used
    /// when a terminal marker must be surfaced for work that never reached
    /// the engine.
    pub fn begin_closed(&self) -> u32 {
        let gen = self.counter.fetch_add(1, Ordering::Relaxed);
        self.current.store(gen, Ordering::Relaxed);
        gen
    }

    pub fn active(&self) -> u32 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn current(&self) -> u32 {
        self.current.load(Ordering::Relaxed)
    }

    /// Stop capturing; queued items of this generation stay deliverable.
    pub fn close_active(&self) {
        self.active.store(0, Ordering::Relaxed);
    }

    /// Close both roles. Reads drain nothing after this.
    pub fn shut(&self) {
        self.active.store(0, Ordering::Relaxed);
        self.current.store(0, Ordering::Relaxed);
    }

    /// The generation a capture call may enqueue for, if any.
    pub fn capture_target(&self) -> Option<u32> {
        let gen = self.active();
        (gen != 0 && gen == self.current()).then_some(gen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generations_increase() {
        let gate = GenerationGate::new();
        let a = gate.begin();
        let b = gate.begin();
        assert!(b > a);
        assert_eq!(gate.current(), b);
        assert_eq!(gate.capture_target(), Some(b));
    }

    #[test]
    fn close_active_keeps_delivery_open() {
        let gate = GenerationGate::new();
        let gen = gate.begin();
        gate.close_active();
        assert_eq!(gate.capture_target(), None);
        assert_eq!(gate.current(), gen);
    }

    #[test]
    fn begin_closed_never_opens_capture() {
        let gate = GenerationGate::new();
        let gen = gate.begin_closed();
        assert_eq!(gate.capture_target(), None);
        assert_eq!(gate.current(), gen);
    }

    #[test]
    fn shut_closes_everything() {
        let gate = GenerationGate::new();
        gate.begin();
        gate.shut();
        assert_eq!(gate.capture_target(), None);
        assert_eq!(gate.current(), 0);
    }
}
