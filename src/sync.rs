//! Condition signaling between the caller threads, the worker, and the
//! capture path. The foreign engine's push-style completion protocol is
//! translated into these flags plus the output queue; everything the worker
//! waits on funnels through one condvar so a stop is observed in the same
//! wait as a chunk completion.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct Flags {
    stop: bool,
    chunk_done: bool,
}

pub(crate) struct Signals {
    flags: Mutex<Flags>,
    cond: Condvar,
}

/// Outcome of one bounded wait for chunk completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ChunkWait {
    Done,
    Stopped,
    TimedOut,
}

impl Signals {
    pub fn new() -> Self {
        Signals {
            flags: Mutex::new(Flags::default()),
            cond: Condvar::new(),
        }
    }

    pub fn raise_stop(&self) {
        self.flags.lock().stop = true;
        self.cond.notify_all();
    }

    pub fn clear_stop(&self) {
        self.flags.lock().stop = false;
    }

    pub fn stop_raised(&self) -> bool {
        self.flags.lock().stop
    }

    pub fn raise_chunk_done(&self) {
        self.flags.lock().chunk_done = true;
        self.cond.notify_all();
    }

    pub fn clear_chunk_done(&self) {
        self.flags.lock().chunk_done = false;
    }

    /// Wait up to `slice` for chunk completion or a stop. Stop wins ties so
    /// cancellation is recognized promptly.
    pub fn wait_chunk(&self, slice: Duration) -> ChunkWait {
        let mut flags = self.flags.lock();
        loop {
            if flags.stop {
                return ChunkWait::Stopped;
            }
            if flags.chunk_done {
                return ChunkWait::Done;
            }
            if self.cond.wait_for(&mut flags, slice).timed_out() {
                if flags.stop {
                    return ChunkWait::Stopped;
                }
                if flags.chunk_done {
                    return ChunkWait::Done;
                }
                return ChunkWait::TimedOut;
            }
        }
    }

    /// Wait up to `slice` for a stop; true once one is raised. Used by the
    /// capture path's pacing wait and the drain grace period.
    pub fn wait_stop(&self, slice: Duration) -> bool {
        let mut flags = self.flags.lock();
        if flags.stop {
            return true;
        }
        let _ = self.cond.wait_for(&mut flags, slice);
        flags.stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn chunk_wait_times_out() {
        let signals = Signals::new();
        let start = Instant::now();
        assert_eq!(
            signals.wait_chunk(Duration::from_millis(20)),
            ChunkWait::TimedOut
        );
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn stop_wakes_a_pending_wait() {
        let signals = Arc::new(Signals::new());
        let waiter = signals.clone();
        let handle = thread::spawn(move || waiter.wait_chunk(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(30));
        signals.raise_stop();
        assert_eq!(handle.join().unwrap(), ChunkWait::Stopped);
    }

    #[test]
    fn done_beats_timeout() {
        let signals = Signals::new();
        signals.raise_chunk_done();
        assert_eq!(
            signals.wait_chunk(Duration::from_secs(1)),
            ChunkWait::Done
        );
    }

    #[test]
    fn stop_wins_ties() {
        let signals = Signals::new();
        signals.raise_chunk_done();
        signals.raise_stop();
        assert_eq!(
            signals.wait_chunk(Duration::from_millis(5)),
            ChunkWait::Stopped
        );
    }
}
