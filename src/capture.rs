//! The seam between the engine's push-style audio output and the bridge.
//!
//! Whatever intercepts the engine's device calls (the real hook layer on
//! Windows, or an engine backend directly) feeds captured data through a
//! `CaptureLink`. The link applies the generation gate, the queue budget,
//! and the pacing wait, and translates completion callbacks into the
//! worker's condition signals.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::format::AudioFormat;
use crate::queue::DEFAULT_BYTES_PER_SEC;
use crate::session::Shared;

const PACING_SLICE_MS: u64 = 5;

/// Handle through which captured engine output enters the bridge.
#[derive(Clone)]
pub struct CaptureLink {
    pub(crate) shared: Arc<Shared>,
}

impl CaptureLink {
    /// Record the output format from the engine's device-open call and
    /// resize the queue budget to match its data rate.
    pub fn open_output(&self, format: AudioFormat) {
        let bps = match format.bytes_per_sec() {
            0 => DEFAULT_BYTES_PER_SEC,
            b => b,
        };
        tracing::debug!(
            sample_rate = format.sample_rate,
            channels = format.channels,
            bits = format.bits_per_sample,
            "engine opened audio output"
        );
        *self.shared.format.lock() = Some(format);
        self.shared.bytes_per_sec.store(bps, Ordering::Relaxed);
        self.shared.output.set_budget_for_rate(bps);
    }

    /// Capture one buffer of engine output.
    ///
    /// Discards silently when no generation is live (a canceled utterance
    /// must still look fully played to the engine). When the queue was
    /// already at budget, blocks the engine's calling thread for roughly the
    /// buffer's playback duration, in short slices so a stop or generation
    /// change interrupts the wait promptly.
    pub fn submit_audio(&self, data: &[u8]) {
        let shared = &self.shared;
        let Some(gen) = shared.gate.capture_target() else {
            return;
        };
        if data.is_empty() {
            return;
        }

        shared.touch_audio_clock();
        let Some(flags) = shared.output.push_audio(&shared.gate, gen, data) else {
            return;
        };

        if !flags.was_empty && flags.was_full {
            let bps = shared.bytes_per_sec().max(1);
            let mut wait_ms = data.len() as u64 * 1000 / bps;
            while wait_ms > 0 {
                if shared.gate.active() != gen {
                    break;
                }
                let slice = wait_ms.min(PACING_SLICE_MS);
                if shared.signals.wait_stop(Duration::from_millis(slice)) {
                    break;
                }
                wait_ms -= slice;
            }
        }
    }

    /// The engine reported that the current chunk began rendering.
    pub fn chunk_started(&self) {
        tracing::trace!("engine chunk started");
    }

    /// The engine reported the current chunk finished (or failed
    /// asynchronously, which ends the chunk all the same).
    pub fn chunk_done(&self) {
        self.shared.signals.raise_chunk_done();
    }
}
