//! Bounded, generation-tagged output queue.
//!
//! Captured PCM and lifecycle markers flow through here from the capture
//! path to the consumer's pull calls. The queue carries a byte budget sized
//! for about a minute of audio; overflow evicts the oldest audio (markers
//! are never evicted) and, when nothing is left to evict, drops the new
//! buffer instead of growing. Silence trimming happens lazily at read time,
//! once per generation per edge.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::format::AudioFormat;
use crate::gate::GenerationGate;
use crate::trim::{self, TrimParams};

pub(crate) const DEFAULT_BYTES_PER_SEC: u64 = 22050;
const BUDGET_SECONDS: u64 = 60;
const BUDGET_FLOOR: u64 = 256 * 1024;
const BUDGET_CEILING: u64 = 8 * 1024 * 1024;
const MAX_QUEUE_ITEMS: usize = 8192;

/// One pull result handed to the consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadItem {
    /// Nothing ready; poll again later.
    Empty,
    /// `len` bytes of audio were copied into the caller's buffer.
    Audio { len: usize },
    /// The current utterance finished (normally or after an abort).
    Done,
    /// The current utterance failed; `code` identifies the failure.
    Error { code: i32 },
}

pub(crate) enum Marker {
    Done,
    Error(i32),
}

enum Body {
    Audio { data: Vec<u8>, offset: usize },
    Done,
    Error(i32),
}

struct Item {
    gen: u32,
    body: Body,
}

impl Item {
    fn unread_audio(&self) -> usize {
        match &self.body {
            Body::Audio { data, offset } => data.len().saturating_sub(*offset),
            _ => 0,
        }
    }
}

/// Queue state observed before an insert; drives the pacing decision.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PushFlags {
    pub was_empty: bool,
    pub was_full: bool,
}

/// Everything read-time trimming needs, captured outside the queue lock.
pub(crate) struct TrimContext {
    pub params: TrimParams,
    pub format: AudioFormat,
    pub bytes_per_sec: u64,
}

struct Inner {
    items: VecDeque<Item>,
    audio_bytes: usize,
    budget: usize,
    lead_trim_gen: u32,
    tail_trim_gen: u32,
}

pub(crate) struct OutputQueue {
    inner: Mutex<Inner>,
}

fn budget_for(bytes_per_sec: u64) -> usize {
    let bps = if bytes_per_sec == 0 {
        DEFAULT_BYTES_PER_SEC
    } else {
        bytes_per_sec
    };
    (bps * BUDGET_SECONDS).clamp(BUDGET_FLOOR, BUDGET_CEILING) as usize
}

impl OutputQueue {
    pub fn new() -> Self {
        OutputQueue {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                audio_bytes: 0,
                budget: budget_for(DEFAULT_BYTES_PER_SEC),
                lead_trim_gen: 0,
                tail_trim_gen: 0,
            }),
        }
    }

    /// Resize the byte budget for a newly learned output format.
    pub fn set_budget_for_rate(&self, bytes_per_sec: u64) {
        self.inner.lock().budget = budget_for(bytes_per_sec);
    }

    pub fn clear(&self) {
        self.inner.lock().clear_all();
    }

    /// Drop all queued audio but keep markers deliverable.
    pub fn purge_audio(&self) {
        let mut q = self.inner.lock();
        q.items.retain(|it| !matches!(it.body, Body::Audio { .. }));
        q.audio_bytes = 0;
    }

    /// Insert captured audio for `gen`. Returns `None` when the generation is
    /// no longer deliverable (the buffer is discarded); otherwise the queue
    /// state from before the insert, which the capture path uses for pacing
    /// even when the buffer itself had to be dropped.
    pub fn push_audio(&self, gate: &GenerationGate, gen: u32, data: &[u8]) -> Option<PushFlags> {
        let mut q = self.inner.lock();
        let cur = gate.current();
        if cur == 0 || gen != cur {
            return None;
        }

        let flags = PushFlags {
            was_empty: q.audio_bytes == 0,
            was_full: q.audio_bytes >= q.budget,
        };

        while q.audio_bytes + data.len() > q.budget || q.items.len() >= MAX_QUEUE_ITEMS {
            if !q.drop_oldest_audio() {
                tracing::trace!(len = data.len(), "output queue full; dropping capture");
                return Some(flags);
            }
        }

        q.audio_bytes += data.len();
        q.items.push_back(Item {
            gen,
            body: Body::Audio {
                data: data.to_vec(),
                offset: 0,
            },
        });
        Some(flags)
    }

    /// Append a lifecycle marker, subject to the same staleness filter.
    pub fn push_marker(&self, gate: &GenerationGate, gen: u32, marker: Marker) {
        let mut q = self.inner.lock();
        let cur = gate.current();
        if cur == 0 || gen != cur {
            return;
        }
        let body = match marker {
            Marker::Done => Body::Done,
            Marker::Error(code) => Body::Error(code),
        };
        q.items.push_back(Item { gen, body });
    }

    /// Drain one item into `buf`. Stale items are discarded first; trimming
    /// (when enabled) runs before anything is copied out.
    pub fn read(
        &self,
        gate: &GenerationGate,
        buf: &mut [u8],
        trim: Option<&TrimContext>,
    ) -> ReadItem {
        let mut q = self.inner.lock();

        let cur = gate.current();
        if cur == 0 {
            q.clear_all();
            return ReadItem::Empty;
        }

        while let Some(front) = q.items.front() {
            if front.gen == cur {
                break;
            }
            q.drop_front();
        }
        if q.items.is_empty() {
            return ReadItem::Empty;
        }

        if let Some(ctx) = trim {
            q.apply_trim(cur, ctx);
            if q.items.is_empty() {
                return ReadItem::Empty;
            }
        }

        let inner = &mut *q;
        let Some(front) = inner.items.front_mut() else {
            return ReadItem::Empty;
        };
        match &mut front.body {
            Body::Audio { data, offset } => {
                let remaining = data.len().saturating_sub(*offset);
                let n = remaining.min(buf.len());
                if n > 0 {
                    buf[..n].copy_from_slice(&data[*offset..*offset + n]);
                    *offset += n;
                    inner.audio_bytes = inner.audio_bytes.saturating_sub(n);
                }
                let exhausted = *offset >= data.len();
                if exhausted {
                    inner.items.pop_front();
                }
                ReadItem::Audio { len: n }
            }
            Body::Done => {
                inner.items.pop_front();
                ReadItem::Done
            }
            Body::Error(code) => {
                let code = *code;
                inner.items.pop_front();
                ReadItem::Error { code }
            }
        }
    }

    #[cfg(test)]
    fn set_budget_bytes(&self, budget: usize) {
        self.inner.lock().budget = budget;
    }

    #[cfg(test)]
    fn queued_audio_bytes(&self) -> usize {
        self.inner.lock().audio_bytes
    }
}

impl Inner {
    fn clear_all(&mut self) {
        self.items.clear();
        self.audio_bytes = 0;
    }

    fn drop_front(&mut self) {
        if let Some(item) = self.items.pop_front() {
            self.audio_bytes = self.audio_bytes.saturating_sub(item.unread_audio());
        }
    }

    fn drop_oldest_audio(&mut self) -> bool {
        let Some(pos) = self
            .items
            .iter()
            .position(|it| matches!(it.body, Body::Audio { .. }))
        else {
            return false;
        };
        let unread = self.items[pos].unread_audio();
        self.audio_bytes = self.audio_bytes.saturating_sub(unread);
        self.items.remove(pos);
        true
    }

    fn apply_trim(&mut self, cur: u32, ctx: &TrimContext) {
        // Leading edge, once per generation, only before any of the first
        // audio item has been handed out.
        if self.lead_trim_gen != cur {
            let Inner {
                items, audio_bytes, ..
            } = self;
            if let Some(item) = items
                .iter_mut()
                .find(|it| matches!(it.body, Body::Audio { .. }))
            {
                if let Body::Audio { data, offset } = &mut item.body {
                    if *offset == 0 {
                        let mut cut = trim::leading_silence(
                            data,
                            &ctx.format,
                            ctx.bytes_per_sec,
                            &ctx.params,
                        );
                        cut = cut.min(data.len());
                        *offset += cut;
                        *audio_bytes = audio_bytes.saturating_sub(cut);
                    }
                }
            }
            self.lead_trim_gen = cur;

            // Anything the trim emptied can go right away.
            while matches!(
                self.items.front(),
                Some(item) if matches!(item.body, Body::Audio { .. }) && item.unread_audio() == 0
            ) {
                self.items.pop_front();
            }
        }

        // Trailing edge, once per generation, deferred until the utterance's
        // Done marker is visible so audio still in flight is never cut.
        if self.tail_trim_gen != cur {
            let has_done = self.items.iter().any(|it| matches!(it.body, Body::Done));
            if has_done {
                let Inner {
                    items, audio_bytes, ..
                } = self;
                if let Some(item) = items
                    .iter_mut()
                    .rev()
                    .find(|it| matches!(it.body, Body::Audio { .. }))
                {
                    if let Body::Audio { data, offset } = &mut item.body {
                        let cut = trim::trailing_silence(
                            data,
                            *offset,
                            &ctx.format,
                            ctx.bytes_per_sec,
                            &ctx.params,
                        );
                        let cut = cut.min(data.len().saturating_sub(*offset));
                        if cut > 0 {
                            data.truncate(data.len() - cut);
                            *audio_bytes = audio_bytes.saturating_sub(cut);
                        }
                    }
                }
                self.tail_trim_gen = cur;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trim::TrimParams;

    fn live_gate() -> (GenerationGate, u32) {
        let gate = GenerationGate::new();
        let gen = gate.begin();
        (gate, gen)
    }

    fn drain_all(queue: &OutputQueue, gate: &GenerationGate) -> (Vec<u8>, Vec<ReadItem>) {
        let mut audio = Vec::new();
        let mut markers = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match queue.read(gate, &mut buf, None) {
                ReadItem::Empty => break,
                ReadItem::Audio { len } => audio.extend_from_slice(&buf[..len]),
                other => markers.push(other),
            }
        }
        (audio, markers)
    }

    #[test]
    fn delivers_in_order_with_partial_reads() {
        let (gate, gen) = live_gate();
        let queue = OutputQueue::new();
        queue.push_audio(&gate, gen, &[1, 2, 3, 4, 5]).unwrap();
        queue.push_marker(&gate, gen, Marker::Done);

        let mut buf = [0u8; 2];
        assert_eq!(queue.read(&gate, &mut buf, None), ReadItem::Audio { len: 2 });
        assert_eq!(&buf, &[1, 2]);
        assert_eq!(queue.read(&gate, &mut buf, None), ReadItem::Audio { len: 2 });
        assert_eq!(&buf, &[3, 4]);
        assert_eq!(queue.read(&gate, &mut buf, None), ReadItem::Audio { len: 1 });
        assert_eq!(buf[0], 5);
        assert_eq!(queue.read(&gate, &mut buf, None), ReadItem::Done);
        assert_eq!(queue.read(&gate, &mut buf, None), ReadItem::Empty);
    }

    #[test]
    fn stale_generation_is_discarded_at_read() {
        let gate = GenerationGate::new();
        let old = gate.begin();
        let queue = OutputQueue::new();
        queue.push_audio(&gate, old, &[9; 8]).unwrap();
        queue.push_marker(&gate, old, Marker::Done);

        let fresh = gate.begin();
        queue.push_audio(&gate, fresh, &[1; 4]).unwrap();
        queue.push_marker(&gate, fresh, Marker::Done);

        let (audio, markers) = drain_all(&queue, &gate);
        assert_eq!(audio, vec![1; 4]);
        assert_eq!(markers, vec![ReadItem::Done]);
        assert_eq!(queue.queued_audio_bytes(), 0);
    }

    #[test]
    fn stale_push_is_rejected() {
        let gate = GenerationGate::new();
        let old = gate.begin();
        gate.begin();
        let queue = OutputQueue::new();
        assert!(queue.push_audio(&gate, old, &[1, 2, 3]).is_none());
        assert_eq!(queue.queued_audio_bytes(), 0);
    }

    #[test]
    fn closed_gate_clears_on_read() {
        let (gate, gen) = live_gate();
        let queue = OutputQueue::new();
        queue.push_audio(&gate, gen, &[1; 16]).unwrap();
        gate.shut();
        let mut buf = [0u8; 8];
        assert_eq!(queue.read(&gate, &mut buf, None), ReadItem::Empty);
        assert_eq!(queue.queued_audio_bytes(), 0);
    }

    #[test]
    fn overflow_evicts_oldest_audio_never_markers() {
        let (gate, gen) = live_gate();
        let queue = OutputQueue::new();
        queue.set_budget_bytes(10);
        queue.push_audio(&gate, gen, &[1; 4]).unwrap();
        queue.push_marker(&gate, gen, Marker::Error(7));
        queue.push_audio(&gate, gen, &[2; 4]).unwrap();
        // 8 + 4 > 10: the oldest audio item must go.
        let flags = queue.push_audio(&gate, gen, &[3; 4]).unwrap();
        assert!(!flags.was_empty);
        assert!(queue.queued_audio_bytes() <= 10);

        queue.push_marker(&gate, gen, Marker::Done);
        let (audio, markers) = drain_all(&queue, &gate);
        assert_eq!(audio, vec![2, 2, 2, 2, 3, 3, 3, 3]);
        assert_eq!(markers, vec![ReadItem::Error { code: 7 }, ReadItem::Done]);
    }

    #[test]
    fn oversized_buffer_is_dropped_when_nothing_evictable() {
        let (gate, gen) = live_gate();
        let queue = OutputQueue::new();
        queue.set_budget_bytes(10);
        let flags = queue.push_audio(&gate, gen, &[1; 64]).unwrap();
        assert!(flags.was_empty);
        assert_eq!(queue.queued_audio_bytes(), 0);
    }

    #[test]
    fn push_flags_report_pre_insert_state() {
        let (gate, gen) = live_gate();
        let queue = OutputQueue::new();
        queue.set_budget_bytes(8);
        let first = queue.push_audio(&gate, gen, &[1; 8]).unwrap();
        assert!(first.was_empty);
        assert!(!first.was_full);
        let second = queue.push_audio(&gate, gen, &[2; 4]).unwrap();
        assert!(!second.was_empty);
        assert!(second.was_full);
    }

    fn trim_ctx(aggressiveness: i32) -> TrimContext {
        let format = AudioFormat::pcm(1000, 1, 16);
        TrimContext {
            params: TrimParams::from_aggressiveness(aggressiveness),
            bytes_per_sec: format.bytes_per_sec(),
            format,
        }
    }

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn trim_is_idempotent_per_generation() {
        let (gate, gen) = live_gate();
        let queue = OutputQueue::new();

        // Long silent lead and tail around a loud middle.
        let mut data = pcm(&[0; 400]);
        data.extend(pcm(&[8000; 100]));
        data.extend(pcm(&[0; 400]));
        queue.push_audio(&gate, gen, &data).unwrap();
        queue.push_marker(&gate, gen, Marker::Done);

        let ctx = trim_ctx(100);
        let mut delivered = Vec::new();
        let mut buf = [0u8; 32];
        loop {
            match queue.read(&gate, &mut buf, Some(&ctx)) {
                ReadItem::Audio { len } => delivered.extend_from_slice(&buf[..len]),
                ReadItem::Done => break,
                ReadItem::Empty => panic!("done marker lost"),
                ReadItem::Error { .. } => panic!("unexpected error"),
            }
        }

        // Both edges trimmed, middle intact, and the repeated reads (each of
        // which re-enters the trim path) never shrank it further.
        assert!(delivered.len() < data.len());
        assert!(delivered.len() >= 100 * 2);
        let loud = delivered
            .chunks_exact(2)
            .filter(|c| i16::from_le_bytes([c[0], c[1]]) == 8000)
            .count();
        assert_eq!(loud, 100);
    }

    #[test]
    fn tail_trim_waits_for_done_marker() {
        let (gate, gen) = live_gate();
        let queue = OutputQueue::new();
        let mut data = pcm(&[8000; 50]);
        data.extend(pcm(&[0; 200]));
        queue.push_audio(&gate, gen, &data).unwrap();

        let ctx = trim_ctx(100);
        let mut buf = [0u8; 4096];

        // No Done marker yet: the silent tail may still be followed by more
        // audio, so it must come through untouched.
        let ReadItem::Audio { len } = queue.read(&gate, &mut buf, Some(&ctx)) else {
            panic!("expected audio");
        };
        assert_eq!(len, data.len());
    }

    #[test]
    fn lead_trim_skips_partially_read_audio() {
        let (gate, gen) = live_gate();
        let queue = OutputQueue::new();
        let data = pcm(&[0; 300]);
        queue.push_audio(&gate, gen, &data).unwrap();

        // Hand out a little before trimming is ever enabled.
        let mut buf = [0u8; 10];
        assert_eq!(queue.read(&gate, &mut buf, None), ReadItem::Audio { len: 10 });

        let ctx = trim_ctx(100);
        let ReadItem::Audio { len } = queue.read(&gate, &mut buf, Some(&ctx)) else {
            panic!("expected audio");
        };
        // The already-started item is left alone.
        assert_eq!(len, 10);
    }
}
