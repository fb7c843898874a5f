//! The dedicated worker thread: owns the engine session, drains the command
//! queue, applies staged settings in a safe order, and sequences utterance
//! chunks against the engine's asynchronous completion protocol.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::capture::CaptureLink;
use crate::codes;
use crate::engine::{Engine, Param};
use crate::error::InitError;
use crate::queue::{DEFAULT_BYTES_PER_SEC, Marker};
use crate::session::Shared;
use crate::sync::ChunkWait;
use crate::text;

/// Upper bound on one chunk's synthesis before it is declared dead.
const CHUNK_TIMEOUT: Duration = Duration::from_secs(180);
/// Wait slice while speaking or idle; the platform message loop is serviced
/// between slices.
const WAIT_SLICE: Duration = Duration::from_millis(10);
const IDLE_SLICE: Duration = Duration::from_millis(50);
/// Drain grace: done once no audio has been captured for this long...
const DRAIN_QUIET_MS: u64 = 30;
/// ...but never wait longer than this in total.
const DRAIN_CAP: Duration = Duration::from_millis(250);
const DRAIN_SLICE: Duration = Duration::from_millis(5);
/// Settling pause for the personality wake-up poke.
const WAKEUP_PAUSE: Duration = Duration::from_millis(20);

pub(crate) enum Command {
    Speak { text: String, cancel_snapshot: u32 },
    Quit,
}

/// Pending commands plus the "utterance in flight" flag that `stop` needs to
/// decide who owes the consumer the terminal marker. The flag is only ever
/// toggled under the queue lock so the two cannot be observed out of step.
pub(crate) struct Commands {
    queue: Mutex<VecDeque<Command>>,
    cond: Condvar,
    in_flight: AtomicBool,
}

/// What a cancel observed: whether a speak was still queued, and whether the
/// worker had already taken one on.
pub(crate) struct CancelView {
    pub had_pending: bool,
    pub in_flight: bool,
}

impl Commands {
    pub fn new() -> Self {
        Commands {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn push(&self, cmd: Command) {
        self.queue.lock().push_back(cmd);
        self.cond.notify_one();
    }

    pub fn pop(&self) -> Option<Command> {
        let mut queue = self.queue.lock();
        let cmd = queue.pop_front();
        if matches!(cmd, Some(Command::Speak { .. })) {
            self.in_flight.store(true, Ordering::Relaxed);
        }
        cmd
    }

    pub fn finish_utterance(&self) {
        self.in_flight.store(false, Ordering::Relaxed);
    }

    /// Discard queued speaks (a pending shutdown survives).
    pub fn cancel_pending(&self) -> CancelView {
        let mut queue = self.queue.lock();
        let had_pending = queue.iter().any(|c| matches!(c, Command::Speak { .. }));
        queue.retain(|c| matches!(c, Command::Quit));
        CancelView {
            had_pending,
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }

    pub fn clear(&self) {
        self.queue.lock().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn wait_nonempty(&self, slice: Duration) {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            let _ = self.cond.wait_for(&mut queue, slice);
        }
    }
}

pub(crate) fn run<F>(
    shared: Arc<Shared>,
    factory: F,
    initial_voice: i32,
    ready: mpsc::Sender<Result<(), InitError>>,
) where
    F: FnOnce(CaptureLink) -> Result<Box<dyn Engine>, InitError>,
{
    let link = CaptureLink {
        shared: shared.clone(),
    };
    let mut engine = match factory(link) {
        Ok(engine) => engine,
        Err(err) => {
            tracing::error!(error = %err, "engine backend failed to load");
            let _ = ready.send(Err(err));
            return;
        }
    };

    if let Err(err) = engine.open(initial_voice) {
        tracing::error!(voice = initial_voice, error = %err, "engine session open failed");
        engine.close();
        let _ = ready.send(Err(InitError::EngineOpen {
            voice: initial_voice,
        }));
        return;
    }
    let mut current_voice = initial_voice.max(1);
    let _ = ready.send(Ok(()));

    // Pacing defaults until the first device-open call reports the real rate.
    shared
        .bytes_per_sec
        .store(DEFAULT_BYTES_PER_SEC, Ordering::Relaxed);
    shared.output.set_budget_for_rate(DEFAULT_BYTES_PER_SEC);

    loop {
        engine.pump();

        let Some(cmd) = shared.commands.pop() else {
            shared.commands.wait_nonempty(IDLE_SLICE);
            continue;
        };

        let (text, snapshot) = match cmd {
            Command::Quit => break,
            Command::Speak {
                text,
                cancel_snapshot,
            } => (text, cancel_snapshot),
        };

        if shared.cancel.load(Ordering::Relaxed) != snapshot {
            // Canceled between enqueue and pickup. The cancel saw this
            // utterance as in flight, so the terminal marker is ours to emit.
            let gen = shared.gate.begin_closed();
            finish(&shared, gen, None);
            continue;
        }

        speak_one(
            &shared,
            engine.as_mut(),
            &mut current_voice,
            &text,
            snapshot,
        );
    }

    engine.abort();
    engine.close();
    drop(engine);
    tracing::debug!("worker thread exiting");
}

/// Close the capture gate and emit the utterance's terminal markers.
fn finish(shared: &Shared, gen: u32, error: Option<i32>) {
    shared.gate.close_active();
    if let Some(code) = error {
        shared
            .output
            .push_marker(&shared.gate, gen, Marker::Error(code));
    }
    shared.output.push_marker(&shared.gate, gen, Marker::Done);
    shared.commands.finish_utterance();
}

fn speak_one(
    shared: &Shared,
    engine: &mut dyn Engine,
    current_voice: &mut i32,
    text: &str,
    snapshot: u32,
) {
    let gen = shared.gate.begin();
    shared.signals.clear_stop();
    shared.signals.clear_chunk_done();
    shared.last_audio_ms.store(0, Ordering::Relaxed);
    shared.output.clear();

    // Voice/language first; everything else assumes the right session.
    let want_voice = shared.settings.voice.get().max(1);
    let mut voice_changed = false;
    if want_voice != *current_voice {
        let switched = match engine.switch_language(want_voice) {
            Ok(()) => true,
            Err(_) => match engine.open(want_voice) {
                Ok(()) => true,
                Err(err) => {
                    tracing::error!(voice = want_voice, error = %err, "voice switch failed");
                    finish(shared, gen, Some(codes::VOICE_OPEN_FAILED));
                    return;
                }
            },
        };
        if switched {
            tracing::debug!(from = *current_voice, to = want_voice, "voice switched");
            *current_voice = want_voice;
            voice_changed = true;
        }
    }

    apply_settings(shared, engine, voice_changed);

    let prepared = text::prepare(text);
    let chunks = text::split_chunks(&prepared, text::MAX_CHUNK_BYTES);
    if chunks.is_empty() {
        finish(shared, gen, None);
        return;
    }

    let mut stopped = false;
    let mut speak_failed = false;
    for chunk in &chunks {
        if chunk.is_empty() {
            continue;
        }
        if shared.cancel.load(Ordering::Relaxed) != snapshot || shared.signals.stop_raised() {
            stopped = true;
            break;
        }

        shared.signals.clear_chunk_done();
        if let Err(err) = engine.speak(chunk) {
            tracing::warn!(error = %err, "engine speak call failed");
            speak_failed = true;
            break;
        }

        let deadline = Instant::now() + CHUNK_TIMEOUT;
        loop {
            engine.pump();
            match shared.signals.wait_chunk(WAIT_SLICE) {
                ChunkWait::Done => break,
                ChunkWait::Stopped => {
                    stopped = true;
                    break;
                }
                ChunkWait::TimedOut => {}
            }
            if shared.cancel.load(Ordering::Relaxed) != snapshot {
                stopped = true;
                break;
            }
            if Instant::now() >= deadline {
                tracing::error!("chunk synthesis timed out");
                shared
                    .output
                    .push_marker(&shared.gate, gen, Marker::Error(codes::CHUNK_TIMEOUT));
                stopped = true;
                break;
            }
        }
        if stopped {
            break;
        }
    }

    if speak_failed {
        finish(shared, gen, Some(codes::SPEAK_FAILED));
        return;
    }

    if stopped {
        engine.abort();
        if shared.cancel.load(Ordering::Relaxed) != snapshot || shared.signals.stop_raised() {
            // Externally canceled: audio still queued for this utterance
            // must never be surfaced, however the cancel interleaved with
            // the capture path.
            shared.output.purge_audio();
        }
        finish(shared, gen, None);
        return;
    }

    // Let trailing audio settle before declaring the utterance done, unless
    // more work is already waiting.
    if shared.commands.is_empty() {
        let grace_start = Instant::now();
        loop {
            let last = shared.last_audio_ms.load(Ordering::Relaxed);
            if last != 0 && shared.now_ms().saturating_sub(last) >= DRAIN_QUIET_MS {
                break;
            }
            if grace_start.elapsed() >= DRAIN_CAP {
                break;
            }
            if shared.signals.wait_stop(DRAIN_SLICE) {
                break;
            }
        }
    }

    finish(shared, gen, None);
}

/// Push staged settings to the engine, in an order that keeps presets and
/// instantaneous parameters from trampling each other:
///
/// 1. personality (a preset, able to retune timbre wholesale),
/// 2. numeric sliders — forced after a voice switch or a reset to the
///    default personality, otherwise only the dirty ones,
/// 3. the caller's rate again whenever a non-default personality was just
///    applied (rate stays independently controllable under a preset),
/// 4. style attributes, only ever the explicitly-set ones.
///
/// A freshly applied non-default personality also discards pending timbre
/// pushes: those slider values predate the preset and would undo it.
fn apply_settings(shared: &Shared, engine: &mut dyn Engine, voice_changed: bool) {
    let settings = &shared.settings;

    let personality_applied = apply_personality(shared, engine, voice_changed);
    let personality_value = settings.personality.get();
    let personality_active = settings.personality.is_explicit() && personality_value != 0;

    if personality_applied && personality_value != 0 {
        for cell in settings.timbre() {
            cell.clear_dirty();
        }
    }

    let force_numeric = (voice_changed && !personality_active)
        || (personality_applied && personality_value == 0);
    for (cell, param) in settings.numeric() {
        if force_numeric || cell.take_dirty() {
            push_param(engine, param, cell.get());
        }
    }

    if personality_applied && personality_value != 0 {
        push_param(engine, Param::Rate, settings.rate.get());
    }

    let force_style = voice_changed || personality_applied;
    for (cell, param) in settings.styles() {
        if !cell.is_explicit() {
            continue;
        }
        if force_style || cell.take_dirty() {
            push_param(engine, param, cell.get());
        }
    }
}

fn apply_personality(shared: &Shared, engine: &mut dyn Engine, force: bool) -> bool {
    let cell = &shared.settings.personality;
    if !cell.is_explicit() {
        cell.clear_dirty();
        return false;
    }
    if !(force || cell.take_dirty()) {
        return false;
    }

    let value = cell.get();
    if value == 0 && shared.personality_wakeup.load(Ordering::Relaxed) {
        // Some engine builds never leave the previous preset unless the
        // personality state is poked first.
        push_param(engine, Param::Personality, 1);
        thread::sleep(WAKEUP_PAUSE);
    }
    push_param(engine, Param::Personality, value);
    true
}

fn push_param(engine: &mut dyn Engine, param: Param, value: i32) {
    if let Err(err) = engine.set_param(param, value) {
        tracing::debug!(?param, value, error = %err, "engine setter ignored");
    }
}
