//! Session lifecycle and the public operation surface.
//!
//! One live bridge per process: the wrapped engine keeps global state and
//! does not tolerate a second instance, so the shared entry point hands out
//! refcounted handles to a single underlying session instead of a bare
//! global. The session itself owns the worker thread; dropping the last
//! handle (or the session) runs the symmetric shutdown: cancel, wake every
//! wait, queue the terminate command, join, release engine resources.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::capture::CaptureLink;
use crate::engine::Engine;
use crate::error::InitError;
use crate::format::AudioFormat;
use crate::gate::GenerationGate;
use crate::queue::{Marker, OutputQueue, ReadItem, TrimContext};
use crate::settings::Settings;
use crate::sync::Signals;
use crate::trim::TrimParams;
use crate::worker::{self, Command, Commands};

const INIT_HANDSHAKE: Duration = Duration::from_secs(5);

/// State shared between the caller threads, the worker, and the capture
/// path.
pub(crate) struct Shared {
    pub settings: Settings,
    pub gate: GenerationGate,
    pub output: OutputQueue,
    pub commands: Commands,
    pub signals: Signals,

    /// Live cancel token; commands carry a snapshot from enqueue time.
    pub cancel: AtomicU32,
    pub shutting_down: AtomicBool,

    pub format: Mutex<Option<AudioFormat>>,
    pub bytes_per_sec: AtomicU64,

    /// Milliseconds (since `epoch`) of the last captured buffer; 0 means no
    /// audio yet for the current utterance.
    pub last_audio_ms: AtomicU64,
    epoch: Instant,

    pub trim_enabled: AtomicBool,
    pub trim_aggressiveness: AtomicI32,
    pub personality_wakeup: AtomicBool,
}

impl Shared {
    fn new(initial_voice: i32) -> Self {
        Shared {
            settings: Settings::new(initial_voice),
            gate: GenerationGate::new(),
            output: OutputQueue::new(),
            commands: Commands::new(),
            signals: Signals::new(),
            cancel: AtomicU32::new(1),
            shutting_down: AtomicBool::new(false),
            format: Mutex::new(None),
            bytes_per_sec: AtomicU64::new(0),
            last_audio_ms: AtomicU64::new(0),
            epoch: Instant::now(),
            trim_enabled: AtomicBool::new(true),
            trim_aggressiveness: AtomicI32::new(50),
            personality_wakeup: AtomicBool::new(false),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn touch_audio_clock(&self) {
        self.last_audio_ms
            .store(self.now_ms().max(1), Ordering::Relaxed);
    }

    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec.load(Ordering::Relaxed)
    }
}

/// One bridge over one engine instance. All methods are safe from any
/// thread; the engine itself is only ever touched by the worker.
pub struct Session {
    shared: Arc<Shared>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Session {
    /// Bring up a session over an arbitrary engine backend. The factory runs
    /// on the worker thread, which is the only thread that will ever touch
    /// the engine.
    pub fn spawn<F>(factory: F, initial_voice: i32) -> Result<Session, InitError>
    where
        F: FnOnce(CaptureLink) -> Result<Box<dyn Engine>, InitError> + Send + 'static,
    {
        let shared = Arc::new(Shared::new(initial_voice));
        let (ready_tx, ready_rx) = mpsc::channel();

        let worker_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("softvoice-bridge".into())
            .spawn(move || worker::run(worker_shared, factory, initial_voice, ready_tx))
            .map_err(|_| InitError::WorkerSpawn)?;

        let mut session = Session {
            shared,
            worker: Some(handle),
        };
        match ready_rx.recv_timeout(INIT_HANDSHAKE) {
            Ok(Ok(())) => Ok(session),
            Ok(Err(err)) => {
                session.shutdown();
                Err(err)
            }
            Err(_) => {
                session.shutdown();
                Err(InitError::WorkerTimeout)
            }
        }
    }

    /// Queue text for synthesis. Never blocks; returns false only once the
    /// session has begun shutting down.
    pub fn speak(&self, text: &str) -> bool {
        if self.shared.shutting_down.load(Ordering::Relaxed) {
            return false;
        }
        let snapshot = self.shared.cancel.load(Ordering::Relaxed);
        self.shared.commands.push(Command::Speak {
            text: text.to_owned(),
            cancel_snapshot: snapshot,
        });
        true
    }

    /// Cancel the in-flight utterance and everything queued behind it. Safe
    /// at any time, including when idle. An utterance that was actually
    /// canceled still yields exactly one end-of-utterance marker.
    pub fn stop(&self) {
        let shared = &self.shared;

        // Close capture and drop queued audio before the cancel becomes
        // visible: anything the worker pushes once it notices the cancel
        // (its terminal marker in particular) must survive this purge.
        shared.gate.close_active();
        shared.output.clear();

        shared.cancel.fetch_add(1, Ordering::Relaxed);
        let view = shared.commands.cancel_pending();

        if !view.in_flight && view.had_pending {
            // Nothing was running, so nobody else will ever report the
            // canceled speaks; surface one terminal marker here.
            let gen = shared.gate.begin_closed();
            shared.output.push_marker(&shared.gate, gen, Marker::Done);
        }
        // When an utterance is in flight the worker notices the cancel and
        // pushes the marker itself; its generation stays deliverable.

        shared.signals.raise_stop();
    }

    /// Pull the next stream item. Audio is copied into `buf`; markers carry
    /// no payload. Returns immediately in all cases.
    pub fn read(&self, buf: &mut [u8]) -> ReadItem {
        let trim = if self.shared.trim_enabled.load(Ordering::Relaxed) {
            (*self.shared.format.lock()).map(|format| TrimContext {
                params: TrimParams::from_aggressiveness(
                    self.shared.trim_aggressiveness.load(Ordering::Relaxed),
                ),
                bytes_per_sec: self.shared.bytes_per_sec(),
                format,
            })
        } else {
            None
        };
        self.shared.output.read(&self.shared.gate, buf, trim.as_ref())
    }

    /// Output format, once the engine has opened its audio device.
    pub fn format(&self) -> Option<AudioFormat> {
        *self.shared.format.lock()
    }

    fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let shared = &self.shared;
        shared.shutting_down.store(true, Ordering::Relaxed);
        shared.cancel.fetch_add(1, Ordering::Relaxed);
        shared.gate.shut();
        shared.signals.raise_stop();
        shared.signals.raise_chunk_done();
        shared.commands.clear();
        shared.commands.push(Command::Quit);
        if worker.join().is_err() {
            tracing::error!("worker thread panicked during shutdown");
        }
        shared.output.clear();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

macro_rules! setting_accessors {
    ($($(#[$doc:meta])* $get:ident / $set:ident => $field:ident),+ $(,)?) => {
        impl Session {
            $(
                $(#[$doc])*
                pub fn $get(&self) -> i32 {
                    self.shared.settings.$field.get()
                }

                pub fn $set(&self, value: i32) {
                    self.shared.settings.$field.set(value);
                }
            )+
        }
    };
}

setting_accessors! {
    /// Voice (language) id. Takes effect at the next utterance.
    voice / set_voice => voice,
    rate / set_rate => rate,
    pitch / set_pitch => pitch,
    inflection_range / set_inflection_range => inflection_range,
    perturbation / set_perturbation => perturbation,
    vowel_factor / set_vowel_factor => vowel_factor,
    voiced_bias / set_voiced_bias => voiced_bias,
    frication_bias / set_frication_bias => frication_bias,
    aspiration_bias / set_aspiration_bias => aspiration_bias,
    /// Personality preset. Non-default values suppress stale timbre pushes.
    personality / set_personality => personality,
    intonation_style / set_intonation_style => intonation_style,
    voicing_mode / set_voicing_mode => voicing_mode,
    gender / set_gender => gender,
    glottal_source / set_glottal_source => glottal_source,
    speaking_mode / set_speaking_mode => speaking_mode,
}

impl Session {
    pub fn trim_silence(&self) -> bool {
        self.shared.trim_enabled.load(Ordering::Relaxed)
    }

    pub fn set_trim_silence(&self, enabled: bool) {
        self.shared.trim_enabled.store(enabled, Ordering::Relaxed);
    }

    /// How eagerly chunk-boundary silence is trimmed, 0..=100.
    pub fn trim_aggressiveness(&self) -> i32 {
        self.shared.trim_aggressiveness.load(Ordering::Relaxed)
    }

    pub fn set_trim_aggressiveness(&self, factor: i32) {
        self.shared
            .trim_aggressiveness
            .store(factor.clamp(0, 100), Ordering::Relaxed);
    }

    /// Whether resetting to the default personality pokes the engine's
    /// preset state first. Off by default; some engine builds need it.
    pub fn personality_wakeup(&self) -> bool {
        self.shared.personality_wakeup.load(Ordering::Relaxed)
    }

    pub fn set_personality_wakeup(&self, enabled: bool) {
        self.shared
            .personality_wakeup
            .store(enabled, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Shared (refcounted) session
// ---------------------------------------------------------------------------

struct RegistryEntry {
    session: Arc<Session>,
    refs: usize,
}

static REGISTRY: Mutex<Option<RegistryEntry>> = Mutex::new(None);

/// Refcounted handle to the process-wide session. Clones of the underlying
/// session are never created; additional acquisitions only bump the count.
/// Dropping the last handle tears the session down.
pub struct SessionRef {
    session: Arc<Session>,
}

impl std::ops::Deref for SessionRef {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl Drop for SessionRef {
    fn drop(&mut self) {
        let mut slot = REGISTRY.lock();
        if let Some(entry) = slot.as_mut() {
            if Arc::ptr_eq(&entry.session, &self.session) {
                entry.refs -= 1;
                if entry.refs == 0 {
                    // The entry's Arc drops here; ours drops right after the
                    // lock is released, which joins the worker.
                    *slot = None;
                }
            }
        }
    }
}

impl Session {
    /// Acquire the process-wide session, creating it on first use. Repeated
    /// calls return handles to the same session; the factory only runs when
    /// no session is live.
    pub fn acquire<F>(factory: F, initial_voice: i32) -> Result<SessionRef, InitError>
    where
        F: FnOnce(CaptureLink) -> Result<Box<dyn Engine>, InitError> + Send + 'static,
    {
        let mut slot = REGISTRY.lock();
        if let Some(entry) = slot.as_mut() {
            entry.refs += 1;
            return Ok(SessionRef {
                session: entry.session.clone(),
            });
        }

        let session = Arc::new(Session::spawn(factory, initial_voice)?);
        *slot = Some(RegistryEntry {
            session: session.clone(),
            refs: 1,
        });
        Ok(SessionRef { session })
    }

    /// Load the real engine from `engine_dll` and acquire the shared
    /// session over it.
    #[cfg(windows)]
    pub fn initialize(
        engine_dll: &std::path::Path,
        initial_voice: i32,
    ) -> Result<SessionRef, InitError> {
        let path = engine_dll.to_owned();
        Session::acquire(
            move |link| {
                crate::engine::softvoice::SoftVoice::load(&path, link)
                    .map(|engine| Box::new(engine) as Box<dyn Engine>)
            },
            initial_voice,
        )
    }
}
