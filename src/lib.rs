//! Pull-based bridge over the legacy SoftVoice speech synthesizer.
//!
//! The wrapped engine is a callback-driven, single-instance 1990s component:
//! it pushes finished PCM through the platform's audio-output API and
//! reports progress through window messages. Consumers want the opposite
//! shape: call a function, get the next chunk of audio (or an end/error
//! marker), cancel instantly, start over.
//!
//! This crate bridges the two. A dedicated worker thread owns the engine
//! session and its completion protocol; the audio-output entry points the
//! engine calls are intercepted and redirected into a bounded,
//! generation-tagged queue; utterances are sequenced, paced against a
//! notional playback rate, and optionally relieved of chunk-boundary
//! silence. Cancellation is race-free: stale audio from an aborted
//! utterance is filtered both when captured and when read.
//!
//! The platform-independent core (queue, gating, sequencing, trimming, text
//! conditioning) works against the [`engine::Engine`] trait; the real
//! engine loader and the audio-output interception are Windows-only.

mod capture;
mod error;
mod format;
mod gate;
mod queue;
mod session;
mod settings;
mod sync;
mod text;
mod trim;
mod worker;

pub mod engine;

#[cfg(windows)]
mod hooks;
#[cfg(windows)]
mod win_types;

pub use capture::CaptureLink;
pub use engine::{Engine, Param};
pub use error::{EngineError, InitError};
pub use format::AudioFormat;
pub use queue::ReadItem;
pub use session::{Session, SessionRef};

/// Codes carried by [`ReadItem::Error`] markers.
pub mod codes {
    /// The engine's speak entry point returned failure.
    pub const SPEAK_FAILED: i32 = 2001;
    /// A chunk exceeded the synthesis timeout.
    pub const CHUNK_TIMEOUT: i32 = 2002;
    /// The requested voice could not be opened.
    pub const VOICE_OPEN_FAILED: i32 = 2003;
}
