//! The trust seam in front of the foreign synthesizer.
//!
//! Everything the worker asks of the engine goes through this trait; the
//! real implementation wraps the legacy modules and their fault-prone
//! entry points, tests substitute scripted backends. Implementations live
//! entirely on the worker thread — the engine does not tolerate being
//! touched from anywhere else.

use crate::error::EngineError;

#[cfg(windows)]
pub mod softvoice;

/// Engine parameter ids. Numeric sliders, the personality preset, and the
/// optional style attributes all share the same setter shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Param {
    Rate,
    Pitch,
    InflectionRange,
    Perturbation,
    VowelFactor,
    VoicedBias,
    FricationBias,
    AspirationBias,
    Personality,
    IntonationStyle,
    VoicingMode,
    Gender,
    GlottalSource,
    SpeakingMode,
}

pub trait Engine: Send {
    /// Open (or close and reopen) the engine session for `voice`.
    fn open(&mut self, voice: i32) -> Result<(), EngineError>;

    /// Switch language in place, without tearing the session down. Engines
    /// without that entry point report `Unsupported` and the worker falls
    /// back to a full reopen.
    fn switch_language(&mut self, voice: i32) -> Result<(), EngineError> {
        let _ = voice;
        Err(EngineError::Unsupported)
    }

    fn set_param(&mut self, param: Param, value: i32) -> Result<(), EngineError>;

    /// Submit one already-transliterated chunk. Completion arrives
    /// asynchronously through the capture link's `chunk_done`.
    fn speak(&mut self, text: &[u8]) -> Result<(), EngineError>;

    /// Abort whatever the engine is rendering right now.
    fn abort(&mut self);

    /// Service the platform's completion protocol. Called between wait
    /// slices on the worker thread; a no-op for engines that signal
    /// completion directly.
    fn pump(&mut self) {}

    /// Close the engine session.
    fn close(&mut self);
}
