//! Desired engine parameters, staged by the caller and applied by the worker.
//!
//! Each parameter is a small tagged value: unset, a built-in default, or an
//! explicit caller choice. The distinction matters because the engine mixes
//! preset semantics (personality) with instantaneous parameters in the same
//! setter surface; unset style parameters must never be pushed, or they stomp
//! whatever a personality preset configured internally.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};

use crate::engine::Param;

const SRC_UNSET: u8 = 0;
const SRC_DEFAULT: u8 = 1;
const SRC_EXPLICIT: u8 = 2;

/// Snapshot of one parameter's staged state.
#[cfg(test)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SettingValue {
    Unset,
    Default(i32),
    Explicit(i32),
}

/// One staged parameter. Lock-free so the hot read path during synthesis
/// never takes a lock.
pub(crate) struct SettingCell {
    value: AtomicI32,
    source: AtomicU8,
    dirty: AtomicBool,
}

impl SettingCell {
    pub const fn unset() -> Self {
        SettingCell {
            value: AtomicI32::new(0),
            source: AtomicU8::new(SRC_UNSET),
            dirty: AtomicBool::new(false),
        }
    }

    /// A built-in default that still needs one push to the engine.
    pub fn with_default(value: i32) -> Self {
        SettingCell {
            value: AtomicI32::new(value),
            source: AtomicU8::new(SRC_DEFAULT),
            dirty: AtomicBool::new(true),
        }
    }

    /// An initial value that counts as caller-chosen but is already applied.
    pub fn explicit_clean(value: i32) -> Self {
        SettingCell {
            value: AtomicI32::new(value),
            source: AtomicU8::new(SRC_EXPLICIT),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn get(&self) -> i32 {
        self.value.load(Ordering::Relaxed)
    }

    /// Caller-facing setter: the value becomes explicit and dirty.
    pub fn set(&self, value: i32) {
        self.value.store(value, Ordering::Relaxed);
        self.source.store(SRC_EXPLICIT, Ordering::Relaxed);
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn is_explicit(&self) -> bool {
        self.source.load(Ordering::Relaxed) == SRC_EXPLICIT
    }

    /// Consume the dirty flag.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::Relaxed)
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> SettingValue {
        let v = self.get();
        match self.source.load(Ordering::Relaxed) {
            SRC_DEFAULT => SettingValue::Default(v),
            SRC_EXPLICIT => SettingValue::Explicit(v),
            _ => SettingValue::Unset,
        }
    }
}

/// The full staged-parameter set for one session.
pub(crate) struct Settings {
    pub voice: SettingCell,

    pub rate: SettingCell,
    pub pitch: SettingCell,
    pub inflection_range: SettingCell,
    pub perturbation: SettingCell,
    pub vowel_factor: SettingCell,
    pub voiced_bias: SettingCell,
    pub frication_bias: SettingCell,
    pub aspiration_bias: SettingCell,

    pub personality: SettingCell,

    pub intonation_style: SettingCell,
    pub voicing_mode: SettingCell,
    pub gender: SettingCell,
    pub glottal_source: SettingCell,
    pub speaking_mode: SettingCell,
}

impl Settings {
    pub fn new(initial_voice: i32) -> Self {
        Settings {
            // The voice is applied by the session-open call itself.
            voice: SettingCell::explicit_clean(initial_voice.max(1)),

            // Engine-unit defaults, pushed once before the first utterance.
            rate: SettingCell::with_default(260),
            pitch: SettingCell::with_default(89),
            inflection_range: SettingCell::with_default(125),
            perturbation: SettingCell::with_default(0),
            vowel_factor: SettingCell::with_default(100),
            voiced_bias: SettingCell::with_default(0),
            frication_bias: SettingCell::with_default(0),
            aspiration_bias: SettingCell::with_default(0),

            // Presets and style parameters stay untouched until the caller
            // asks for them, so personalities keep their internal tuning.
            personality: SettingCell::unset(),
            intonation_style: SettingCell::unset(),
            voicing_mode: SettingCell::unset(),
            gender: SettingCell::unset(),
            glottal_source: SettingCell::unset(),
            speaking_mode: SettingCell::unset(),
        }
    }

    /// Rate plus timbre, in application order.
    pub fn numeric(&self) -> [(&SettingCell, Param); 8] {
        [
            (&self.rate, Param::Rate),
            (&self.pitch, Param::Pitch),
            (&self.inflection_range, Param::InflectionRange),
            (&self.perturbation, Param::Perturbation),
            (&self.vowel_factor, Param::VowelFactor),
            (&self.voiced_bias, Param::VoicedBias),
            (&self.frication_bias, Param::FricationBias),
            (&self.aspiration_bias, Param::AspirationBias),
        ]
    }

    /// The sliders a personality preset overrides (everything numeric except
    /// rate, which stays caller-controlled).
    pub fn timbre(&self) -> [&SettingCell; 7] {
        [
            &self.pitch,
            &self.inflection_range,
            &self.perturbation,
            &self.vowel_factor,
            &self.voiced_bias,
            &self.frication_bias,
            &self.aspiration_bias,
        ]
    }

    pub fn styles(&self) -> [(&SettingCell, Param); 5] {
        [
            (&self.intonation_style, Param::IntonationStyle),
            (&self.voicing_mode, Param::VoicingMode),
            (&self.gender, Param::Gender),
            (&self.glottal_source, Param::GlottalSource),
            (&self.speaking_mode, Param::SpeakingMode),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_starts_unset_and_clean() {
        let cell = SettingCell::unset();
        assert_eq!(cell.snapshot(), SettingValue::Unset);
        assert!(!cell.is_explicit());
        assert!(!cell.take_dirty());
    }

    #[test]
    fn default_needs_one_push() {
        let cell = SettingCell::with_default(260);
        assert_eq!(cell.snapshot(), SettingValue::Default(260));
        assert!(!cell.is_explicit());
        assert!(cell.take_dirty());
        assert!(!cell.take_dirty());
    }

    #[test]
    fn set_makes_explicit_and_dirty() {
        let cell = SettingCell::unset();
        cell.set(42);
        assert_eq!(cell.snapshot(), SettingValue::Explicit(42));
        assert!(cell.is_explicit());
        assert!(cell.take_dirty());
        // Still explicit after the push is consumed.
        assert!(cell.is_explicit());
    }

    #[test]
    fn style_cells_start_unset() {
        let settings = Settings::new(1);
        for (cell, _) in settings.styles() {
            assert!(!cell.is_explicit());
        }
        for (cell, _) in settings.numeric() {
            assert!(!cell.is_explicit());
        }
        assert!(settings.voice.is_explicit());
    }
}
