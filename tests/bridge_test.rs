//! End-to-end tests over a scripted engine backend: command sequencing,
//! generation gating, cancellation, and the settings-application order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use softvoice_bridge::{
    AudioFormat, CaptureLink, Engine, EngineError, Param, ReadItem, Session, codes,
};

#[derive(Clone, Copy)]
struct MockOptions {
    /// Signal chunk completion right after each speak call.
    complete_chunks: bool,
    fail_speak: bool,
    /// Whether the in-place language switch entry point exists.
    language_switch: bool,
}

impl Default for MockOptions {
    fn default() -> Self {
        MockOptions {
            complete_chunks: true,
            fail_speak: false,
            language_switch: true,
        }
    }
}

/// Shared record of every call the worker made into the engine.
#[derive(Clone, Default)]
struct Calls(Arc<Mutex<Vec<String>>>);

impl Calls {
    fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    fn snapshot(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn clear(&self) {
        self.0.lock().unwrap().clear();
    }

    fn contains(&self, entry: &str) -> bool {
        self.snapshot().iter().any(|e| e == entry)
    }

    fn wait_for(&self, entry: &str, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while !self.contains(entry) {
            assert!(
                Instant::now() < deadline,
                "timed out waiting for engine call {entry:?}; saw {:?}",
                self.snapshot()
            );
            thread::sleep(Duration::from_millis(5));
        }
    }
}

struct MockEngine {
    link: CaptureLink,
    calls: Calls,
    opts: MockOptions,
}

impl Engine for MockEngine {
    fn open(&mut self, voice: i32) -> Result<(), EngineError> {
        self.calls.push(format!("open={voice}"));
        self.link.open_output(AudioFormat::pcm(11025, 1, 16));
        Ok(())
    }

    fn switch_language(&mut self, voice: i32) -> Result<(), EngineError> {
        if !self.opts.language_switch {
            return Err(EngineError::Unsupported);
        }
        self.calls.push(format!("switch_language={voice}"));
        Ok(())
    }

    fn set_param(&mut self, param: Param, value: i32) -> Result<(), EngineError> {
        self.calls.push(format!("{param:?}={value}"));
        Ok(())
    }

    fn speak(&mut self, text: &[u8]) -> Result<(), EngineError> {
        if self.opts.fail_speak {
            return Err(EngineError::CallFailed(-1));
        }
        self.calls
            .push(format!("speak={}", String::from_utf8_lossy(text)));
        // Echo the chunk text back as "audio" so tests can tell utterances
        // apart byte for byte.
        self.link.submit_audio(text);
        if self.opts.complete_chunks {
            self.link.chunk_done();
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.calls.push("abort".into());
    }

    fn close(&mut self) {
        self.calls.push("close".into());
    }
}

fn spawn_mock(opts: MockOptions) -> (Session, Calls) {
    let calls = Calls::default();
    let engine_calls = calls.clone();
    let session = Session::spawn(
        move |link| {
            Ok(Box::new(MockEngine {
                link,
                calls: engine_calls,
                opts,
            }) as Box<dyn Engine>)
        },
        1,
    )
    .expect("mock session failed to start");
    // Raw byte comparisons below; silence trimming is exercised separately.
    session.set_trim_silence(false);
    (session, calls)
}

/// Pull until the Done marker shows up, collecting audio and error codes.
fn drain_until_done(session: &Session, timeout: Duration) -> (Vec<u8>, Vec<i32>) {
    let deadline = Instant::now() + timeout;
    let mut audio = Vec::new();
    let mut errors = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match session.read(&mut buf) {
            ReadItem::Empty => {
                assert!(
                    Instant::now() < deadline,
                    "timed out waiting for done marker"
                );
                thread::sleep(Duration::from_millis(5));
            }
            ReadItem::Audio { len } => audio.extend_from_slice(&buf[..len]),
            ReadItem::Error { code } => errors.push(code),
            ReadItem::Done => return (audio, errors),
        }
    }
}

/// Keep reading for a while and assert nothing but Empty comes back.
fn assert_stream_stays_empty(session: &Session, window: Duration) {
    let deadline = Instant::now() + window;
    let mut buf = [0u8; 256];
    while Instant::now() < deadline {
        assert_eq!(session.read(&mut buf), ReadItem::Empty);
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn speaks_and_delivers_audio_then_done() {
    let (session, calls) = spawn_mock(MockOptions::default());

    assert!(session.speak("hello world"));
    let (audio, errors) = drain_until_done(&session, Duration::from_secs(2));

    assert_eq!(audio, b"hello world");
    assert!(errors.is_empty());
    assert!(calls.contains("speak=hello world"));
    assert_stream_stays_empty(&session, Duration::from_millis(100));
}

#[test]
fn initial_defaults_are_flushed_before_first_utterance() {
    let (session, calls) = spawn_mock(MockOptions::default());

    session.speak("hi");
    drain_until_done(&session, Duration::from_secs(2));

    let log = calls.snapshot();
    let speak_at = log.iter().position(|e| e == "speak=hi").unwrap();
    for expected in [
        "Rate=260",
        "Pitch=89",
        "InflectionRange=125",
        "Perturbation=0",
        "VowelFactor=100",
        "VoicedBias=0",
        "FricationBias=0",
        "AspirationBias=0",
    ] {
        let at = log
            .iter()
            .position(|e| e == expected)
            .unwrap_or_else(|| panic!("{expected} never pushed; log: {log:?}"));
        assert!(at < speak_at, "{expected} pushed after the utterance");
    }
    // Style parameters were never set and must not be pushed.
    assert!(!log.iter().any(|e| e.starts_with("Gender=")));
    assert!(!log.iter().any(|e| e.starts_with("VoicingMode=")));
    assert!(!log.iter().any(|e| e.starts_with("Personality=")));
}

#[test]
fn reports_learned_output_format() {
    let (session, _calls) = spawn_mock(MockOptions::default());
    let format = session.format().expect("format learned at open");
    assert_eq!(format.sample_rate, 11025);
    assert_eq!(format.channels, 1);
    assert_eq!(format.bits_per_sample, 16);
}

#[test]
fn empty_text_still_completes() {
    let (session, calls) = spawn_mock(MockOptions::default());
    session.speak(" \t \u{0001} ");
    let (audio, errors) = drain_until_done(&session, Duration::from_secs(2));
    assert!(audio.is_empty());
    assert!(errors.is_empty());
    assert!(!calls.snapshot().iter().any(|e| e.starts_with("speak=")));
}

#[test]
fn long_text_is_chunked_under_one_generation() {
    let (session, calls) = spawn_mock(MockOptions::default());

    let word = "abcdefghij".repeat(20); // 200 chars
    let text = format!("{word} {word} {word}");
    session.speak(&text);
    let (audio, errors) = drain_until_done(&session, Duration::from_secs(2));

    assert!(errors.is_empty());
    let speaks: Vec<String> = calls
        .snapshot()
        .into_iter()
        .filter(|e| e.starts_with("speak="))
        .collect();
    assert_eq!(speaks.len(), 2, "expected two chunk submissions: {speaks:?}");

    // The audio stream is the chunks back to back, minus the consumed
    // inter-chunk space.
    let rejoined: Vec<u8> = speaks
        .iter()
        .flat_map(|e| e.trim_start_matches("speak=").bytes())
        .collect();
    assert_eq!(audio, rejoined);
}

#[test]
fn stop_during_synthesis_yields_exactly_one_done_and_no_audio() {
    let (session, _calls) = spawn_mock(MockOptions {
        complete_chunks: false,
        ..Default::default()
    });

    session.speak("hello");
    session.stop();

    let (audio, errors) = drain_until_done(&session, Duration::from_secs(2));
    assert!(audio.is_empty(), "audio leaked across a stop: {audio:?}");
    assert!(errors.is_empty(), "stop is not an error: {errors:?}");

    // Exactly one terminal marker: nothing else may follow.
    assert_stream_stays_empty(&session, Duration::from_millis(250));
}

#[test]
fn stop_reaches_an_utterance_already_in_flight() {
    let (session, calls) = spawn_mock(MockOptions {
        complete_chunks: false,
        ..Default::default()
    });

    session.speak("hello");
    // Make sure the worker actually started the chunk before cancelling.
    calls.wait_for("speak=hello", Duration::from_secs(2));
    session.stop();

    let (audio, errors) = drain_until_done(&session, Duration::from_secs(2));
    assert!(audio.is_empty());
    assert!(errors.is_empty());
    calls.wait_for("abort", Duration::from_secs(2));
    assert_stream_stays_empty(&session, Duration::from_millis(250));
}

#[test]
fn stop_when_idle_is_harmless() {
    let (session, _calls) = spawn_mock(MockOptions::default());
    session.stop();
    assert_stream_stays_empty(&session, Duration::from_millis(100));

    // And the session still works afterwards.
    session.speak("after");
    let (audio, _) = drain_until_done(&session, Duration::from_secs(2));
    assert_eq!(audio, b"after");
}

#[test]
fn rapid_speaks_deliver_only_the_second_utterance() {
    let (session, calls) = spawn_mock(MockOptions::default());

    session.speak("first");
    session.speak("second");
    calls.wait_for("speak=second", Duration::from_secs(2));

    let (audio, errors) = drain_until_done(&session, Duration::from_secs(2));
    assert_eq!(audio, b"second");
    assert!(errors.is_empty());
    assert_stream_stays_empty(&session, Duration::from_millis(150));
}

#[test]
fn speak_failure_reports_error_then_done() {
    let (session, _calls) = spawn_mock(MockOptions {
        fail_speak: true,
        ..Default::default()
    });

    session.speak("doomed");
    let (audio, errors) = drain_until_done(&session, Duration::from_secs(2));
    assert!(audio.is_empty());
    assert_eq!(errors, vec![codes::SPEAK_FAILED]);

    // The worker went back to idle, not down.
    session.set_trim_silence(false);
    assert_stream_stays_empty(&session, Duration::from_millis(100));
}

#[test]
fn personality_preset_then_rate_keeps_that_order_and_skips_timbre() {
    let (session, calls) = spawn_mock(MockOptions::default());

    // Flush the built-in defaults first.
    session.speak("warmup");
    drain_until_done(&session, Duration::from_secs(2));
    calls.clear();

    session.set_personality(2);
    session.set_rate(777);
    session.speak("styled");
    drain_until_done(&session, Duration::from_secs(2));

    let log = calls.snapshot();
    let personality_at = log
        .iter()
        .position(|e| e == "Personality=2")
        .unwrap_or_else(|| panic!("personality never applied; log: {log:?}"));
    let rate_at = log
        .iter()
        .position(|e| e == "Rate=777")
        .unwrap_or_else(|| panic!("rate never applied; log: {log:?}"));
    assert!(personality_at < rate_at, "preset must precede rate: {log:?}");

    // The caller never touched the sliders after choosing the preset, so
    // none of them may be re-pushed over it.
    for stale in ["Pitch=", "InflectionRange=", "VowelFactor=", "VoicedBias="] {
        assert!(
            !log.iter().any(|e| e.starts_with(stale)),
            "{stale} reapplied over the preset: {log:?}"
        );
    }
}

#[test]
fn personality_reset_forces_sliders_back() {
    let (session, calls) = spawn_mock(MockOptions::default());

    session.set_personality(3);
    session.speak("preset");
    drain_until_done(&session, Duration::from_secs(2));
    calls.clear();

    session.set_personality(0);
    session.speak("plain");
    drain_until_done(&session, Duration::from_secs(2));

    let log = calls.snapshot();
    assert!(log.iter().any(|e| e == "Personality=0"));
    // Back to the base voice: every slider is pushed again.
    assert!(log.iter().any(|e| e == "Pitch=89"), "log: {log:?}");
    assert!(log.iter().any(|e| e == "Rate=260"), "log: {log:?}");
    // The wake-up quirk is off by default.
    assert!(!log.iter().any(|e| e == "Personality=1"));
}

#[test]
fn personality_wakeup_quirk_pokes_before_reset() {
    let (session, calls) = spawn_mock(MockOptions::default());
    session.set_personality_wakeup(true);

    session.set_personality(2);
    session.speak("preset");
    drain_until_done(&session, Duration::from_secs(2));
    calls.clear();

    session.set_personality(0);
    session.speak("plain");
    drain_until_done(&session, Duration::from_secs(2));

    let log = calls.snapshot();
    let poke = log.iter().position(|e| e == "Personality=1");
    let reset = log.iter().position(|e| e == "Personality=0");
    match (poke, reset) {
        (Some(p), Some(r)) => assert!(p < r, "poke must precede the reset: {log:?}"),
        _ => panic!("wake-up sequence missing: {log:?}"),
    }
}

#[test]
fn voice_switch_prefers_in_place_and_forces_numerics() {
    let (session, calls) = spawn_mock(MockOptions::default());

    session.speak("warmup");
    drain_until_done(&session, Duration::from_secs(2));
    calls.clear();

    session.set_voice(2);
    session.speak("otra");
    drain_until_done(&session, Duration::from_secs(2));

    let log = calls.snapshot();
    assert!(log.iter().any(|e| e == "switch_language=2"), "log: {log:?}");
    assert!(!log.iter().any(|e| e.starts_with("open=")));
    // A voice change re-pushes the whole numeric block.
    assert!(log.iter().any(|e| e == "Pitch=89"), "log: {log:?}");
}

#[test]
fn voice_switch_falls_back_to_reopen() {
    let (session, calls) = spawn_mock(MockOptions {
        language_switch: false,
        ..Default::default()
    });

    session.set_voice(2);
    session.speak("otra");
    drain_until_done(&session, Duration::from_secs(2));

    assert!(calls.contains("open=2"), "log: {:?}", calls.snapshot());
}

#[test]
fn style_parameters_apply_only_after_explicit_set() {
    let (session, calls) = spawn_mock(MockOptions::default());

    session.speak("one");
    drain_until_done(&session, Duration::from_secs(2));
    assert!(!calls.snapshot().iter().any(|e| e.starts_with("Gender=")));
    calls.clear();

    session.set_gender(1);
    session.speak("two");
    drain_until_done(&session, Duration::from_secs(2));
    assert!(calls.contains("Gender=1"), "log: {:?}", calls.snapshot());
}

#[test]
fn shared_session_is_refcounted() {
    static FACTORY_RUNS: AtomicUsize = AtomicUsize::new(0);

    fn acquire() -> softvoice_bridge::SessionRef {
        Session::acquire(
            |link| {
                FACTORY_RUNS.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(MockEngine {
                    link,
                    calls: Calls::default(),
                    opts: MockOptions::default(),
                }) as Box<dyn Engine>)
            },
            1,
        )
        .expect("shared session failed to start")
    }

    let first = acquire();
    let second = acquire();
    assert_eq!(FACTORY_RUNS.load(Ordering::SeqCst), 1);

    // Both handles talk to the same session.
    first.set_trim_silence(false);
    second.speak("shared");
    let (audio, _) = drain_until_done(&first, Duration::from_secs(2));
    assert_eq!(audio, b"shared");

    drop(first);
    drop(second);

    // Last release tore the session down; the next acquire rebuilds.
    let third = acquire();
    assert_eq!(FACTORY_RUNS.load(Ordering::SeqCst), 2);
    drop(third);
}
