//! The real engine backend: loads the legacy SoftVoice modules, resolves
//! their exports, runs their window-message completion protocol, and keeps
//! every call into them behind a fault-isolating boundary.
//!
//! Everything here runs on the worker thread. The engine's sync protocol
//! posts small integer status codes to a window it was given at session
//! open; a message-only window owned by that same thread receives them.

use std::path::Path;
use std::sync::Once;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::RwLock;
use windows::Win32::Foundation::{HMODULE, HWND, LPARAM, LRESULT, WPARAM};
use windows::Win32::System::LibraryLoader::{
    FreeLibrary, GetModuleHandleW, GetProcAddress, LoadLibraryW,
};
use windows::Win32::System::Threading::{
    GetCurrentThread, SetThreadPriority, THREAD_PRIORITY_ABOVE_NORMAL,
};
use windows::Win32::UI::WindowsAndMessaging::{
    CreateWindowExW, DefWindowProcW, DestroyWindow, DispatchMessageW, HWND_MESSAGE, MSG,
    PM_REMOVE, PeekMessageW, RegisterClassExW, RegisterWindowMessageW, TranslateMessage,
    WINDOW_EX_STYLE, WINDOW_STYLE, WM_USER, WNDCLASSEXW,
};
use windows::core::{PCSTR, PCWSTR, w};

use crate::capture::CaptureLink;
use crate::engine::{Engine, Param};
use crate::error::{EngineError, InitError};
use crate::hooks;
use crate::win_types::{SendHmodule, SendHwnd};

// Status codes the engine posts in wParam on its sync message.
const STATUS_STARTED: usize = 1000;
const STATUS_DONE: usize = 1001;
const STATUS_ERROR: usize = 1002;

const WINDOW_CLASS: PCWSTR = w!("SoftVoiceBridgeWnd");

// In 32-bit builds the exports carry stdcall decoration; resolve both forms.
type OpenSpeechFn = unsafe extern "system" fn(*mut i32, HWND, i32, i32, i32) -> i32;
type HandleFn = unsafe extern "system" fn(i32) -> i32;
type SetIntFn = unsafe extern "system" fn(i32, i32) -> i32;
type SpeakFn =
    unsafe extern "system" fn(i32, *const u8, i32, i32, HWND, i32, i32, i32) -> i32;

struct Exports {
    open_speech: OpenSpeechFn,
    close_speech: HandleFn,
    abort: HandleFn,
    speak: SpeakFn,

    set_language: Option<SetIntFn>,

    set_rate: Option<SetIntFn>,
    set_pitch: Option<SetIntFn>,
    set_f0_range: Option<SetIntFn>,
    set_f0_perturb: Option<SetIntFn>,
    set_vowel_factor: Option<SetIntFn>,
    set_av_bias: Option<SetIntFn>,
    set_af_bias: Option<SetIntFn>,
    set_ah_bias: Option<SetIntFn>,
    set_personality: Option<SetIntFn>,
    set_f0_style: Option<SetIntFn>,
    set_voicing_mode: Option<SetIntFn>,
    set_gender: Option<SetIntFn>,
    set_glottal_source: Option<SetIntFn>,
    set_speaking_mode: Option<SetIntFn>,
}

fn raw_export(
    module: HMODULE,
    plain: &'static [u8],
    decorated: &'static [u8],
) -> Option<unsafe extern "system" fn() -> isize> {
    unsafe {
        GetProcAddress(module, PCSTR(plain.as_ptr()))
            .or_else(|| GetProcAddress(module, PCSTR(decorated.as_ptr())))
    }
}

macro_rules! set_int_export {
    ($module:expr, $plain:literal, $decorated:literal) => {
        raw_export(
            $module,
            concat!($plain, "\0").as_bytes(),
            concat!($decorated, "\0").as_bytes(),
        )
        .map(|f| unsafe { std::mem::transmute::<_, SetIntFn>(f) })
    };
}

macro_rules! required_export {
    ($module:expr, $ty:ty, $plain:literal, $decorated:literal) => {
        raw_export(
            $module,
            concat!($plain, "\0").as_bytes(),
            concat!($decorated, "\0").as_bytes(),
        )
        .map(|f| unsafe { std::mem::transmute::<_, $ty>(f) })
        .ok_or(InitError::MissingExport($plain))?
    };
}

impl Exports {
    fn resolve(module: HMODULE) -> Result<Exports, InitError> {
        Ok(Exports {
            open_speech: required_export!(module, OpenSpeechFn, "SVOpenSpeech", "_SVOpenSpeech@20"),
            close_speech: required_export!(module, HandleFn, "SVCloseSpeech", "_SVCloseSpeech@4"),
            abort: required_export!(module, HandleFn, "SVAbort", "_SVAbort@4"),
            speak: required_export!(module, SpeakFn, "SVTTS", "_SVTTS@32"),

            set_language: set_int_export!(module, "SVSetLanguage", "_SVSetLanguage@8"),

            set_rate: set_int_export!(module, "SVSetRate", "_SVSetRate@8"),
            set_pitch: set_int_export!(module, "SVSetPitch", "_SVSetPitch@8"),
            set_f0_range: set_int_export!(module, "SVSetF0Range", "_SVSetF0Range@8"),
            set_f0_perturb: set_int_export!(module, "SVSetF0Perturb", "_SVSetF0Perturb@8"),
            set_vowel_factor: set_int_export!(module, "SVSetVowelFactor", "_SVSetVowelFactor@8"),
            set_av_bias: set_int_export!(module, "SVSetAVBias", "_SVSetAVBias@8"),
            set_af_bias: set_int_export!(module, "SVSetAFBias", "_SVSetAFBias@8"),
            set_ah_bias: set_int_export!(module, "SVSetAHBias", "_SVSetAHBias@8"),
            set_personality: set_int_export!(module, "SVSetPersonality", "_SVSetPersonality@8"),
            set_f0_style: set_int_export!(module, "SVSetF0Style", "_SVSetF0Style@8"),
            set_voicing_mode: set_int_export!(module, "SVSetVoicingMode", "_SVSetVoicingMode@8"),
            set_gender: set_int_export!(module, "SVSetGender", "_SVSetGender@8"),
            set_glottal_source: set_int_export!(
                module,
                "SVSetGlottalSource",
                "_SVSetGlottalSource@8"
            ),
            set_speaking_mode: set_int_export!(
                module,
                "SVSetSpeakingMode",
                "_SVSetSpeakingMode@8"
            ),
        })
    }

    fn setter(&self, param: Param) -> Option<SetIntFn> {
        match param {
            Param::Rate => self.set_rate,
            Param::Pitch => self.set_pitch,
            Param::InflectionRange => self.set_f0_range,
            Param::Perturbation => self.set_f0_perturb,
            Param::VowelFactor => self.set_vowel_factor,
            Param::VoicedBias => self.set_av_bias,
            Param::FricationBias => self.set_af_bias,
            Param::AspirationBias => self.set_ah_bias,
            Param::Personality => self.set_personality,
            Param::IntonationStyle => self.set_f0_style,
            Param::VoicingMode => self.set_voicing_mode,
            Param::Gender => self.set_gender,
            Param::GlottalSource => self.set_glottal_source,
            Param::SpeakingMode => self.set_speaking_mode,
        }
    }
}

/// Convert faults inside the foreign engine into soft errors. This is the
/// single trust seam: nothing the engine does at runtime may take the host
/// process down.
fn guarded<T>(f: impl FnMut() -> T) -> Result<T, EngineError> {
    microseh::try_seh(f).map_err(|err| {
        tracing::error!(exception = ?err, "engine call faulted");
        EngineError::Faulted
    })
}

// ---------------------------------------------------------------------------
// Sync window
// ---------------------------------------------------------------------------

struct WndTarget {
    hwnd: isize,
    link: CaptureLink,
    /// RegisterWindowMessage id for the engine's sync channel (0 if the
    /// registration failed).
    registered_msg: u32,
    /// The message id actually observed from the engine, learned from the
    /// first plausible delivery.
    learned_msg: AtomicU32,
}

static WND_TARGET: RwLock<Option<WndTarget>> = RwLock::new(None);

/// Engine status arrives as wParam codes on the engine's sync message.
/// Unrelated messages (WM_TIMER in particular) can carry the same wParam
/// values and would fire premature completions, so only the sync message id
/// is trusted once known.
unsafe extern "system" fn wnd_proc(hwnd: HWND, msg: u32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
    let guard = WND_TARGET.read();
    let Some(target) = guard.as_ref().filter(|t| t.hwnd == hwnd.0 as isize) else {
        return unsafe { DefWindowProcW(hwnd, msg, wparam, lparam) };
    };

    let code = wparam.0;
    if code != STATUS_STARTED && code != STATUS_DONE && code != STATUS_ERROR {
        return unsafe { DefWindowProcW(hwnd, msg, wparam, lparam) };
    }

    let learned = target.learned_msg.load(Ordering::Relaxed);
    if learned != 0 {
        if msg != learned {
            return unsafe { DefWindowProcW(hwnd, msg, wparam, lparam) };
        }
    } else if target.registered_msg != 0 && msg == target.registered_msg {
        target.learned_msg.store(msg, Ordering::Relaxed);
    } else if msg < WM_USER {
        // Below WM_USER lives the WM_TIMER/WM_COMMAND space; never learn
        // from there.
        return unsafe { DefWindowProcW(hwnd, msg, wparam, lparam) };
    } else {
        target.learned_msg.store(msg, Ordering::Relaxed);
    }

    match code {
        STATUS_STARTED => target.link.chunk_started(),
        // An asynchronous error still ends the chunk; the worker decides
        // error reporting from the speak call's own result.
        _ => target.link.chunk_done(),
    }
    LRESULT(0)
}

static REGISTER_CLASS: Once = Once::new();
static CLASS_REGISTERED: AtomicBool = AtomicBool::new(false);

fn create_sync_window() -> Result<HWND, InitError> {
    unsafe {
        REGISTER_CLASS.call_once(|| {
            let instance = GetModuleHandleW(None).unwrap_or_default();
            let class = WNDCLASSEXW {
                cbSize: std::mem::size_of::<WNDCLASSEXW>() as u32,
                lpfnWndProc: Some(wnd_proc),
                hInstance: instance.into(),
                lpszClassName: WINDOW_CLASS,
                ..Default::default()
            };
            if RegisterClassExW(&class) != 0 {
                CLASS_REGISTERED.store(true, Ordering::Relaxed);
            }
        });
        if !CLASS_REGISTERED.load(Ordering::Relaxed) {
            return Err(InitError::MessageWindow);
        }

        let instance = GetModuleHandleW(None).map_err(|_| InitError::MessageWindow)?;
        CreateWindowExW(
            WINDOW_EX_STYLE(0),
            WINDOW_CLASS,
            w!(""),
            WINDOW_STYLE(0),
            0,
            0,
            0,
            0,
            Some(HWND_MESSAGE),
            None,
            Some(instance.into()),
            None,
        )
        .map_err(|_| InitError::MessageWindow)
    }
}

// ---------------------------------------------------------------------------
// Engine backend
// ---------------------------------------------------------------------------

pub struct SoftVoice {
    base: SendHmodule,
    english: Option<SendHmodule>,
    spanish: Option<SendHmodule>,
    exports: Exports,
    hwnd: SendHwnd,
    handle: i32,
}

impl SoftVoice {
    /// Load the engine modules, hook the audio output, and stand up the sync
    /// window. Must run on the worker thread; the window and the engine
    /// session are bound to it.
    pub fn load(dll: &Path, link: CaptureLink) -> Result<SoftVoice, InitError> {
        unsafe {
            let _ = SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_ABOVE_NORMAL);
        }

        let wide = to_wide(dll);
        let base = unsafe { LoadLibraryW(PCWSTR(wide.as_ptr())) }
            .map_err(|err| InitError::EngineLoad(format!("{}: {err}", dll.display())))?;

        // Language modules ship next to the base module; missing ones are
        // not fatal.
        let dir = dll.parent();
        let english = dir.and_then(|d| load_optional(&d.join("tieng32.dll")));
        let spanish = dir.and_then(|d| load_optional(&d.join("tispan32.dll")));

        let exports = match Exports::resolve(base) {
            Ok(exports) => exports,
            Err(err) => {
                unload_all(base, english, spanish);
                return Err(err);
            }
        };

        let registered_msg = unsafe { RegisterWindowMessageW(w!("SVSyncMessages")) };

        let hwnd = match create_sync_window() {
            Ok(hwnd) => hwnd,
            Err(err) => {
                unload_all(base, english, spanish);
                return Err(err);
            }
        };

        let mut modules = vec![base.0 as isize];
        modules.extend(english.map(|m| m.0 as isize));
        modules.extend(spanish.map(|m| m.0 as isize));
        if let Err(err) = hooks::install(&modules, link.clone()) {
            unsafe {
                let _ = DestroyWindow(hwnd);
            }
            unload_all(base, english, spanish);
            return Err(err);
        }

        *WND_TARGET.write() = Some(WndTarget {
            hwnd: hwnd.0 as isize,
            link,
            registered_msg,
            learned_msg: AtomicU32::new(0),
        });

        tracing::debug!(path = %dll.display(), "engine modules loaded");
        Ok(SoftVoice {
            base: SendHmodule(base),
            english: english.map(SendHmodule),
            spanish: spanish.map(SendHmodule),
            exports,
            hwnd: SendHwnd(hwnd),
            handle: 0,
        })
    }

    fn close_session(&mut self) {
        if self.handle == 0 {
            return;
        }
        let close = self.exports.close_speech;
        let handle = self.handle;
        let _ = guarded(|| unsafe { close(handle) });
        self.handle = 0;
    }
}

impl Engine for SoftVoice {
    fn open(&mut self, voice: i32) -> Result<(), EngineError> {
        self.close_session();

        let open = self.exports.open_speech;
        let hwnd = self.hwnd.0;
        let mut handle = 0i32;
        // The sync-message parameter is undocumented; zero works, the engine
        // still posts its status codes to the window.
        let rc = guarded(|| unsafe { open(&mut handle, hwnd, 0, voice, 0) })?;
        if rc != 0 || handle == 0 {
            return Err(EngineError::CallFailed(rc));
        }
        self.handle = handle;
        Ok(())
    }

    fn switch_language(&mut self, voice: i32) -> Result<(), EngineError> {
        let switch = self.exports.set_language.ok_or(EngineError::Unsupported)?;
        if self.handle == 0 {
            return Err(EngineError::Unsupported);
        }
        let handle = self.handle;
        let rc = guarded(|| unsafe { switch(handle, voice) })?;
        if rc != 0 {
            return Err(EngineError::CallFailed(rc));
        }
        Ok(())
    }

    fn set_param(&mut self, param: Param, value: i32) -> Result<(), EngineError> {
        let setter = self
            .exports
            .setter(param)
            .ok_or(EngineError::Unsupported)?;
        if self.handle == 0 {
            return Err(EngineError::Unsupported);
        }
        let handle = self.handle;
        let rc = guarded(|| unsafe { setter(handle, value) })?;
        if rc != 0 {
            return Err(EngineError::CallFailed(rc));
        }
        Ok(())
    }

    fn speak(&mut self, text: &[u8]) -> Result<(), EngineError> {
        if self.handle == 0 {
            return Err(EngineError::Unsupported);
        }
        let mut buf = Vec::with_capacity(text.len() + 1);
        buf.extend_from_slice(text);
        buf.push(0);

        let speak = self.exports.speak;
        let handle = self.handle;
        let hwnd = self.hwnd.0;
        let ptr = buf.as_ptr();
        let rc = guarded(|| unsafe { speak(handle, ptr, 0, 0, hwnd, 0, 0, 0) })?;
        if rc != 0 {
            return Err(EngineError::CallFailed(rc));
        }
        Ok(())
    }

    fn abort(&mut self) {
        if self.handle == 0 {
            return;
        }
        let abort = self.exports.abort;
        let handle = self.handle;
        let _ = guarded(|| unsafe { abort(handle) });
    }

    fn pump(&mut self) {
        unsafe {
            let mut msg = MSG::default();
            while PeekMessageW(&mut msg, None, 0, 0, PM_REMOVE).as_bool() {
                let _ = TranslateMessage(&msg);
                DispatchMessageW(&msg);
            }
        }
    }

    fn close(&mut self) {
        self.close_session();
    }
}

impl Drop for SoftVoice {
    fn drop(&mut self) {
        self.close_session();

        // The engine keeps internal LoadLibrary references; one free can
        // leave it mapped, and the next initialization needs a pristine
        // process attach. The hooks stay active until the modules are gone
        // so any straggling output calls are still swallowed.
        force_unload(self.spanish.take().map(|m| m.0));
        force_unload(self.english.take().map(|m| m.0));
        force_unload(Some(self.base.0));

        hooks::deactivate();
        *WND_TARGET.write() = None;
        if !self.hwnd.is_invalid() {
            unsafe {
                let _ = DestroyWindow(self.hwnd.0);
            }
        }
        tracing::debug!("engine modules released");
    }
}

fn to_wide(path: &Path) -> Vec<u16> {
    use std::os::windows::ffi::OsStrExt;
    path.as_os_str().encode_wide().chain(Some(0)).collect()
}

fn load_optional(path: &Path) -> Option<HMODULE> {
    let wide = to_wide(path);
    unsafe { LoadLibraryW(PCWSTR(wide.as_ptr())) }.ok()
}

fn force_unload(module: Option<HMODULE>) {
    let Some(module) = module else { return };
    unsafe {
        while FreeLibrary(module).is_ok() {}
    }
}

fn unload_all(base: HMODULE, english: Option<HMODULE>, spanish: Option<HMODULE>) {
    force_unload(spanish);
    force_unload(english);
    force_unload(Some(base));
}
