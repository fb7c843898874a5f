//! Global interception of the `waveOut*` entry points.
//!
//! The engine believes it is playing through a real audio device; these
//! detours capture its PCM into the output queue instead and synthesize the
//! completion notifications it expects. Calls from anything other than the
//! engine's own modules pass straight through to the original entry points.
//! The detours stay installed for the life of the process and forward
//! everything while no session is live.

use std::ffi::c_void;
use std::mem;
use std::sync::OnceLock;

use parking_lot::{Mutex, RwLock};
use retour::GenericDetour;
use windows::Win32::Foundation::{HANDLE, HMODULE, HWND, LPARAM, WPARAM};
use windows::Win32::Media::Audio::{WAVEFORMATEX, WAVEHDR};
use windows::Win32::System::Diagnostics::Debug::RtlCaptureStackBackTrace;
use windows::Win32::System::LibraryLoader::{
    GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS, GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
    GetModuleHandleExW, GetModuleHandleW, GetProcAddress, LoadLibraryW,
};
use windows::Win32::System::Threading::SetEvent;
use windows::Win32::UI::WindowsAndMessaging::{PostMessageW, PostThreadMessageW};
use windows::core::{PCSTR, PCWSTR, w};

use crate::capture::CaptureLink;
use crate::error::InitError;
use crate::format::AudioFormat;

// mmsystem.h plumbing, kept local to the hook layer.
const MMSYSERR_NOERROR: u32 = 0;
const MMSYSERR_ERROR: u32 = 1;
const MMSYSERR_INVALPARAM: u32 = 11;
const WHDR_DONE: u32 = 0x0000_0001;
const WHDR_PREPARED: u32 = 0x0000_0002;
// WOM_* double as the MM_WOM_* window/thread message ids.
const WOM_OPEN: u32 = 0x3BB;
const WOM_CLOSE: u32 = 0x3BC;
const WOM_DONE: u32 = 0x3BD;
const CALLBACK_TYPEMASK: u32 = 0x0007_0000;
const CALLBACK_WINDOW: u32 = 0x0001_0000;
const CALLBACK_THREAD: u32 = 0x0002_0000;
const CALLBACK_FUNCTION: u32 = 0x0003_0000;
const CALLBACK_EVENT: u32 = 0x0005_0000;

type WaveOutOpenFn =
    unsafe extern "system" fn(*mut *mut c_void, u32, *const WAVEFORMATEX, usize, usize, u32) -> u32;
type WaveOutHeaderFn = unsafe extern "system" fn(*mut c_void, *mut WAVEHDR, u32) -> u32;
type WaveOutPlainFn = unsafe extern "system" fn(*mut c_void) -> u32;
type WaveOutProcFn = unsafe extern "system" fn(*mut c_void, u32, usize, usize, usize);

struct Detours {
    open: GenericDetour<WaveOutOpenFn>,
    prepare: GenericDetour<WaveOutHeaderFn>,
    write: GenericDetour<WaveOutHeaderFn>,
    unprepare: GenericDetour<WaveOutHeaderFn>,
    reset: GenericDetour<WaveOutPlainFn>,
    close: GenericDetour<WaveOutPlainFn>,
}

unsafe impl Send for Detours {}
unsafe impl Sync for Detours {}

static DETOURS: OnceLock<Detours> = OnceLock::new();

/// The completion mechanism the engine registered at device-open time. All
/// four conventions the platform offers must be honored.
#[derive(Clone, Copy, Default)]
struct WaveCallback {
    flags: u32,
    target: usize,
    instance: usize,
}

struct HookTarget {
    link: CaptureLink,
    engine_modules: Vec<isize>,
    callback: Mutex<WaveCallback>,
}

static ACTIVE: RwLock<Option<HookTarget>> = RwLock::new(None);

// The opaque device handle handed back to the engine. Only its identity
// matters; the hooks never dereference it.
static FAKE_DEVICE_SLOT: u8 = 0;

fn fake_device() -> *mut c_void {
    &FAKE_DEVICE_SLOT as *const u8 as *mut c_void
}

/// Install the detours (first call only) and make `link` the live capture
/// target for calls arriving from `engine_modules`.
pub(crate) fn install(engine_modules: &[isize], link: CaptureLink) -> Result<(), InitError> {
    if DETOURS.get().is_none() {
        let detours = build_detours()?;
        // A racing second install would have failed on the singleton session
        // lock long before getting here; first writer wins regardless.
        let _ = DETOURS.set(detours);
    }

    *ACTIVE.write() = Some(HookTarget {
        link,
        engine_modules: engine_modules.to_vec(),
        callback: Mutex::new(WaveCallback::default()),
    });
    Ok(())
}

/// Detach the capture target; the detours keep forwarding transparently.
pub(crate) fn deactivate() {
    *ACTIVE.write() = None;
}

fn resolve(name: PCSTR) -> Result<*const c_void, InitError> {
    unsafe {
        // The exports live in winmm; on newer Windows builds the real entry
        // points sit in winmmbase, so try both.
        let _ = LoadLibraryW(w!("winmm.dll"));
        let _ = LoadLibraryW(w!("winmmbase.dll"));

        for module in [w!("winmm.dll"), w!("winmmbase.dll")] {
            if let Ok(handle) = GetModuleHandleW(module) {
                if let Some(address) = GetProcAddress(handle, name) {
                    return Ok(address as *const c_void);
                }
            }
        }
    }
    Err(InitError::HookInstall)
}

macro_rules! detour {
    ($ty:ty, $name:literal, $hook:ident) => {{
        let target: $ty =
            unsafe { mem::transmute(resolve(PCSTR(concat!($name, "\0").as_ptr()))?) };
        let detour = unsafe { GenericDetour::<$ty>::new(target, $hook) }
            .map_err(|_| InitError::HookInstall)?;
        unsafe { detour.enable() }.map_err(|_| InitError::HookInstall)?;
        detour
    }};
}

/// Hook all six entry points or none; a partial set silently loses audio.
fn build_detours() -> Result<Detours, InitError> {
    let detours = Detours {
        open: detour!(WaveOutOpenFn, "waveOutOpen", hook_open),
        prepare: detour!(WaveOutHeaderFn, "waveOutPrepareHeader", hook_prepare),
        write: detour!(WaveOutHeaderFn, "waveOutWrite", hook_write),
        unprepare: detour!(WaveOutHeaderFn, "waveOutUnprepareHeader", hook_unprepare),
        reset: detour!(WaveOutPlainFn, "waveOutReset", hook_reset),
        close: detour!(WaveOutPlainFn, "waveOutClose", hook_close),
    };
    tracing::debug!("waveOut hooks installed");
    Ok(detours)
}

/// Resolve the owning module of the call site and match it against the
/// engine's modules. The handle value is useless for this: the engine passes
/// back whatever opaque value the open hook fabricated.
#[inline(never)]
fn caller_is_engine(target: &HookTarget) -> bool {
    let mut frames = [std::ptr::null_mut(); 6];
    let captured =
        unsafe { RtlCaptureStackBackTrace(1, frames.len() as u32, frames.as_mut_ptr(), None) };
    for &frame in &frames[..captured as usize] {
        if frame.is_null() {
            continue;
        }
        let mut module = HMODULE::default();
        let found = unsafe {
            GetModuleHandleExW(
                GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS | GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
                PCWSTR(frame as *const u16),
                &mut module,
            )
        };
        if found.is_ok() && target.engine_modules.contains(&(module.0 as isize)) {
            return true;
        }
    }
    false
}

/// Deliver a completion notification through whichever mechanism the engine
/// registered.
fn notify(target: &HookTarget, message: u32, header: *mut WAVEHDR) {
    let cb = *target.callback.lock();
    if cb.target == 0 {
        return;
    }
    unsafe {
        match cb.flags & CALLBACK_TYPEMASK {
            CALLBACK_FUNCTION => {
                let callback: WaveOutProcFn = mem::transmute(cb.target);
                callback(fake_device(), message, cb.instance, header as usize, 0);
            }
            CALLBACK_WINDOW => {
                let hwnd = HWND(cb.target as *mut c_void);
                let _ = PostMessageW(
                    Some(hwnd),
                    message,
                    WPARAM(fake_device() as usize),
                    LPARAM(header as isize),
                );
            }
            CALLBACK_THREAD => {
                let _ = PostThreadMessageW(
                    cb.target as u32,
                    message,
                    WPARAM(fake_device() as usize),
                    LPARAM(header as isize),
                );
            }
            CALLBACK_EVENT => {
                let _ = SetEvent(HANDLE(cb.target as *mut c_void));
            }
            _ => {}
        }
    }
}

unsafe extern "system" fn hook_open(
    phwo: *mut *mut c_void,
    device_id: u32,
    pwfx: *const WAVEFORMATEX,
    callback: usize,
    instance: usize,
    flags: u32,
) -> u32 {
    let guard = ACTIVE.read();
    let Some(target) = guard.as_ref().filter(|t| caller_is_engine(t)) else {
        return match DETOURS.get() {
            Some(d) => d.open.call(phwo, device_id, pwfx, callback, instance, flags),
            None => MMSYSERR_ERROR,
        };
    };

    if !phwo.is_null() {
        *phwo = fake_device();
    }

    if !pwfx.is_null() {
        let wf = &*pwfx;
        target.link.open_output(AudioFormat {
            format_tag: wf.wFormatTag,
            sample_rate: wf.nSamplesPerSec,
            channels: wf.nChannels,
            bits_per_sample: wf.wBitsPerSample,
            block_align: wf.nBlockAlign,
            avg_bytes_per_sec: wf.nAvgBytesPerSec,
        });
    }

    *target.callback.lock() = WaveCallback {
        flags,
        target: callback,
        instance,
    };

    notify(target, WOM_OPEN, std::ptr::null_mut());
    MMSYSERR_NOERROR
}

unsafe extern "system" fn hook_write(hwo: *mut c_void, pwh: *mut WAVEHDR, cbwh: u32) -> u32 {
    let guard = ACTIVE.read();
    let Some(target) = guard.as_ref().filter(|t| caller_is_engine(t)) else {
        return match DETOURS.get() {
            Some(d) => d.write.call(hwo, pwh, cbwh),
            None => MMSYSERR_ERROR,
        };
    };

    if pwh.is_null() {
        return MMSYSERR_INVALPARAM;
    }
    let header = &mut *pwh;
    if !header.lpData.is_null() && header.dwBufferLength > 0 {
        let data = std::slice::from_raw_parts(
            header.lpData.0 as *const u8,
            header.dwBufferLength as usize,
        );
        // Gating and pacing happen inside; a stale generation is discarded
        // but the buffer must still look played so the engine's state
        // machine keeps moving.
        target.link.submit_audio(data);
    }

    header.dwFlags |= WHDR_DONE;
    notify(target, WOM_DONE, pwh);
    MMSYSERR_NOERROR
}

unsafe extern "system" fn hook_prepare(hwo: *mut c_void, pwh: *mut WAVEHDR, cbwh: u32) -> u32 {
    let guard = ACTIVE.read();
    if guard.as_ref().filter(|t| caller_is_engine(t)).is_none() {
        return match DETOURS.get() {
            Some(d) => d.prepare.call(hwo, pwh, cbwh),
            None => MMSYSERR_ERROR,
        };
    }
    if !pwh.is_null() {
        (*pwh).dwFlags |= WHDR_PREPARED;
    }
    MMSYSERR_NOERROR
}

unsafe extern "system" fn hook_unprepare(hwo: *mut c_void, pwh: *mut WAVEHDR, cbwh: u32) -> u32 {
    let guard = ACTIVE.read();
    if guard.as_ref().filter(|t| caller_is_engine(t)).is_none() {
        return match DETOURS.get() {
            Some(d) => d.unprepare.call(hwo, pwh, cbwh),
            None => MMSYSERR_ERROR,
        };
    }
    if !pwh.is_null() {
        (*pwh).dwFlags &= !WHDR_PREPARED;
    }
    MMSYSERR_NOERROR
}

unsafe extern "system" fn hook_reset(hwo: *mut c_void) -> u32 {
    let guard = ACTIVE.read();
    if guard.as_ref().filter(|t| caller_is_engine(t)).is_none() {
        return match DETOURS.get() {
            Some(d) => d.reset.call(hwo),
            None => MMSYSERR_ERROR,
        };
    }
    MMSYSERR_NOERROR
}

unsafe extern "system" fn hook_close(hwo: *mut c_void) -> u32 {
    let guard = ACTIVE.read();
    let Some(target) = guard.as_ref().filter(|t| caller_is_engine(t)) else {
        return match DETOURS.get() {
            Some(d) => d.close.call(hwo),
            None => MMSYSERR_ERROR,
        };
    };
    notify(target, WOM_CLOSE, std::ptr::null_mut());
    MMSYSERR_NOERROR
}
