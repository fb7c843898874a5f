// Windows 0.62+ type wrappers for thread safety
// HWND and HMODULE are *mut c_void which don't implement Send/Sync, but the
// worker thread owns them for the whole engine lifetime.

use windows::Win32::Foundation::{HMODULE, HWND};

/// Thread-safe wrapper for HWND
#[derive(Clone, Copy, Debug)]
pub struct SendHwnd(pub HWND);
unsafe impl Send for SendHwnd {}
unsafe impl Sync for SendHwnd {}

impl Default for SendHwnd {
    fn default() -> Self {
        SendHwnd(HWND::default())
    }
}

impl SendHwnd {
    pub fn is_invalid(&self) -> bool {
        self.0.is_invalid()
    }
}

/// Thread-safe wrapper for HMODULE
#[derive(Clone, Copy, Debug)]
pub struct SendHmodule(pub HMODULE);
unsafe impl Send for SendHmodule {}
unsafe impl Sync for SendHmodule {}
