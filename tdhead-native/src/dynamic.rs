//! `libtdjson` loaded at runtime.
//!
//! Uses the per-instance JSON entry points (`td_json_client_*`) so that each
//! [`TdJsonClient`] owns exactly one native instance and its own event queue.

#![allow(unsafe_code)]

use std::ffi::{CStr, CString, c_char, c_double, c_void};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

use libloading::Library;

use crate::{NativeClient, NativeError, NativeLibrary};

type CreateFn  = unsafe extern "C" fn() -> *mut c_void;
type SendFn    = unsafe extern "C" fn(*mut c_void, *const c_char);
type ReceiveFn = unsafe extern "C" fn(*mut c_void, c_double) -> *const c_char;
type ExecuteFn = unsafe extern "C" fn(*mut c_void, *const c_char) -> *const c_char;
type DestroyFn = unsafe extern "C" fn(*mut c_void);

struct Symbols {
    create:  CreateFn,
    send:    SendFn,
    receive: ReceiveFn,
    execute: ExecuteFn,
    destroy: DestroyFn,
}

/// Symbols are plain function pointers into `library`; the library must
/// outlive every copy of them, so both live in the same allocation.
struct Loaded {
    symbols:  Symbols,
    _library: Library,
}

// ─── TdJsonLibrary ────────────────────────────────────────────────────────────

/// A loaded `libtdjson`.
pub struct TdJsonLibrary {
    path:   PathBuf,
    loaded: Arc<Loaded>,
}

impl TdJsonLibrary {
    /// Load the platform default file name (`libtdjson.so`, `tdjson.dll`, ...)
    /// through the system search path.
    pub fn load_default() -> Result<Self, NativeError> {
        Self::load(libloading::library_filename("tdjson"))
    }

    /// Load `libtdjson` from an explicit path.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, NativeError> {
        let path = path.as_ref().to_path_buf();
        let library = unsafe {
            Library::new(&path).map_err(|e| NativeError::Load {
                path:   path.display().to_string(),
                reason: e.to_string(),
            })?
        };
        let symbols = unsafe {
            Symbols {
                create:  *library.get::<CreateFn>(b"td_json_client_create\0")
                    .map_err(|_| NativeError::MissingSymbol("td_json_client_create"))?,
                send:    *library.get::<SendFn>(b"td_json_client_send\0")
                    .map_err(|_| NativeError::MissingSymbol("td_json_client_send"))?,
                receive: *library.get::<ReceiveFn>(b"td_json_client_receive\0")
                    .map_err(|_| NativeError::MissingSymbol("td_json_client_receive"))?,
                execute: *library.get::<ExecuteFn>(b"td_json_client_execute\0")
                    .map_err(|_| NativeError::MissingSymbol("td_json_client_execute"))?,
                destroy: *library.get::<DestroyFn>(b"td_json_client_destroy\0")
                    .map_err(|_| NativeError::MissingSymbol("td_json_client_destroy"))?,
            }
        };
        log::info!("[tdhead] Loaded {}", path.display());
        Ok(Self { path, loaded: Arc::new(Loaded { symbols, _library: library }) })
    }

    /// Where the library was loaded from.
    pub fn path(&self) -> &Path { &self.path }
}

impl NativeLibrary for TdJsonLibrary {
    fn create(&self) -> Result<Arc<dyn NativeClient>, NativeError> {
        let raw = unsafe { (self.loaded.symbols.create)() };
        let ptr = NonNull::new(raw).ok_or(NativeError::CreateFailed)?;
        Ok(Arc::new(TdJsonClient { ptr, loaded: self.loaded.clone() }))
    }

    fn name(&self) -> &str { "tdjson" }
}

// ─── TdJsonClient ─────────────────────────────────────────────────────────────

/// One `td_json_client_create` instance. Destroyed on drop.
pub struct TdJsonClient {
    ptr:    NonNull<c_void>,
    loaded: Arc<Loaded>,
}

// libtdjson documents send/execute as callable from any thread; receive is
// kept single-threaded by the caller (see `NativeClient`).
unsafe impl Send for TdJsonClient {}
unsafe impl Sync for TdJsonClient {}

impl NativeClient for TdJsonClient {
    fn send(&self, request: &str) -> Result<(), NativeError> {
        let request = CString::new(request).map_err(|_| NativeError::InvalidString)?;
        unsafe { (self.loaded.symbols.send)(self.ptr.as_ptr(), request.as_ptr()) };
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Option<String> {
        let raw = unsafe { (self.loaded.symbols.receive)(self.ptr.as_ptr(), timeout.as_secs_f64()) };
        // The buffer is reused by the next receive call: copy it out now.
        copy_out(raw)
    }

    fn execute(&self, request: &str) -> Result<Option<String>, NativeError> {
        let request = CString::new(request).map_err(|_| NativeError::InvalidString)?;
        let raw = unsafe { (self.loaded.symbols.execute)(self.ptr.as_ptr(), request.as_ptr()) };
        Ok(copy_out(raw))
    }
}

impl Drop for TdJsonClient {
    fn drop(&mut self) {
        unsafe { (self.loaded.symbols.destroy)(self.ptr.as_ptr()) };
    }
}

fn copy_out(raw: *const c_char) -> Option<String> {
    if raw.is_null() {
        return None;
    }
    let text = unsafe { CStr::from_ptr(raw) };
    Some(text.to_string_lossy().into_owned())
}
