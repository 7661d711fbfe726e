//! FFI bindings for HrvXo
//!
//! C-compatible entry points so the mobile host can own a session through an
//! opaque handle and push JSON events into it. Strings returned by these
//! functions are allocated here and must be freed with `hrvxo_free_string`.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;

use crate::error::CoreError;
use crate::pipeline::{SessionEvent, SessionPipeline};

// Thread-local storage for the last error message
thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(msg: &str) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

unsafe fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

/// Caller must free the result
fn string_to_cstr(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cstr) => cstr.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

/// Hand a JSON result back to C, or record the error and return NULL
fn json_or_null(result: Result<String, CoreError>) -> *mut c_char {
    match result {
        Ok(json) => string_to_cstr(&json),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

// ============================================================================
// Session API
// ============================================================================

/// Opaque handle to a SessionPipeline
pub struct HrvxoSessionHandle {
    pipeline: SessionPipeline,
}

/// Create a session pipeline.
///
/// # Safety
/// - `config_json` must be NULL (use defaults) or a valid null-terminated C string.
/// - Must be freed with `hrvxo_session_free`.
/// - Returns NULL if the configuration is invalid; see `hrvxo_last_error`.
#[no_mangle]
pub unsafe extern "C" fn hrvxo_session_new(config_json: *const c_char) -> *mut HrvxoSessionHandle {
    clear_last_error();

    let pipeline = if config_json.is_null() {
        SessionPipeline::default()
    } else {
        let json = match cstr_to_string(config_json) {
            Some(s) => s,
            None => {
                set_last_error("Invalid config string pointer");
                return ptr::null_mut();
            }
        };
        match SessionPipeline::from_config_json(&json) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                set_last_error(&e.to_string());
                return ptr::null_mut();
            }
        }
    };

    let handle = Box::new(HrvxoSessionHandle { pipeline });
    Box::into_raw(handle)
}

/// Free a session pipeline.
///
/// # Safety
/// - `session` must be a valid pointer returned by `hrvxo_session_new`, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn hrvxo_session_free(session: *mut HrvxoSessionHandle) {
    if !session.is_null() {
        drop(Box::from_raw(session));
    }
}

/// Apply one JSON event and return the resulting session snapshot as JSON.
///
/// # Safety
/// - `session` must be a valid pointer returned by `hrvxo_session_new`.
/// - `event_json` must be a valid null-terminated C string.
/// - Returns a newly allocated string that must be freed with `hrvxo_free_string`.
/// - Returns NULL on error; the session is left unchanged.
#[no_mangle]
pub unsafe extern "C" fn hrvxo_session_handle_event(
    session: *mut HrvxoSessionHandle,
    event_json: *const c_char,
) -> *mut c_char {
    clear_last_error();

    if session.is_null() {
        set_last_error("Null session pointer");
        return ptr::null_mut();
    }
    let handle = &mut *session;

    let json = match cstr_to_string(event_json) {
        Some(s) => s,
        None => {
            set_last_error("Invalid event string pointer");
            return ptr::null_mut();
        }
    };

    json_or_null(SessionEvent::from_json(&json).and_then(|event| {
        handle.pipeline.handle(event);
        Ok(serde_json::to_string(&handle.pipeline.snapshot())?)
    }))
}

/// Finalized song results of the current or last session as a JSON array.
///
/// # Safety
/// - `session` must be a valid pointer returned by `hrvxo_session_new`.
/// - Returns a newly allocated string that must be freed with `hrvxo_free_string`.
#[no_mangle]
pub unsafe extern "C" fn hrvxo_session_results(session: *const HrvxoSessionHandle) -> *mut c_char {
    clear_last_error();

    if session.is_null() {
        set_last_error("Null session pointer");
        return ptr::null_mut();
    }
    let handle = &*session;

    json_or_null(serde_json::to_string(handle.pipeline.session().results()).map_err(Into::into))
}

// ============================================================================
// Memory Management
// ============================================================================

/// Free a string returned by HrvXo functions.
///
/// # Safety
/// - `ptr` must be a valid pointer returned by an HrvXo function, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn hrvxo_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

// ============================================================================
// Error Handling
// ============================================================================

/// Get the last error message.
///
/// # Safety
/// - Returns a pointer to a thread-local error string.
/// - The returned pointer is valid until the next HrvXo call on this thread.
/// - Do NOT free the returned pointer.
/// - Returns NULL if no error occurred.
#[no_mangle]
pub unsafe extern "C" fn hrvxo_last_error() -> *const c_char {
    LAST_ERROR.with(|e| match &*e.borrow() {
        Some(cstr) => cstr.as_ptr(),
        None => ptr::null(),
    })
}

/// Get the HrvXo library version.
///
/// # Safety
/// - Returns a pointer to a static string. Do NOT free.
#[no_mangle]
pub unsafe extern "C" fn hrvxo_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}
