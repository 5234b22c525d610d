//! The C ABI a tracing host loads.
//!
//! The host calls [`piverify_init`] once, forwards every function-with-args
//! tracepoint to [`piverify_callback`], and calls [`piverify_finish`] at
//! shutdown.

use std::{
    borrow::Cow,
    ffi::{c_char, CStr},
    ptr, slice,
    sync::{Arc, RwLock},
};

use libc::{c_int, c_void};
use log::{error, info, trace};

use crate::{
    config::Config,
    engine::Engine,
    trace::{BeginEvent, CallToken, CodeLocation, EndEvent, Status},
};

pub const TRACE_FUNCTION_WITH_ARGS_BEGIN: u16 = 0x23;
pub const TRACE_FUNCTION_WITH_ARGS_END: u16 = 0x22;

/// What the host passes as `user_data` for function-with-args tracepoints
#[repr(C)]
#[derive(Debug)]
pub struct FunctionWithArgs {
    pub function_id: u32,
    pub function_name: *const c_char,
    /// Packed argument buffer
    pub args_data: *const c_void,
    /// `*const i32` status, only on end events
    pub ret_data: *const c_void,
    pub user_data: *const c_void,
    /// May be null
    pub location: *const SourceLocation,
}

#[repr(C)]
#[derive(Debug)]
pub struct SourceLocation {
    pub function_name: *const c_char,
    pub file_name: *const c_char,
    pub line: u32,
    pub column: u32,
}

/// Set by init, cleared by finish. A callback clones the `Arc` and drops the
/// read lock before doing any work.
static ENGINE: RwLock<Option<Arc<Engine>>> = RwLock::new(None);

fn current_engine() -> Option<Arc<Engine>> {
    ENGINE
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

unsafe fn c_str<'a>(ptr: *const c_char) -> Option<Cow<'a, str>> {
    if ptr.is_null() {
        None
    } else {
        Some(CStr::from_ptr(ptr).to_string_lossy())
    }
}

/// Build the engine from the environment. Returns `0` on success, `-1` if the
/// configuration or catalog is invalid (the reason goes to the log).
#[no_mangle]
pub extern "C" fn piverify_init() -> c_int {
    // the host may have set up a logger already
    let _ = env_logger::try_init();

    let engine = match Config::from_env()
        .map_err(Into::into)
        .and_then(|config| Engine::from_config(&config))
    {
        Ok(engine) => engine,
        Err(err) => {
            error!("piverify disabled: {err}");
            return -1;
        }
    };
    *ENGINE.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(engine));
    info!("piverify ready");
    0
}

/// Report leaks and drop the engine. Callbacks arriving afterwards are
/// ignored.
#[no_mangle]
pub extern "C" fn piverify_finish() {
    let engine = ENGINE
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take();
    if let Some(engine) = engine {
        engine.finish();
    }
}

/// Shaped like an XPTI subscriber callback: trace type, parent event, the
/// tracepoint's own event, instance number, user data.
///
/// # Safety
///
/// - For function-with-args trace types, `user_data` is null or points to a
///   valid [`FunctionWithArgs`] for the duration of the call
/// - `args_data` is null or readable for the packed size of `function_id`
/// - `ret_data` is null or points to an `i32`
/// - Every non-null string is nul-terminated
/// - `parent` and `event` are never dereferenced, only used as identities
#[no_mangle]
pub unsafe extern "C" fn piverify_callback(
    trace_type: u16,
    _parent: *const c_void,
    event: *const c_void,
    instance: u64,
    user_data: *const c_void,
) {
    if trace_type != TRACE_FUNCTION_WITH_ARGS_BEGIN && trace_type != TRACE_FUNCTION_WITH_ARGS_END {
        return;
    }
    let Some(engine) = current_engine() else {
        return;
    };
    let Some(record) = (user_data as *const FunctionWithArgs).as_ref() else {
        return;
    };

    let token = CallToken::new(event as u64, instance);
    let function_id = record.function_id;
    let name = c_str(record.function_name);
    let function_name = name.as_deref();
    let args: &[u8] = match engine.packed_size(function_id, function_name) {
        Some(size) if size > 0 && !record.args_data.is_null() => {
            slice::from_raw_parts(record.args_data as *const u8, size)
        }
        _ => &[],
    };
    trace!(
        "callback {trace_type:#x} {token} {}",
        function_name.unwrap_or("<unnamed>")
    );

    if trace_type == TRACE_FUNCTION_WITH_ARGS_BEGIN {
        let location = record.location.as_ref().map(|location| CodeLocation {
            function: c_str(location.function_name).map(Cow::into_owned),
            file: c_str(location.file_name).map(Cow::into_owned),
            line: location.line,
            column: location.column,
        });
        engine.on_begin(&BeginEvent {
            token,
            function_id,
            function_name,
            args,
            location: location.as_ref(),
        });
    } else {
        let status = (!record.ret_data.is_null())
            .then(|| Status(ptr::read_unaligned(record.ret_data as *const i32)));
        engine.on_end(&EndEvent {
            token,
            function_id,
            function_name,
            args,
            status,
        });
    }
}
