//! C-compatible API for host applications
//!
//! The bridge owns one process-wide service backed by llama.cpp. Strings
//! returned to the caller are allocated by Rust and must be released with
//! [`llama_free_string_c`].

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::sync::{Arc, Once};

use parking_lot::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{ServiceConfig, DEFAULT_CONTEXT_SIZE, DEFAULT_WORKER_COUNT};
use crate::engine::llama::LlamaEngine;
use crate::service::{Service, SENTINEL_BAD};

static SERVICE: Mutex<Option<Arc<Service<LlamaEngine>>>> = Mutex::new(None);
static LOGGING: Once = Once::new();

fn init_logging() {
    LOGGING.call_once(|| {
        // The host may already own a global subscriber
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "infer_pool=info".into()),
            )
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    });
}

fn service() -> Option<Arc<Service<LlamaEngine>>> {
    SERVICE.lock().clone()
}

/// Read a C string, treating null as absent
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string.
unsafe fn read_str(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
}

fn string_to_raw(s: String) -> *mut c_char {
    match CString::new(s) {
        Ok(s) => s.into_raw(),
        // Interior NUL in generated text
        Err(_) => CString::new(SENTINEL_BAD).map_or(std::ptr::null_mut(), CString::into_raw),
    }
}

/// Load the model and start the worker pool
///
/// Non-positive `n_ctx` / `n_workers` fall back to the defaults; a null or
/// empty `chat_template_path` selects plain concatenation.
///
/// # Safety
/// String arguments must be null or NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn llama_initialize_c(
    model_path: *const c_char,
    n_ctx: c_int,
    n_workers: c_int,
    chat_template_path: *const c_char,
) -> bool {
    init_logging();

    let Some(model_path) = read_str(model_path).filter(|p| !p.is_empty()) else {
        tracing::error!("llama_initialize_c called without a model path");
        return false;
    };

    let mut config = ServiceConfig::new(model_path)
        .with_context_size(if n_ctx > 0 {
            n_ctx as u32
        } else {
            DEFAULT_CONTEXT_SIZE
        })
        .with_worker_count(if n_workers > 0 {
            n_workers as usize
        } else {
            DEFAULT_WORKER_COUNT
        });
    if let Some(template) = read_str(chat_template_path).filter(|p| !p.is_empty()) {
        config = config.with_chat_template(template);
    }

    let service = {
        let mut slot = SERVICE.lock();
        match slot.as_ref() {
            Some(service) => Arc::clone(service),
            None => match LlamaEngine::init() {
                Ok(engine) => {
                    let service = Arc::new(Service::new(engine));
                    *slot = Some(Arc::clone(&service));
                    service
                }
                Err(e) => {
                    tracing::error!("Failed to initialize llama.cpp: {}", e);
                    return false;
                }
            },
        }
    };

    match service.initialize(config) {
        Ok(()) => true,
        Err(e) => {
            tracing::error!("{}", e);
            false
        }
    }
}

/// Stop all workers and release the model. Safe to call repeatedly.
#[no_mangle]
pub extern "C" fn llama_shutdown_c() {
    if let Some(service) = service() {
        service.shutdown();
    }
}

#[no_mangle]
pub extern "C" fn llama_is_initialized_c() -> bool {
    service().is_some_and(|service| service.is_initialized())
}

/// Blocking generation; returns the text or a sentinel (caller must free)
///
/// # Safety
/// `prompt` and `context` must be null or NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn llama_generate_sync_c(
    prompt: *const c_char,
    max_tokens: c_int,
    context: *const c_char,
) -> *mut c_char {
    let Some(service) = service() else {
        return string_to_raw(SENTINEL_BAD.to_string());
    };
    let prompt = read_str(prompt).unwrap_or_default();
    let context = read_str(context).unwrap_or_default();
    let max_tokens = usize::try_from(max_tokens).unwrap_or(0);
    string_to_raw(service.generate_sync(&prompt, max_tokens, &context))
}

/// Free a string returned by this library
///
/// # Safety
/// `ptr` must be null or a pointer previously returned by this library.
#[no_mangle]
pub unsafe extern "C" fn llama_free_string_c(ptr: *mut c_char) {
    if ptr.is_null() {
        return;
    }
    drop(CString::from_raw(ptr));
}
