use std::os::raw::{c_char, c_void};
use std::sync::Once;

use anyhow::{Context, Result};
use whisper_rs::{WhisperContext, WhisperContextParameters};

/// Load a Whisper model and return an initialized `WhisperContext`.
pub(super) fn load_context(model_path: &str) -> Result<WhisperContext> {
    silence_whisper_logging();

    let ctx_params = WhisperContextParameters::default();
    WhisperContext::new_with_params(model_path, ctx_params)
        .with_context(|| format!("failed to load model from path: {model_path}"))
}

/// No-op log callback; whisper.cpp otherwise writes straight to stderr.
unsafe extern "C" fn whisper_log_callback(
    _level: u32,
    _c_msg: *const c_char,
    _user_data: *mut c_void,
) {
}

/// Route whisper.cpp logging into the void, once per process.
fn silence_whisper_logging() {
    static INIT: Once = Once::new();

    INIT.call_once(|| unsafe {
        whisper_rs::set_log_callback(Some(whisper_log_callback), std::ptr::null_mut());
    });
}
