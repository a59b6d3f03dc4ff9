// src/logging.rs - Forward native engine log output into the `log` facade
use std::ffi::{c_char, c_void, CStr};

/// Target used for every record coming from the engine
pub const NATIVE_LOG_TARGET: &str = "native";

/// Severity as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeLogLevel {
    Error,
    Warning,
    Info,
    Debug,
}

impl NativeLogLevel {
    /// Engine codes: 2 error, 3 warning, 4 info, 5 debug. Anything else is logged as info.
    pub fn from_raw(level: i32) -> Self {
        match level {
            2 => NativeLogLevel::Error,
            3 => NativeLogLevel::Warning,
            4 => NativeLogLevel::Info,
            5 => NativeLogLevel::Debug,
            _ => NativeLogLevel::Info,
        }
    }

    pub fn to_level(self) -> log::Level {
        match self {
            NativeLogLevel::Error => log::Level::Error,
            NativeLogLevel::Warning => log::Level::Warn,
            NativeLogLevel::Info => log::Level::Info,
            NativeLogLevel::Debug => log::Level::Debug,
        }
    }
}

/// Emit one engine message under [`NATIVE_LOG_TARGET`]
pub fn forward(level: NativeLogLevel, message: &str) {
    let message = message.trim_end_matches(['\n', '\r']);
    if message.is_empty() {
        return;
    }
    log::log!(target: NATIVE_LOG_TARGET, level.to_level(), "{}", message);
}

/// Callback handed to the engine's log hook. Stateless, so it can stay installed for the
/// life of the process without owning anything.
///
/// # Safety
/// `text` must be null or a valid NUL-terminated string for the duration of the call.
pub unsafe extern "C" fn native_log_callback(
    level: i32,
    text: *const c_char,
    _user_data: *mut c_void,
) {
    if text.is_null() {
        return;
    }
    let message = CStr::from_ptr(text).to_string_lossy();
    forward(NativeLogLevel::from_raw(level), &message);
}

/// Install `env_logger` as the global logger if nothing else has been installed.
/// Safe to call more than once.
pub fn init() {
    if env_logger::try_init().is_err() {
        log::trace!("Logger already initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn test_level_mapping() {
        assert_eq!(NativeLogLevel::from_raw(2).to_level(), log::Level::Error);
        assert_eq!(NativeLogLevel::from_raw(3).to_level(), log::Level::Warn);
        assert_eq!(NativeLogLevel::from_raw(4).to_level(), log::Level::Info);
        assert_eq!(NativeLogLevel::from_raw(5).to_level(), log::Level::Debug);
        assert_eq!(NativeLogLevel::from_raw(99), NativeLogLevel::Info);
    }

    #[test]
    fn test_callback_accepts_null_and_text() {
        init();
        let text = CString::new("kv cache resized\n").unwrap();
        unsafe {
            native_log_callback(4, std::ptr::null(), std::ptr::null_mut());
            native_log_callback(3, text.as_ptr(), std::ptr::null_mut());
        }
    }
}
