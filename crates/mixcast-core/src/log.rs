// crates/mixcast-core/src/log.rs
//
// Process-wide log fan-out.
//
// Embedders install one callback at init; it is read-only afterward. With
// no callback installed, messages go to stderr as "[mixcast] level: msg".
// The numeric levels are part of the embedding contract (a C-ABI shim maps
// them straight through), which is why they are explicit discriminants.

use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum LogLevel {
    Error = 100,
    Warning = 200,
    Info = 300,
    Debug = 400,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warning => "warning",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

type LogHandler = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

static HANDLER: OnceLock<LogHandler> = OnceLock::new();

/// Install the process-wide log callback. The first install wins; later
/// calls are ignored (returns false).
pub fn set_log_handler(handler: impl Fn(LogLevel, &str) + Send + Sync + 'static) -> bool {
    HANDLER.set(Box::new(handler)).is_ok()
}

pub fn log_message(level: LogLevel, msg: &str) {
    match HANDLER.get() {
        Some(handler) => handler(level, msg),
        None => eprintln!("[mixcast] {}: {msg}", level.as_str()),
    }
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::log::log_message($crate::log::LogLevel::Error, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::log::log_message($crate::log::LogLevel::Warning, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::log::log_message($crate::log::LogLevel::Info, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::log::log_message($crate::log::LogLevel::Debug, &format!($($arg)*))
    };
}
