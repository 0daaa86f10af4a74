//! Process-wide logging façade.
//!
//! Wraps `env_logger` with a fixed record format — timestamp, level,
//! `file:line`, message — and adds the one level the `log` crate lacks:
//! fatal. [`fatal!`] emits an error-level record (plus a best-effort
//! backtrace when `RUST_BACKTRACE` enables capture) and terminates the
//! process with exit code −1.
//!
//! Initialise once, before any other component:
//!
//! ```text
//! 2026-08-01 12:00:00.123 INFO  src/engine.rs:97 monitoring engine running
//! ```
//!
//! The level filter comes from `RUST_LOG` and defaults to `info`.

use std::io::Write;

/// Initialise the global logger. Call once at process start.
pub fn init() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:<5} {}:{} {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.file().unwrap_or("?"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .init();
}

/// Log an error-level record and terminate the process with exit code −1.
///
/// The record carries the caller's file and line like any other log macro.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        $crate::logging::exit_fatal();
    }};
}

/// Emit a best-effort backtrace and exit with code −1.
///
/// Invoked by [`fatal!`]; not meant to be called directly.
pub fn exit_fatal() -> ! {
    let backtrace = std::backtrace::Backtrace::capture();
    if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
        log::error!("backtrace:\n{backtrace}");
    }
    std::process::exit(-1);
}
