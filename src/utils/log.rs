//! Leveled stderr logging with colored level tags.
//!
//! Use the exported `debug!`, `info!`, `warn!` and `error!` macros. Messages are
//! dropped under `cfg(test)` so test output stays readable, and `debug!` lines
//! are only written once [`set_verbose`] has switched tracing on.

use std::fmt::Display;
use std::io::Write;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

/// Log level for filtering messages.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        })
    }
}

pub static SHOW_ELAPSED: AtomicBool = AtomicBool::new(false);
pub static SHOW_TYPE: AtomicBool = AtomicBool::new(true);
static VERBOSE: AtomicBool = AtomicBool::new(false);
static START: OnceLock<Instant> = OnceLock::new();

/// Enables or disables `debug!` output (instruction tracing).
pub fn set_verbose(on: bool) {
    VERBOSE.store(on, Ordering::Relaxed);
    START.get_or_init(Instant::now);
}

/// Prefixes every line with the time elapsed since logging was configured.
pub fn show_elapsed(on: bool) {
    SHOW_ELAPSED.store(on, Ordering::Relaxed);
    START.get_or_init(Instant::now);
}

/// Returns whether `debug!` output is currently enabled.
pub fn verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

fn level_color(level: Level) -> ColorSpec {
    let mut spec = ColorSpec::new();
    match level {
        Level::Debug => {
            spec.set_fg(Some(Color::Cyan));
        }
        Level::Info => {}
        Level::Warn => {
            spec.set_fg(Some(Color::Yellow)).set_bold(true);
        }
        Level::Error => {
            spec.set_fg(Some(Color::Red)).set_bold(true);
        }
    }
    spec
}

fn prefix(level: Level) -> String {
    let mut prefix = String::new();
    if SHOW_ELAPSED.load(Ordering::Relaxed) {
        let elapsed = START.get_or_init(Instant::now).elapsed();
        prefix.push_str(&format!("[{:>9.3}s] ", elapsed.as_secs_f64()));
    }
    if SHOW_TYPE.load(Ordering::Relaxed) {
        prefix.push_str(&format!("[{:5}] ", level));
    }
    prefix
}

/// Internal logging function. Use the level macros instead.
#[doc(hidden)]
pub fn log(level: Level, message: &str) {
    if level == Level::Debug && !verbose() {
        return;
    }

    let mut stderr = StandardStream::stderr(ColorChoice::Auto);
    let _ = stderr.set_color(&level_color(level));

    let _ = writeln!(stderr, "{}{}", prefix(level), message);
    let _ = stderr.reset();
}

/// Logs a debug-level message (only when verbose output is enabled).
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {{
        if cfg!(not(test)) && $crate::utils::log::verbose() {
            $crate::utils::log::log($crate::utils::log::Level::Debug, &format!($($arg)*))
        }
    }};
}

/// Logs an info-level message.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {{
        if cfg!(not(test)) {
            $crate::utils::log::log($crate::utils::log::Level::Info, &format!($($arg)*))
        }
    }};
}

/// Logs a warning-level message.
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {{
        if cfg!(not(test)) {
            $crate::utils::log::log($crate::utils::log::Level::Warn, &format!($($arg)*))
        }
    }};
}

/// Logs an error-level message.
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {{
        if cfg!(not(test)) {
            $crate::utils::log::log($crate::utils::log::Level::Error, &format!($($arg)*))
        }
    }};
}
