//! Unrecoverable conditions
//!
//! An entry stuck initializing would hang every later caller on that key,
//! so anything that could leave one behind ends the process instead.

use std::fmt;

/// Log the message, print it to stderr, and abort the process
#[cold]
#[inline(never)]
pub fn fatal_error(args: fmt::Arguments<'_>) -> ! {
    tracing::error!(name: "permacache::fatal", message = %args);
    eprintln!("permacache: fatal: {}", args);
    std::process::abort()
}

/// Aborts the process if dropped while the current thread is unwinding
///
/// Hold one of these across a call that must not be allowed to fail halfway.
#[derive(Debug)]
pub struct AbortOnUnwind {
    pub what: &'static str,
}

impl Drop for AbortOnUnwind {
    fn drop(&mut self) {
        if std::thread::panicking() {
            fatal_error(format_args!("panic while {}", self.what));
        }
    }
}
