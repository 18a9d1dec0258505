//! Fail-fast handling for broken invariants.
//!
//! A corrupted worker state word or an impossible poll result means the
//! process can no longer reason about its sockets or threads. Those paths end
//! here instead of unwinding through the worker loop.

use crate::trace::error;

/// Logs `message` and aborts the process.
#[cold]
#[inline(never)]
#[track_caller]
pub fn fail_fast(message: &str) -> ! {
    let location = std::panic::Location::caller();
    error!(%location, "fatal: {message}");
    eprintln!("udpmux: fatal: {message} at {location}");
    std::process::abort()
}
