//! Logging for udpmux.
//!
//! Built with `--features tracing`, the crate logs through [`tracing`]:
//! lifecycle events at `info`, attach/eviction problems at `warn`, and
//! per-datagram traffic at `trace`. Without the feature every log macro
//! expands to nothing, so the worker loop carries no logging cost.

/// Default filter used when `RUST_LOG` is unset.
pub const DEFAULT_DIRECTIVES: &str = "udpmux=trace";

/// Installs a subscriber filtered by `RUST_LOG`, or by [`DEFAULT_DIRECTIVES`].
///
/// Safe to call more than once; only the first call installs anything.
/// Does nothing if the `tracing` feature is not enabled.
pub fn init_tracing() {
    init_tracing_with(DEFAULT_DIRECTIVES);
}

/// Like [`init_tracing`], with `directives` (e.g. `"udpmux=info"`) as the
/// fallback filter.
#[cfg(feature = "tracing")]
pub fn init_tracing_with(directives: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));

    // Worker logs are only useful with the thread name attached.
    let layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_timer(fmt::time::uptime());

    let _ = tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init();
}

#[cfg(not(feature = "tracing"))]
pub fn init_tracing_with(_directives: &str) {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing"))]
macro_rules! discard {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use discard as debug;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as error;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as info;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as trace;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as warn;
