//! Diagnostic logging for the orchestrator and its workers.
//!
//! Enable with `--features tracing`. Without the feature every macro expands
//! to nothing, so the measured send/receive loops carry no logging cost.

/// Initialize the tracing subscriber with timestamps.
///
/// Call this at the start of the binary or a test to enable log output.
/// The filter defaults to `hackbench=debug` and honours `RUST_LOG`.
/// Does nothing if the `tracing` feature is not enabled.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hackbench=debug"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(false)
                .with_line_number(false)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

// When tracing is enabled, re-export macros from the tracing crate.
#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, trace, warn};

// Without tracing the arguments still type-check, so a variable that is only
// logged does not trip `unused_variables`, but nothing is formatted.
#[cfg(not(feature = "tracing"))]
macro_rules! disabled {
    ($($arg:tt)*) => {
        if false {
            let _ = ::core::format_args!($($arg)*);
        }
    };
}

#[cfg(not(feature = "tracing"))]
pub(crate) use {
    disabled as debug, disabled as error, disabled as info, disabled as trace, disabled as warn,
};
