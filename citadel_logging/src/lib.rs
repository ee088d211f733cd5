//! Logging bootstrap shared by the port mapping client, its tests, and the daemon embedding it.
//!
//! Library code logs through the `log` facade with `target: "citadel"`. The subscriber installed
//! here bridges those records into `tracing` so both end up in the same formatted output.
pub use tracing::{self, debug, error, info, instrument, trace, warn};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::SubscriberBuilder;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Used when `RUST_LOG` is unset or unparsable
pub const DEFAULT_DIRECTIVES: &str = "citadel=info";

/// Sets up the logging for any crate
pub fn setup_log() {
    std::panic::set_hook(Box::new(|info| {
        error!(target: "citadel", "Panic occurred: {}", info);
        std::process::exit(1);
    }));

    setup_log_no_panic_hook()
}

pub fn setup_log_no_panic_hook() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));
    setup_log_with_filter(filter)
}

/// Installs the subscriber with explicit directives, ignoring `RUST_LOG`.
/// Subsequent calls are no-ops; the first installed subscriber wins.
pub fn setup_log_with_directives(directives: &str) {
    setup_log_with_filter(EnvFilter::new(directives))
}

fn setup_log_with_filter(filter: EnvFilter) {
    let _ = SubscriberBuilder::default()
        .with_line_number(true)
        .with_file(true)
        .with_target(true)
        .with_span_events(FmtSpan::NONE)
        .with_env_filter(filter)
        .finish()
        .try_init();
}
