//! Logging initialization and configuration.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Filter used when neither `RUST_LOG` nor an explicit filter is set.
const DEFAULT_FILTER: &str = "info,cadence_rhi=debug,cadence_renderer=debug";

/// Initialize the logging system with tracing.
///
/// This sets up tracing-subscriber with:
/// - Environment-based filtering (RUST_LOG)
/// - Target and thread id on every line, since submissions, GPU completion
///   and presentation may be driven from different threads
///
/// # Example
/// ```
/// cadence_core::init_logging();
/// tracing::info!("Frame loop starting");
/// ```
pub fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    install(filter);
}

/// Initialize logging with an explicit filter directive, e.g. from a config file.
///
/// `RUST_LOG` still takes precedence when it is set. An unparsable directive
/// falls back to the default filter.
pub fn init_logging_with_filter(directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    install(filter);
}

fn install(filter: EnvFilter) {
    // A second initialization (tests, embedding applications) is not an error.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .try_init();
}
