//! Tracing subscriber setup.
//!
//! Logs go to stderr; stdout carries reports and JSON output.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the default level (`debug` when verbose, else `info`).
pub fn init(verbose: bool, json_format: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .with_ansi(true),
            )
            .init();
    }
}

/// Install the subscriber from `[logging]`, letting CLI flags win.
pub fn init_from_config(config: &clipsort_core::Config, verbose: bool, json_logs: bool) {
    let (verbose, json_format) = resolve(config, verbose, json_logs);
    init(verbose, json_format);
}

fn resolve(config: &clipsort_core::Config, verbose: bool, json_logs: bool) -> (bool, bool) {
    let level = config.logging.level.to_lowercase();
    (
        verbose || level == "debug" || level == "trace",
        json_logs || config.logging.format.eq_ignore_ascii_case("json"),
    )
}
