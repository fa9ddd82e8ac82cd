//! Tracing and logging setup for Bulwark.
//!
//! Provides structured logging with configurable output formats (pretty or
//! JSON) and environment-based log level filtering. Audit events are written
//! to the `bulwark::audit` target, so they can be routed separately, e.g.
//! `RUST_LOG=info,bulwark::audit=warn`.
//!
//! # Example
//!
//! ```rust,ignore
//! use bulwark::tracing_setup::{setup_logging, should_use_json};
//!
//! setup_logging(should_use_json(), "info");
//! ```

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    prelude::*,
    EnvFilter,
};

/// Environment variable that switches output to JSON.
pub const LOG_JSON_ENV: &str = "BULWARK_LOG_JSON";

/// Initialize the tracing subscriber with configurable format.
///
/// # Arguments
///
/// * `json` - If true, output logs in JSON format (for machine parsing).
///   If false, use human-readable pretty format.
/// * `default_level` - Default filter if `RUST_LOG` is not set.
///
/// Returns `false` when a global subscriber was already installed, which
/// happens when an embedding application configured its own.
pub fn setup_logging(json: bool, default_level: &str) -> bool {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
            .is_ok()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init()
            .is_ok()
    }
}

/// Check if JSON logging is requested via `BULWARK_LOG_JSON`.
pub fn should_use_json() -> bool {
    json_requested(std::env::var(LOG_JSON_ENV).ok().as_deref())
}

fn json_requested(value: Option<&str>) -> bool {
    value
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
