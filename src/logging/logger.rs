// file: src/logging/logger.rs
// version: 2.0.0
// guid: j0k1l2m3-n4o5-6789-0123-456789jklmno

//! Logger initialization and configuration

use crate::error::ProvisionError;
use crate::Result;
use tracing::Instrument;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Dependencies that are chatty at debug level
const QUIET_DEPENDENCIES: &[&str] = &["bollard", "hyper", "hyper_util", "reqwest", "h2"];

/// Directive string for a crate level, keeping transport crates at warn
pub fn filter_directives(level: &str) -> String {
    let mut directives = vec![level.to_string()];
    directives.extend(QUIET_DEPENDENCIES.iter().map(|dep| format!("{}=warn", dep)));
    directives.join(",")
}

/// `RUST_LOG` wins over the flags when set
fn build_filter(verbose: bool, quiet: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = match (quiet, verbose) {
        (true, _) => "error",
        (false, true) => "debug",
        (false, false) => "info",
    };
    EnvFilter::new(filter_directives(level))
}

/// Human readable logs on stderr; stdout is left to command output
pub fn init_logger(verbose: bool, quiet: bool) -> Result<()> {
    tracing_subscriber::registry()
        .with(build_filter(verbose, quiet))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .try_init()
        .map_err(|e| ProvisionError::config(format!("Failed to initialize logger: {}", e)))
}

/// One JSON object per event on stderr, with the current span's fields
pub fn init_json_logger() -> Result<()> {
    tracing_subscriber::registry()
        .with(build_filter(false, false))
        .with(
            fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_current_span(true),
        )
        .try_init()
        .map_err(|e| ProvisionError::config(format!("Failed to initialize JSON logger: {}", e)))
}

/// Run `f` inside an `operation` span
pub fn with_operation_span<F, R>(operation: &str, f: F) -> R
where
    F: FnOnce() -> R,
{
    let span = tracing::info_span!("operation", name = operation);
    let _enter = span.enter();
    f()
}

/// Async variant of [`with_operation_span`]
pub async fn with_async_operation_span<F, Fut, R>(operation: &str, f: F) -> R
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = R>,
{
    let span = tracing::info_span!("operation", name = operation);
    f().instrument(span).await
}
