//! Tracing subscriber installation for binaries and harnesses.

use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

/// Errors raised while installing the subscriber.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LoggingError {
    /// Raised when the fallback filter expression is invalid.
    #[error("invalid log filter {filter:?}: {message}")]
    InvalidFilter {
        /// Rejected filter expression.
        filter: String,
        /// Parser error message.
        message: String,
    },
    /// Raised when a global subscriber is already installed.
    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialised,
}

/// Builds the filter from `RUST_LOG`, falling back to `default_filter`.
///
/// # Errors
///
/// Returns [`LoggingError::InvalidFilter`] when `default_filter` is needed and
/// does not parse.
pub fn env_filter(default_filter: &str) -> Result<EnvFilter, LoggingError> {
    EnvFilter::try_from_default_env().or_else(|_| {
        EnvFilter::try_new(default_filter).map_err(|err| LoggingError::InvalidFilter {
            filter: default_filter.to_owned(),
            message: err.to_string(),
        })
    })
}

/// Installs a compact stderr formatter filtered by `RUST_LOG`.
///
/// # Errors
///
/// Returns [`LoggingError`] when the filter is invalid or a subscriber is
/// already installed.
pub fn init_logging(default_filter: &str) -> Result<(), LoggingError> {
    let fmt_layer = fmt::layer()
        .compact()
        .without_time()
        .with_target(false)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter(default_filter)?)
        .with(fmt_layer)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialised)
}
