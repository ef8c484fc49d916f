//! Logging bootstrap for the cabin agent.
//!
//! One call to [`init`] from `main` installs the global `tracing`
//! subscriber. Level resolution, in order of precedence:
//!
//! 1. an explicit level passed by the caller (the daemon's `--log-level`),
//! 2. the `RUST_LOG` environment variable,
//! 3. `"info"`.

use std::env;

use time::{format_description, UtcOffset};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::prelude::*;

/// Error type for telemetry initialisation failures.
///
/// Kept free of workspace dependencies so the daemon can report failures
/// before anything else is constructed.
#[derive(Debug)]
pub enum TelemetryError {
    /// The provided filter expression could not be parsed.
    InvalidFilter(String),

    /// A global subscriber was already installed.
    SubscriberInit(String),
}

impl std::fmt::Display for TelemetryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TelemetryError::InvalidFilter(expr) => write!(f, "invalid log filter: {}", expr),
            TelemetryError::SubscriberInit(msg) => {
                write!(f, "failed to init telemetry: {}", msg)
            }
        }
    }
}

impl std::error::Error for TelemetryError {}

/// Result alias for telemetry operations.
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Install the global logging subscriber.
///
/// `level` accepts either a plain level (`"debug"`) or a full `EnvFilter`
/// expression (`"info,cabin_server=trace"`). Calling `init` twice returns
/// [`TelemetryError::SubscriberInit`] for the second call.
pub fn init(level: Option<&str>) -> Result<()> {
    let filter = resolve_filter(level)?;

    let timer = OffsetTime::new(
        UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC),
        format_description::parse(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]",
        )
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?,
    );

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(timer);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))
}

/// Resolve the effective `EnvFilter` per the precedence documented on
/// [`init`].
fn resolve_filter(level: Option<&str>) -> Result<EnvFilter> {
    match level {
        Some(expr) => EnvFilter::builder()
            .parse(expr)
            .map_err(|e| TelemetryError::InvalidFilter(format!("{} ({})", expr, e))),
        None if env::var("RUST_LOG").is_ok() => Ok(EnvFilter::from_default_env()),
        None => Ok(EnvFilter::new("info")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_plain_level() {
        resolve_filter(Some("debug")).expect("plain level parses");
    }

    #[test]
    fn resolves_filter_expression() {
        resolve_filter(Some("info,cabin_server=trace")).expect("expression parses");
    }

    #[test]
    fn resolves_default_without_level() {
        // May pick up RUST_LOG from the environment; either branch must
        // produce a usable filter.
        resolve_filter(None).expect("default resolves");
    }
}
