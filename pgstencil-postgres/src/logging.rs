//! Logging setup.
//!
//! pgstencil logs through `tracing`. Applications that already install a
//! subscriber need nothing from this module. With the `tracing-subscriber`
//! feature, [`init`] installs one controlled by the environment:
//!
//! - `PGSTENCIL_DEBUG=true|1|yes` enables debug logging
//! - `PGSTENCIL_LOG_LEVEL=trace|debug|info|warn|error` sets the level
//! - `PGSTENCIL_LOG_FORMAT=json|pretty|compact` sets the format (default: json)
//!
//! ```rust,no_run
//! pgstencil_postgres::logging::init();
//! ```

use std::env;
use std::sync::Once;

static INIT: Once = Once::new();

const DEBUG_VAR: &str = "PGSTENCIL_DEBUG";
const LEVEL_VAR: &str = "PGSTENCIL_LOG_LEVEL";
const FORMAT_VAR: &str = "PGSTENCIL_LOG_FORMAT";

/// Check if `PGSTENCIL_DEBUG` is set to "true", "1" or "yes".
#[inline]
pub fn is_debug_enabled() -> bool {
    env::var(DEBUG_VAR)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

/// The configured log level.
///
/// Defaults to "debug" when `PGSTENCIL_DEBUG` is enabled, otherwise "warn".
pub fn log_level() -> &'static str {
    let fallback = if is_debug_enabled() { "debug" } else { "warn" };
    match env::var(LEVEL_VAR) {
        Ok(level) => match level.to_lowercase().as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "info" => "info",
            "warn" => "warn",
            "error" => "error",
            _ => fallback,
        },
        Err(_) => fallback,
    }
}

/// The configured log format.
pub fn log_format() -> &'static str {
    env::var(FORMAT_VAR)
        .map(|f| match f.to_lowercase().as_str() {
            "pretty" => "pretty",
            "compact" => "compact",
            _ => "json",
        })
        .unwrap_or("json")
}

/// Filter directive covering the pgstencil crates at `level`.
pub fn filter_directive(level: &str) -> String {
    ["pgstencil", "pgstencil_template", "pgstencil_postgres"]
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global subscriber. Later calls are no-ops, and nothing is
/// installed unless `PGSTENCIL_DEBUG` or `PGSTENCIL_LOG_LEVEL` is set.
pub fn init() {
    INIT.call_once(|| {
        if !is_debug_enabled() && env::var(LEVEL_VAR).is_err() {
            return;
        }

        #[cfg(feature = "tracing-subscriber")]
        {
            use tracing_subscriber::{EnvFilter, fmt, prelude::*};

            let level = log_level();
            let filter = EnvFilter::try_new(filter_directive(level))
                .unwrap_or_else(|_| EnvFilter::new("warn"));

            let installed = match log_format() {
                "json" => tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().json())
                    .try_init(),
                "compact" => tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().compact())
                    .try_init(),
                _ => tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().pretty())
                    .try_init(),
            };

            if installed.is_ok() {
                tracing::info!(level, format = log_format(), "pgstencil logging initialized");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directive() {
        assert_eq!(
            filter_directive("debug"),
            "pgstencil=debug,pgstencil_template=debug,pgstencil_postgres=debug"
        );
    }

    #[test]
    fn test_defaults_without_env() {
        // SAFETY: no other test touches these variables
        unsafe {
            env::remove_var(DEBUG_VAR);
            env::remove_var(LEVEL_VAR);
            env::remove_var(FORMAT_VAR);
        }
        assert!(!is_debug_enabled());
        assert_eq!(log_level(), "warn");
        assert_eq!(log_format(), "json");
    }
}
