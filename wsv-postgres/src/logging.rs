//! Logging setup.
//!
//! Storage code logs through `tracing`; pool sessions and their failover
//! callbacks log under child spans carrying their `slot`. This module only
//! installs a subscriber for binaries and tests that do not bring their own.
//!
//! # Environment Variables
//!
//! - `WSV_DEBUG=true|1|yes` - Enable debug logging
//! - `WSV_LOG_LEVEL=trace|debug|info|warn|error` - Set a specific level
//! - `WSV_LOG_FORMAT=json|pretty|compact` - Output format (default: json)

use std::env;
use std::sync::Once;

static INIT: Once = Once::new();

/// Check if debug logging is enabled via `WSV_DEBUG`.
#[inline]
pub fn is_debug_enabled() -> bool {
    env::var("WSV_DEBUG")
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

/// Log level from `WSV_LOG_LEVEL`, falling back to `debug` when
/// `WSV_DEBUG` is set and `warn` otherwise.
pub fn get_log_level() -> &'static str {
    let fallback = if is_debug_enabled() { "debug" } else { "warn" };
    match env::var("WSV_LOG_LEVEL") {
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

/// Output format from `WSV_LOG_FORMAT`.
pub fn get_log_format() -> &'static str {
    env::var("WSV_LOG_FORMAT")
        .map(|f| match f.to_lowercase().as_str() {
            "pretty" => "pretty",
            "compact" => "compact",
            _ => "json",
        })
        .unwrap_or("json")
}

/// Install the global subscriber once. Later calls are no-ops, and nothing is
/// installed unless `WSV_DEBUG` or `WSV_LOG_LEVEL` is set.
pub fn init() {
    INIT.call_once(|| {
        if !is_debug_enabled() && env::var("WSV_LOG_LEVEL").is_err() {
            return;
        }

        #[cfg(feature = "tracing-subscriber")]
        {
            use tracing_subscriber::{EnvFilter, fmt, prelude::*};

            let level = get_log_level();
            let filter = EnvFilter::try_new(format!("wsv_postgres={},wsv_store={}", level, level))
                .unwrap_or_else(|_| EnvFilter::new("warn"));

            let installed = match get_log_format() {
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
                tracing::info!(level, format = get_log_format(), "Storage logging initialized");
            }
        }
    });
}
