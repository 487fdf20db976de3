//! Storage settings loaded from TOML.
//!
//! ```toml
//! options = "host=localhost port=5432 user=postgres password=${PGPASSWORD}"
//! default_database = "wsv_default"
//! pool_size = 10
//!
//! [reconnection]
//! strategy = "k_times"
//! max_attempts = 3
//! delay = "500ms"
//! attempt_timeout = "30s"
//!
//! [schema]
//! role_permission_bits = 45
//! grantable_permission_bits = 6
//! ```
//!
//! `${VAR}` references are replaced with environment variables before
//! parsing.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{DEFAULT_DATABASE_NAME, PgOptions};
use crate::error::{PgError, PgResult};
use crate::failover::ReconnectOptions;
use crate::reconnect::{
    ExponentialBackoffStrategyFactory, KTimesReconnectionStrategyFactory,
    ReconnectionStrategyFactory,
};
use crate::schema::WsvSchema;

/// Top-level storage settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StorageSettings {
    /// libpq key/value string or `postgres://` URL.
    pub options: String,

    /// Database used when `options` does not name one.
    #[serde(default = "default_database")]
    pub default_database: String,

    /// Number of pooled sessions.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Reconnection policy.
    #[serde(default)]
    pub reconnection: ReconnectionSettings,

    /// World-state-view schema parameters.
    pub schema: SchemaSettings,
}

fn default_database() -> String { DEFAULT_DATABASE_NAME.to_string() }
fn default_pool_size() -> usize { 10 }

/// Reconnection strategy kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Fixed number of attempts with a constant delay.
    #[default]
    KTimes,
    /// Fixed number of attempts with a doubling delay.
    Exponential,
}

/// Reconnection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectionSettings {
    /// Strategy kind.
    #[serde(default)]
    pub strategy: StrategyKind,

    /// Attempts allowed per session lifetime.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before an attempt (initial delay for `exponential`).
    #[serde(default = "default_delay")]
    pub delay: String,

    /// Delay cap for `exponential`.
    #[serde(default = "default_max_delay")]
    pub max_delay: String,

    /// Connect timeout of a new physical connection.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,

    /// Upper bound for one attempt, connect plus restore.
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout: String,
}

impl Default for ReconnectionSettings {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            max_attempts: default_max_attempts(),
            delay: default_delay(),
            max_delay: default_max_delay(),
            connect_timeout: default_connect_timeout(),
            attempt_timeout: default_attempt_timeout(),
        }
    }
}

fn default_max_attempts() -> u32 { 3 }
fn default_delay() -> String { "0ms".to_string() }
fn default_max_delay() -> String { "10s".to_string() }
fn default_connect_timeout() -> String { "10s".to_string() }
fn default_attempt_timeout() -> String { "30s".to_string() }

/// Schema parameters. Both widths are required.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaSettings {
    /// Width of the role permission bit set.
    pub role_permission_bits: usize,
    /// Width of the grantable permission bit set.
    pub grantable_permission_bits: usize,
}

impl SchemaSettings {
    /// Schema built from these parameters.
    pub fn wsv_schema(&self) -> WsvSchema {
        WsvSchema::new(self.role_permission_bits, self.grantable_permission_bits)
    }
}

impl StorageSettings {
    /// Load settings from a file.
    pub fn from_file(path: impl AsRef<Path>) -> PgResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| PgError::Settings(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Parse settings from a TOML string.
    pub fn from_toml(content: &str) -> PgResult<Self> {
        let expanded = expand_env_vars(content);
        let settings: Self =
            toml::from_str(&expanded).map_err(|e| PgError::Settings(e.message().to_string()))?;
        if settings.pool_size == 0 {
            return Err(PgError::Settings("pool_size must be at least 1".to_string()));
        }
        Ok(settings)
    }

    /// Connection options.
    pub fn pg_options(&self) -> PgResult<PgOptions> {
        PgOptions::parse(&self.options, &self.default_database)
    }

    /// Reconnection timeouts.
    pub fn reconnect_options(&self) -> PgResult<ReconnectOptions> {
        Ok(ReconnectOptions {
            connect_timeout: parse_duration(&self.reconnection.connect_timeout)?,
            attempt_timeout: parse_duration(&self.reconnection.attempt_timeout)?,
        })
    }

    /// Strategy factory described by the reconnection section.
    pub fn strategy_factory(&self) -> PgResult<Arc<dyn ReconnectionStrategyFactory>> {
        let reconnection = &self.reconnection;
        let delay = parse_duration(&reconnection.delay)?;
        Ok(match reconnection.strategy {
            StrategyKind::KTimes => Arc::new(KTimesReconnectionStrategyFactory::with_delay(
                reconnection.max_attempts,
                delay,
            )),
            StrategyKind::Exponential => Arc::new(ExponentialBackoffStrategyFactory::new(
                reconnection.max_attempts,
                delay,
                parse_duration(&reconnection.max_delay)?,
            )),
        })
    }
}

/// Parse durations such as `"250ms"`, `"30s"`, `"2m"` or `"1h"`. A bare
/// number is taken as seconds.
pub fn parse_duration(value: &str) -> PgResult<Duration> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    let amount: u64 = digits
        .parse()
        .map_err(|_| PgError::Settings(format!("invalid duration '{}'", value)))?;

    let duration = match unit.trim() {
        "ms" => Duration::from_millis(amount),
        "" | "s" => Duration::from_secs(amount),
        "m" => Duration::from_secs(amount.saturating_mul(60)),
        "h" => Duration::from_secs(amount.saturating_mul(3600)),
        other => {
            return Err(PgError::Settings(format!(
                "invalid duration unit '{}' in '{}'",
                other, value
            )));
        }
    };
    Ok(duration)
}

fn expand_env_vars(content: &str) -> String {
    let Ok(re) = regex_lite::Regex::new(r"\$\{([^}]+)\}") else {
        return content.to_string();
    };
    re.replace_all(content, |caps: &regex_lite::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}
