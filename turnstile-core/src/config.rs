//! Limiter configuration.
//!
//! Configuration is fixed once a limiter is constructed. [`LimiterConfig`]
//! deserializes from any serde format with durations written as human-readable
//! strings (`"15m"`, `"100ms"`), and every field has a default so partial
//! documents are accepted.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::Error;
use crate::error::invalid_argument;

/// Key prefix used by the distributed backend.
pub const DEFAULT_KEY_PREFIX: &str = "auth_limiter:";

/// Upper bound on every configured period, roughly one hundred years.
pub const MAX_PERIOD: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Which storage backend holds the attempt and lockout records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Single-process maps; state is lost on restart.
    #[default]
    Memory,
    /// Shared Redis-compatible key-value store.
    #[serde(alias = "external")]
    Redis,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Memory => "memory",
            BackendKind::Redis => "redis",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(BackendKind::Memory),
            "redis" | "external" => Ok(BackendKind::Redis),
            other => Err(invalid_argument(format!("unknown backend kind: {other}"))),
        }
    }
}

/// Whether admissions and failures share one counter.
///
/// With `Shared`, every admitted attempt and every recorded failure count
/// toward `max_login_attempts`, so a burst of legitimate attempts can lock a
/// principal out. With `Separate`, admissions are rate limited on their own
/// counter and only failures drive lockouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterMode {
    #[default]
    Shared,
    Separate,
}

/// Connection parameters for the distributed backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379`.
    pub url: String,
    /// Prepended to every key the backend writes.
    pub key_prefix: String,
    /// Upper bound on the construction-time ping.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Configuration for an [`AuthLimiter`](crate::AuthLimiter).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Attempts (or failures) tolerated within one window.
    pub max_login_attempts: u32,
    /// Length of the per-identifier counting window.
    #[serde(with = "humantime_serde")]
    pub login_window: Duration,
    /// How long a principal stays locked once the threshold is crossed.
    #[serde(with = "humantime_serde")]
    pub lockout_duration: Duration,
    pub backend: BackendKind,
    pub redis: RedisConfig,
    /// Dispatch lockout notifications when a notifier is configured.
    pub notifications_enabled: bool,
    pub counter_mode: CounterMode,
    /// How often the background sweeper runs.
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    /// Budget given to a single notifier call.
    #[serde(with = "humantime_serde")]
    pub notification_timeout: Duration,
    /// How long `shutdown` waits for in-flight notifications.
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_login_attempts: 5,
            login_window: Duration::from_secs(15 * 60),
            lockout_duration: Duration::from_secs(15 * 60),
            backend: BackendKind::Memory,
            redis: RedisConfig::default(),
            notifications_enabled: false,
            counter_mode: CounterMode::Shared,
            cleanup_interval: Duration::from_secs(5 * 60),
            notification_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl LimiterConfig {
    /// Configuration using the distributed backend at `url`.
    pub fn redis(url: impl Into<String>) -> Self {
        Self {
            backend: BackendKind::Redis,
            redis: RedisConfig {
                url: url.into(),
                ..RedisConfig::default()
            },
            ..Self::default()
        }
    }

    /// Check the invariants every limiter relies on.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_login_attempts == 0 {
            return Err(invalid_argument("max_login_attempts must be at least 1"));
        }
        check_period("login_window", self.login_window)?;
        check_period("lockout_duration", self.lockout_duration)?;
        check_period("cleanup_interval", self.cleanup_interval)?;
        if self.backend == BackendKind::Redis {
            if self.redis.url.trim().is_empty() {
                return Err(invalid_argument("redis.url is required for the redis backend"));
            }
            if self.redis.key_prefix.is_empty() {
                return Err(invalid_argument("redis.key_prefix must not be empty"));
            }
            if self.redis.connect_timeout.is_zero() {
                return Err(invalid_argument("redis.connect_timeout must be positive"));
            }
        }
        Ok(())
    }

    /// The subset of configuration every backend operation needs.
    pub fn policy(&self) -> LimitPolicy {
        LimitPolicy {
            max_attempts: self.max_login_attempts,
            window: self.login_window,
            lockout: self.lockout_duration,
            counter_mode: self.counter_mode,
        }
    }
}

fn check_period(name: &str, period: Duration) -> Result<(), Error> {
    if period.is_zero() {
        return Err(invalid_argument(format!("{name} must be positive")));
    }
    if period > MAX_PERIOD {
        return Err(invalid_argument(format!(
            "{name} must not exceed {} days",
            MAX_PERIOD.as_secs() / (24 * 60 * 60)
        )));
    }
    Ok(())
}

/// Limits passed to backend operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitPolicy {
    pub max_attempts: u32,
    pub window: Duration,
    pub lockout: Duration,
    pub counter_mode: CounterMode,
}

impl LimitPolicy {
    pub fn window_delta(&self) -> TimeDelta {
        TimeDelta::from_std(self.window).unwrap_or(TimeDelta::MAX)
    }

    pub fn lockout_delta(&self) -> TimeDelta {
        TimeDelta::from_std(self.lockout).unwrap_or(TimeDelta::MAX)
    }
}
