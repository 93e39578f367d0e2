//! Process-wide Prometheus instruments.
//!
//! The instruments are created and registered into
//! [`prometheus::default_registry`] exactly once per process. Every limiter
//! resolves its handles through [`LimiterMetrics::global`], so constructing
//! several limiters (tests, sidecars) never trips a duplicate registration.

use std::sync::OnceLock;

use prometheus::{IntCounter, IntGauge, Registry};

use crate::Error;

static GLOBAL: OnceLock<Result<LimiterMetrics, String>> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct LimiterMetrics {
    /// Every call to `allow_attempt`.
    pub login_attempts: IntCounter,
    pub login_success: IntCounter,
    pub login_failure: IntCounter,
    /// Each distinct lockout creation.
    pub account_lockouts: IntCounter,
    /// Each `allow_attempt` that returned a denial.
    pub rate_limit_exceeded: IntCounter,
    pub active_locked_accounts: IntGauge,
}

impl LimiterMetrics {
    /// Handles to the process-wide instruments, registering them on first use.
    ///
    /// # Errors
    /// Returns [`Error::Metrics`] if registration failed, e.g. because another
    /// component already registered a metric under one of these names.
    pub fn global() -> Result<&'static LimiterMetrics, Error> {
        GLOBAL
            .get_or_init(|| {
                LimiterMetrics::register(prometheus::default_registry()).map_err(|e| e.to_string())
            })
            .as_ref()
            .map_err(|e| Error::Metrics(e.clone()))
    }

    /// Create the instruments and register them into `registry`.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self {
            login_attempts: IntCounter::new("auth_login_attempts_total", "Total login attempts")?,
            login_success: IntCounter::new(
                "auth_login_success_total",
                "Total successful logins",
            )?,
            login_failure: IntCounter::new("auth_login_failure_total", "Total failed logins")?,
            account_lockouts: IntCounter::new(
                "auth_account_lockouts_total",
                "Total account lockouts",
            )?,
            rate_limit_exceeded: IntCounter::new(
                "auth_rate_limit_exceeded_total",
                "Total login attempts rejected by the rate limiter",
            )?,
            active_locked_accounts: IntGauge::new(
                "auth_active_locked_accounts",
                "Number of currently locked accounts",
            )?,
        };

        registry.register(Box::new(metrics.login_attempts.clone()))?;
        registry.register(Box::new(metrics.login_success.clone()))?;
        registry.register(Box::new(metrics.login_failure.clone()))?;
        registry.register(Box::new(metrics.account_lockouts.clone()))?;
        registry.register(Box::new(metrics.rate_limit_exceeded.clone()))?;
        registry.register(Box::new(metrics.active_locked_accounts.clone()))?;

        Ok(metrics)
    }
}
