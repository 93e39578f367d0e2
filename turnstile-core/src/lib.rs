//! Core types and decision engine for turnstile, a login rate limiter with
//! account lockout.
//!
//! This crate defines the [`LimiterBackend`] contract that storage crates
//! implement and the [`AuthLimiter`] engine that drives it. Most applications
//! should depend on the `turnstile` facade instead, which selects a backend
//! from [`LimiterConfig`].
//!
//! Two gates protect every principal:
//!
//! - a sliding-by-reset attempt window admitting at most
//!   `max_login_attempts` per `login_window`
//! - a lockout of `lockout_duration` created once failures reach
//!   `max_login_attempts`
//!
//! An active lockout always takes precedence over an exhausted window.
pub mod backend;
pub mod clock;
pub mod config;
pub mod context;
pub mod decision;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod notifier;

pub use backend::{
    AttemptOutcome, FailureRecord, LimiterBackend, Lockout, LockoutState, SweepReport,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    BackendKind, CounterMode, DEFAULT_KEY_PREFIX, LimitPolicy, LimiterConfig, MAX_PERIOD,
    RedisConfig,
};
pub use context::{CancelHandle, RequestContext};
pub use decision::{Decision, DenialReason, FailureOutcome, LockoutStatus};
pub use error::{BackendError, Error, ErrorKind};
pub use limiter::{AuthLimiter, LimiterBuilder};
pub use metrics::LimiterMetrics;
pub use notifier::{LockoutNotifier, NotificationDispatcher, NotifierError};
