//! # Turnstile
//!
//! Turnstile throttles authentication attempts per principal and locks
//! principals out after repeated failures. A principal is whatever the
//! caller scopes limiting to: an IP address, a normalized username, or a
//! composite of both.
//!
//! A login handler consults the limiter before verifying credentials and
//! reports the outcome afterwards:
//!
//! ```rust,no_run
//! use turnstile::{LimiterConfig, RequestContext, new_limiter};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), turnstile::Error> {
//!     let limiter = new_limiter(LimiterConfig::default()).await?;
//!     let ctx = RequestContext::background();
//!
//!     let decision = limiter.allow_attempt(&ctx, "user@example.com").await?;
//!     if !decision.is_allowed() {
//!         println!("retry in {:?}", decision.retry_after());
//!         return Ok(());
//!     }
//!
//!     let credentials_ok = false;
//!     if credentials_ok {
//!         limiter.record_success(&ctx, "user@example.com").await?;
//!     } else {
//!         limiter.record_failure(&ctx, "user@example.com").await?;
//!     }
//!
//!     limiter.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Storage Support
//!
//! - In-process memory (`memory` feature, default)
//! - Redis, shared by any number of processes (`redis` feature)
//!
//! ## Metrics
//!
//! Counters and the locked-accounts gauge are registered once per process in
//! the default Prometheus registry; see [`LimiterMetrics`].
mod builder;

pub use builder::{TurnstileBuilder, new_limiter};

/// Re-export core types from turnstile_core
pub use turnstile_core::{
    AuthLimiter, BackendError, BackendKind, CancelHandle, Clock, CounterMode, DEFAULT_KEY_PREFIX,
    Decision, DenialReason, Error, ErrorKind, FailureOutcome, LimiterBackend, LimiterConfig,
    LimiterMetrics, Lockout, LockoutNotifier, LockoutStatus, ManualClock, NotifierError,
    RedisConfig, RequestContext, SweepReport, SystemClock,
};

#[cfg(feature = "memory")]
pub use turnstile_storage_memory::MemoryBackend;

#[cfg(feature = "redis")]
pub use turnstile_storage_redis::RedisBackend;
