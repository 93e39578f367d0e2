//! Factory for [`AuthLimiter`] instances.
//!
//! The builder picks a storage backend from [`LimiterConfig::backend`],
//! constructs it, and hands it to the engine.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use turnstile::{LimiterConfig, TurnstileBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), turnstile::Error> {
//!     let config = LimiterConfig {
//!         max_login_attempts: 3,
//!         lockout_duration: Duration::from_secs(30 * 60),
//!         ..LimiterConfig::default()
//!     };
//!     let limiter = TurnstileBuilder::new(config).build().await?;
//!     limiter.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use turnstile_core::{
    AuthLimiter, BackendKind, Clock, Error, LimiterBackend, LimiterConfig, LockoutNotifier,
};

// ============================================================================
// Builder Implementation
// ============================================================================

/// Builds an [`AuthLimiter`] from configuration.
pub struct TurnstileBuilder {
    config: LimiterConfig,
    backend: Option<Arc<dyn LimiterBackend>>,
    clock: Option<Arc<dyn Clock>>,
    notifier: Option<Arc<dyn LockoutNotifier>>,
    cleanup_task: bool,
}

impl TurnstileBuilder {
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            config,
            backend: None,
            clock: None,
            notifier: None,
            cleanup_task: true,
        }
    }

    /// Notifier used when `notifications_enabled` is set.
    pub fn with_notifier(mut self, notifier: Arc<dyn LockoutNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Replace the wall clock, typically with a
    /// [`ManualClock`](turnstile_core::ManualClock) in tests.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use an already constructed backend instead of building one from the
    /// configuration. Its kind must still match `config.backend`.
    pub fn with_backend(mut self, backend: Arc<dyn LimiterBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Do not start the periodic sweeper.
    pub fn without_cleanup_task(mut self) -> Self {
        self.cleanup_task = false;
        self
    }

    /// Validate the configuration, connect the backend and start the limiter.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] for invalid configuration or a backend
    ///   whose cargo feature is disabled
    /// - [`Error::Backend`] if the distributed store is unreachable
    pub async fn build(self) -> Result<AuthLimiter, Error> {
        self.config.validate()?;

        let backend = match self.backend {
            Some(backend) => backend,
            None => connect_backend(&self.config).await?,
        };

        let mut builder = AuthLimiter::builder(self.config, backend);
        if let Some(clock) = self.clock {
            builder = builder.with_clock(clock);
        }
        if let Some(notifier) = self.notifier {
            builder = builder.with_notifier(notifier);
        }
        if !self.cleanup_task {
            builder = builder.without_cleanup_task();
        }

        builder.build()
    }
}

/// Build a limiter from configuration with the wall clock and no notifier.
pub async fn new_limiter(config: LimiterConfig) -> Result<AuthLimiter, Error> {
    TurnstileBuilder::new(config).build().await
}

async fn connect_backend(config: &LimiterConfig) -> Result<Arc<dyn LimiterBackend>, Error> {
    match config.backend {
        BackendKind::Memory => memory_backend(),
        BackendKind::Redis => redis_backend(config).await,
    }
}

#[cfg(feature = "memory")]
fn memory_backend() -> Result<Arc<dyn LimiterBackend>, Error> {
    Ok(Arc::new(turnstile_storage_memory::MemoryBackend::new()))
}

#[cfg(not(feature = "memory"))]
fn memory_backend() -> Result<Arc<dyn LimiterBackend>, Error> {
    Err(feature_disabled(BackendKind::Memory))
}

#[cfg(feature = "redis")]
async fn redis_backend(config: &LimiterConfig) -> Result<Arc<dyn LimiterBackend>, Error> {
    let backend = turnstile_storage_redis::RedisBackend::connect(&config.redis).await?;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "redis"))]
async fn redis_backend(_config: &LimiterConfig) -> Result<Arc<dyn LimiterBackend>, Error> {
    Err(feature_disabled(BackendKind::Redis))
}

#[cfg(any(not(feature = "memory"), not(feature = "redis")))]
fn feature_disabled(kind: BackendKind) -> Error {
    tracing::error!(backend = %kind, "Backend support not compiled in");
    Error::InvalidArgument(format!(
        "the {kind} backend requires the `{kind}` cargo feature"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_config_rejected_before_connecting() {
        let config = LimiterConfig {
            max_login_attempts: 0,
            ..LimiterConfig::default()
        };
        let result = TurnstileBuilder::new(config).build().await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[cfg(feature = "memory")]
    #[tokio::test]
    async fn test_default_config_builds_memory_limiter() {
        let limiter = new_limiter(LimiterConfig::default()).await.unwrap();
        assert_eq!(limiter.backend_kind(), BackendKind::Memory);
        limiter.shutdown().await;
    }

    #[cfg(not(feature = "redis"))]
    #[tokio::test]
    async fn test_redis_without_feature_is_invalid() {
        let result = new_limiter(LimiterConfig::redis("redis://127.0.0.1:6379")).await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[cfg(feature = "redis")]
    #[tokio::test]
    async fn test_unreachable_redis_is_backend_error() {
        let mut config = LimiterConfig::redis("redis://192.0.2.1:6379");
        config.redis.connect_timeout = std::time::Duration::from_millis(200);
        let result = new_limiter(config).await;
        assert!(matches!(result, Err(Error::Backend(_))));
    }
}
