//! The decision engine.
//!
//! [`AuthLimiter`] is consulted by a login adapter before and after credential
//! verification:
//!
//! ```rust,ignore
//! let decision = limiter.allow_attempt(&ctx, &identifier).await?;
//! if !decision.is_allowed() {
//!     // 429 with Retry-After: decision.retry_after()
//! }
//! if verify(credentials).await? {
//!     limiter.record_success(&ctx, &identifier).await?;
//! } else {
//!     limiter.record_failure(&ctx, &identifier).await?;
//! }
//! ```
//!
//! Backend errors are returned as-is; the engine never fabricates an
//! "allowed" or "rejected" decision when the backend cannot answer. Adapters
//! are expected to fail closed on [`Error::Backend`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::{
    AttemptOutcome, BackendKind, Clock, Decision, DenialReason, Error, FailureOutcome,
    LimitPolicy, LimiterBackend, LimiterConfig, LimiterMetrics, LockoutNotifier, LockoutState,
    LockoutStatus, NotificationDispatcher, RequestContext, SweepReport, SystemClock,
    error::invalid_argument,
};

/// Login rate limiter with account lockout.
///
/// Cheap to clone; clones share the backend, metrics, sweeper and notifier.
#[derive(Clone, Debug)]
pub struct AuthLimiter {
    inner: Arc<LimiterInner>,
}

#[derive(Debug)]
struct LimiterInner {
    config: LimiterConfig,
    policy: LimitPolicy,
    backend: Arc<dyn LimiterBackend>,
    clock: Arc<dyn Clock>,
    metrics: &'static LimiterMetrics,
    notifications: Option<NotificationDispatcher>,
    cleanup: Mutex<Option<CleanupTask>>,
}

#[derive(Debug)]
struct CleanupTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Assembles an [`AuthLimiter`] around an already constructed backend.
pub struct LimiterBuilder {
    config: LimiterConfig,
    backend: Arc<dyn LimiterBackend>,
    clock: Arc<dyn Clock>,
    notifier: Option<Arc<dyn LockoutNotifier>>,
    start_cleanup: bool,
}

impl LimiterBuilder {
    pub fn new(config: LimiterConfig, backend: Arc<dyn LimiterBackend>) -> Self {
        Self {
            config,
            backend,
            clock: Arc::new(SystemClock),
            notifier: None,
            start_cleanup: true,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Notifier used when `notifications_enabled` is set.
    pub fn with_notifier(mut self, notifier: Arc<dyn LockoutNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Skip the periodic sweeper. Sweeps can still be run with [`AuthLimiter::sweep`].
    pub fn without_cleanup_task(mut self) -> Self {
        self.start_cleanup = false;
        self
    }

    /// Validate the configuration and start the background sweeper.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for an invalid configuration, a backend of
    /// the wrong kind, or when the sweeper must start outside a Tokio runtime.
    /// [`Error::Metrics`] if the process-wide instruments could not be registered.
    pub fn build(self) -> Result<AuthLimiter, Error> {
        self.config.validate()?;
        if self.backend.kind() != self.config.backend {
            return Err(invalid_argument(format!(
                "configured backend is {} but a {} backend was supplied",
                self.config.backend,
                self.backend.kind()
            )));
        }

        let metrics = LimiterMetrics::global()?;
        let policy = self.config.policy();

        let notifications = match (self.config.notifications_enabled, self.notifier) {
            (true, Some(notifier)) => Some(NotificationDispatcher::new(
                notifier,
                self.config.notification_timeout,
            )),
            (true, None) => {
                tracing::debug!("Notifications enabled without a notifier; none will be sent");
                None
            }
            (false, _) => None,
        };

        let cleanup = if self.start_cleanup {
            tokio::runtime::Handle::try_current().map_err(|_| {
                invalid_argument("a Tokio runtime is required to start the cleanup task")
            })?;
            Some(spawn_cleanup_task(
                Arc::clone(&self.backend),
                Arc::clone(&self.clock),
                policy,
                metrics,
                self.config.cleanup_interval,
            ))
        } else {
            None
        };

        tracing::info!(
            backend = %self.config.backend,
            max_login_attempts = policy.max_attempts,
            login_window_secs = policy.window.as_secs(),
            lockout_secs = policy.lockout.as_secs(),
            "Authentication limiter started"
        );

        Ok(AuthLimiter {
            inner: Arc::new(LimiterInner {
                config: self.config,
                policy,
                backend: self.backend,
                clock: self.clock,
                metrics,
                notifications,
                cleanup: Mutex::new(cleanup),
            }),
        })
    }
}

impl AuthLimiter {
    pub fn builder(config: LimiterConfig, backend: Arc<dyn LimiterBackend>) -> LimiterBuilder {
        LimiterBuilder::new(config, backend)
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.inner.config
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.inner.backend.kind()
    }

    pub fn metrics(&self) -> &'static LimiterMetrics {
        self.inner.metrics
    }

    /// Decide whether `identifier` may attempt to authenticate now.
    ///
    /// An active lockout always wins over an exhausted window. An expired
    /// lockout is cleared on the way and the principal starts clean.
    ///
    /// # Errors
    ///
    /// Denials are not errors: they come back as [`Decision::Denied`].
    /// Errors are [`Error::InvalidArgument`] for an empty identifier, backend
    /// failures, and cancellation.
    pub async fn allow_attempt(
        &self,
        ctx: &RequestContext,
        identifier: &str,
    ) -> Result<Decision, Error> {
        validate_identifier(identifier)?;
        let inner = &self.inner;
        inner.metrics.login_attempts.inc();

        ctx.run(inner.decide(identifier)).await
    }

    /// Record a failed authentication for `identifier`.
    ///
    /// Crossing `max_login_attempts` locks the principal for
    /// `lockout_duration` and, when enabled, dispatches a notification without
    /// waiting for it.
    ///
    /// The context is only checked before the backend call. Once issued, the
    /// increment runs to completion and its lockout is counted and notified
    /// even if the context fires meanwhile.
    pub async fn record_failure(
        &self,
        ctx: &RequestContext,
        identifier: &str,
    ) -> Result<FailureOutcome, Error> {
        validate_identifier(identifier)?;
        let inner = &self.inner;
        inner.metrics.login_failure.inc();

        let record = ctx
            .commit(async {
                let now = inner.clock.now();
                inner
                    .backend
                    .increment_failures_and_maybe_lock(identifier, &inner.policy, now)
                    .await
            })
            .await?;

        if record.replaced_expired {
            inner.lockout_expired(identifier);
        }

        if let Some(lockout) = record.created {
            inner.metrics.active_locked_accounts.inc();
            inner.metrics.account_lockouts.inc();
            tracing::info!(
                identifier = %identifier,
                failed_attempts = record.count,
                unlock_at = %lockout.unlock_at,
                "Principal locked out after repeated failures"
            );

            if let Some(dispatcher) = &inner.notifications {
                dispatcher.dispatch(identifier, lockout.unlock_at);
            }
        }

        Ok(FailureOutcome {
            attempts: record.count,
            lockout: record.created,
        })
    }

    /// Record a successful authentication, clearing the attempt window.
    ///
    /// An existing lockout is left in place.
    pub async fn record_success(&self, ctx: &RequestContext, identifier: &str) -> Result<(), Error> {
        validate_identifier(identifier)?;
        let inner = &self.inner;
        inner.metrics.login_success.inc();

        let observed = ctx
            .commit(inner.backend.clear_attempts(identifier, &inner.policy))
            .await?;

        let now = inner.clock.now();
        if let Some(lockout) = observed.filter(|lockout| lockout.is_active(now)) {
            tracing::warn!(
                identifier = %identifier,
                unlock_at = %lockout.unlock_at,
                "Successful login recorded for a locked principal"
            );
        }

        Ok(())
    }

    /// Current lockout state of `identifier`.
    pub async fn lockout_status(
        &self,
        ctx: &RequestContext,
        identifier: &str,
    ) -> Result<LockoutStatus, Error> {
        validate_identifier(identifier)?;
        let inner = &self.inner;

        let state = ctx
            .run(async {
                let now = inner.clock.now();
                inner
                    .backend
                    .read_lockout(identifier, &inner.policy, now)
                    .await
            })
            .await?;

        Ok(match state {
            LockoutState::Active(lockout) => LockoutStatus::locked_until(lockout.unlock_at),
            LockoutState::Expired(_) => {
                inner.lockout_expired(identifier);
                LockoutStatus::unlocked()
            }
            LockoutState::Absent => LockoutStatus::unlocked(),
        })
    }

    /// Check if `identifier` is currently locked (convenience method).
    pub async fn is_locked(&self, ctx: &RequestContext, identifier: &str) -> Result<bool, Error> {
        Ok(self.lockout_status(ctx, identifier).await?.is_locked)
    }

    /// Remove every record held for `identifier`.
    ///
    /// Returns `true` if a lockout was removed. Unlocking an unknown principal
    /// is a no-op.
    pub async fn unlock(&self, ctx: &RequestContext, identifier: &str) -> Result<bool, Error> {
        validate_identifier(identifier)?;
        let inner = &self.inner;

        let existed = ctx
            .commit(inner.backend.clear_lockout_and_attempts(identifier))
            .await?;

        if existed {
            inner.metrics.active_locked_accounts.dec();
            tracing::info!(identifier = %identifier, "Principal unlocked");
        }

        Ok(existed)
    }

    pub async fn health_check(&self, ctx: &RequestContext) -> Result<(), Error> {
        ctx.run(self.inner.backend.health_check()).await
    }

    /// Run one cleanup pass now, independent of the periodic sweeper.
    pub async fn sweep(&self) -> Result<SweepReport, Error> {
        let inner = &self.inner;
        inner
            .backend
            .sweep(&inner.policy, inner.clock.now(), inner.metrics)
            .await
    }

    /// Stop the sweeper and wait (bounded by `shutdown_grace`) for in-flight
    /// notifications.
    pub async fn shutdown(&self) {
        let cleanup = self
            .inner
            .cleanup
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if let Some(task) = cleanup {
            task.shutdown.send_replace(true);
            if let Err(e) = task.handle.await {
                tracing::warn!(error = %e, "Cleanup task ended abnormally");
            }
        }

        if let Some(dispatcher) = &self.inner.notifications {
            dispatcher.drain(self.inner.config.shutdown_grace).await;
        }
    }
}

impl LimiterInner {
    /// Lockout gate first, then the attempt window.
    async fn decide(&self, identifier: &str) -> Result<Decision, Error> {
        let now = self.clock.now();
        match self
            .backend
            .read_lockout(identifier, &self.policy, now)
            .await?
        {
            LockoutState::Active(lockout) => {
                self.metrics.rate_limit_exceeded.inc();
                tracing::debug!(
                    identifier = %identifier,
                    unlock_at = %lockout.unlock_at,
                    "Rejected attempt from locked principal"
                );
                return Ok(Decision::Denied {
                    retry_after: lockout.remaining(now),
                    reason: DenialReason::LockedOut,
                });
            }
            LockoutState::Expired(_) => self.lockout_expired(identifier),
            LockoutState::Absent => {}
        }

        match self
            .backend
            .check_and_increment_attempts(identifier, &self.policy, now)
            .await?
        {
            AttemptOutcome::Accepted { count } => Ok(Decision::Allowed {
                attempts: count,
                remaining: self.policy.max_attempts.saturating_sub(count),
            }),
            AttemptOutcome::Rejected { retry_after } => {
                self.metrics.rate_limit_exceeded.inc();
                tracing::debug!(
                    identifier = %identifier,
                    retry_after_secs = retry_after.as_secs(),
                    "Rejected attempt, window exhausted"
                );
                Ok(Decision::Denied {
                    retry_after,
                    reason: DenialReason::WindowExhausted,
                })
            }
        }
    }

    fn lockout_expired(&self, identifier: &str) {
        self.metrics.active_locked_accounts.dec();
        tracing::debug!(identifier = %identifier, "Cleared expired lockout");
    }
}

fn validate_identifier(identifier: &str) -> Result<(), Error> {
    if identifier.is_empty() {
        return Err(invalid_argument("identifier must not be empty"));
    }
    Ok(())
}

fn spawn_cleanup_task(
    backend: Arc<dyn LimiterBackend>,
    clock: Arc<dyn Clock>,
    policy: LimitPolicy,
    metrics: &'static LimiterMetrics,
    interval: Duration,
) -> CleanupTask {
    let (shutdown, mut shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        let mut interval_timer = tokio::time::interval(interval);
        interval_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval_timer.tick().await;

        loop {
            tokio::select! {
                _ = interval_timer.tick() => {
                    match backend.sweep(&policy, clock.now(), metrics).await {
                        Ok(report) if report.expired_lockouts > 0 || report.stale_windows > 0 => {
                            tracing::info!(
                                expired_lockouts = report.expired_lockouts,
                                stale_windows = report.stale_windows,
                                active_lockouts = report.active_lockouts,
                                "Cleaned up expired limiter records"
                            );
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to clean up limiter records");
                        }
                        _ => {}
                    }
                }
                _ = shutdown_rx.changed() => {
                    tracing::info!("Shutting down authentication limiter cleanup task");
                    break;
                }
            }
        }
    });

    CleanupTask { shutdown, handle }
}
