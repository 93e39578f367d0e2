//! Storage backend contract.
//!
//! The engine reads and mutates attempt windows and lockouts only through the
//! operations below. Each operation must be observable as a single step with
//! respect to every other operation on the same identifier; no atomicity is
//! required across identifiers.
//!
//! All timestamps are supplied by the caller so that backends never consult a
//! clock of their own.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{BackendKind, Error, LimitPolicy, LimiterMetrics};

/// A principal barred from authenticating until `unlock_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lockout {
    pub locked_at: DateTime<Utc>,
    pub unlock_at: DateTime<Utc>,
}

impl Lockout {
    /// An unlock instant past the representable range saturates.
    pub fn new(locked_at: DateTime<Utc>, policy: &LimitPolicy) -> Self {
        Self {
            locked_at,
            unlock_at: locked_at
                .checked_add_signed(policy.lockout_delta())
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// A lockout is active strictly before its unlock instant.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.unlock_at
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.unlock_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// What [`LimiterBackend::read_lockout`] found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockoutState {
    Absent,
    Active(Lockout),
    /// The lockout had expired and this call removed it. Exactly one
    /// concurrent reader observes this for a given lockout.
    Expired(Lockout),
}

/// Result of [`LimiterBackend::check_and_increment_attempts`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Accepted { count: u32 },
    Rejected { retry_after: Duration },
}

/// Result of [`LimiterBackend::increment_failures_and_maybe_lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureRecord {
    /// Failure counter after the increment.
    pub count: u32,
    /// Set only when this call created the lockout.
    pub created: Option<Lockout>,
    /// An expired, not yet collected lockout was replaced by this call.
    pub replaced_expired: bool,
}

/// Summary of one cleanup pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    pub expired_lockouts: usize,
    pub stale_windows: usize,
    /// Lockouts still held after the pass; the locked-accounts gauge is set to this.
    pub active_lockouts: usize,
}

/// Atomic primitives every limiter backend provides.
#[async_trait]
pub trait LimiterBackend: Send + Sync + 'static {
    fn kind(&self) -> BackendKind;

    /// Admit the attempt unless the window is exhausted.
    ///
    /// A window older than `policy.window` is reset before the check. When
    /// accepted, the counter is incremented and the new value returned.
    async fn check_and_increment_attempts(
        &self,
        identifier: &str,
        policy: &LimitPolicy,
        now: DateTime<Utc>,
    ) -> Result<AttemptOutcome, Error>;

    /// Count a failure and lock the principal once the threshold is reached.
    ///
    /// Creating a lockout clears the principal's counters. A principal with an
    /// active lockout is not locked again.
    async fn increment_failures_and_maybe_lock(
        &self,
        identifier: &str,
        policy: &LimitPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailureRecord, Error>;

    /// Read the lockout for `identifier`, removing it (and the principal's
    /// counters) if it has expired.
    async fn read_lockout(
        &self,
        identifier: &str,
        policy: &LimitPolicy,
        now: DateTime<Utc>,
    ) -> Result<LockoutState, Error>;

    /// Remove the attempt window. Returns any lockout record observed in the
    /// same step so the engine can report anomalies.
    async fn clear_attempts(
        &self,
        identifier: &str,
        policy: &LimitPolicy,
    ) -> Result<Option<Lockout>, Error>;

    /// Remove both records. Returns whether a lockout existed.
    async fn clear_lockout_and_attempts(&self, identifier: &str) -> Result<bool, Error>;

    /// Collect expired records and reconcile the locked-accounts gauge.
    async fn sweep(
        &self,
        policy: &LimitPolicy,
        now: DateTime<Utc>,
        metrics: &LimiterMetrics,
    ) -> Result<SweepReport, Error>;

    async fn health_check(&self) -> Result<(), Error>;
}

impl std::fmt::Debug for dyn LimiterBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LimiterBackend({})", self.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LimiterConfig;
    use chrono::TimeDelta;

    #[test]
    fn test_lockout_window() {
        let policy = LimiterConfig::default().policy();
        let now = Utc::now();
        let lockout = Lockout::new(now, &policy);

        assert_eq!(lockout.unlock_at - lockout.locked_at, TimeDelta::minutes(15));
        assert!(lockout.is_active(now));
        assert!(lockout.is_active(lockout.unlock_at - TimeDelta::milliseconds(1)));
        assert!(!lockout.is_active(lockout.unlock_at));
        assert_eq!(lockout.remaining(now), Duration::from_secs(900));
        assert_eq!(
            lockout.remaining(lockout.unlock_at + TimeDelta::seconds(1)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_lockout_saturates_instead_of_overflowing() {
        let policy = LimitPolicy {
            lockout: Duration::from_secs(u64::MAX),
            ..LimiterConfig::default().policy()
        };
        let now = Utc::now();
        let lockout = Lockout::new(now, &policy);

        assert_eq!(lockout.unlock_at, DateTime::<Utc>::MAX_UTC);
        assert!(lockout.is_active(now));
    }
}
