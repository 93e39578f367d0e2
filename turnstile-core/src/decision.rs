//! Outcomes returned to the calling adapter.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::Error;
use crate::backend::Lockout;

/// Why an attempt was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    /// An active lockout bars the principal.
    LockedOut,
    /// The principal used up its attempts for the current window.
    WindowExhausted,
}

/// The answer to "may this principal try to authenticate now?".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed {
        /// Attempts counted in the current window, including this one.
        attempts: u32,
        /// Attempts left before the window is exhausted.
        remaining: u32,
    },
    Denied {
        /// Suitable for a `Retry-After` header.
        retry_after: Duration,
        reason: DenialReason,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    /// Zero for admitted attempts.
    pub fn retry_after(&self) -> Duration {
        match self {
            Decision::Allowed { .. } => Duration::ZERO,
            Decision::Denied { retry_after, .. } => *retry_after,
        }
    }

    pub fn denial_reason(&self) -> Option<DenialReason> {
        match self {
            Decision::Allowed { .. } => None,
            Decision::Denied { reason, .. } => Some(*reason),
        }
    }

    /// Turn a denial into [`Error::LockedOut`] or [`Error::WindowExhausted`],
    /// for callers that prefer `?` over matching.
    pub fn into_result(self) -> Result<Self, Error> {
        match self {
            Decision::Denied {
                retry_after,
                reason: DenialReason::LockedOut,
            } => Err(Error::LockedOut { retry_after }),
            Decision::Denied {
                retry_after,
                reason: DenialReason::WindowExhausted,
            } => Err(Error::WindowExhausted { retry_after }),
            allowed => Ok(allowed),
        }
    }
}

/// Result of recording a failed authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureOutcome {
    /// Value of the failure counter after this call.
    pub attempts: u32,
    /// The lockout created by this call, if any. An already-locked principal
    /// never gets a second one.
    pub lockout: Option<Lockout>,
}

impl FailureOutcome {
    pub fn locked(&self) -> bool {
        self.lockout.is_some()
    }
}

/// Lockout state of a principal as seen by [`AuthLimiter::lockout_status`](crate::AuthLimiter::lockout_status).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockoutStatus {
    pub is_locked: bool,
    pub locked_until: Option<DateTime<Utc>>,
}

impl LockoutStatus {
    pub fn unlocked() -> Self {
        Self::default()
    }

    pub fn locked_until(unlock_at: DateTime<Utc>) -> Self {
        Self {
            is_locked: true,
            locked_until: Some(unlock_at),
        }
    }

    /// Time left on the lockout relative to `now`, if locked.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.locked_until
            .filter(|_| self.is_locked)
            .map(|until| (until - now).to_std().unwrap_or(Duration::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn test_allowed_has_no_retry_after() {
        let decision = Decision::Allowed {
            attempts: 1,
            remaining: 4,
        };
        assert!(decision.is_allowed());
        assert_eq!(decision.retry_after(), Duration::ZERO);
        assert_eq!(decision.denial_reason(), None);
        assert!(decision.into_result().is_ok());
    }

    #[test]
    fn test_into_result_maps_denials() {
        let locked = Decision::Denied {
            retry_after: Duration::from_secs(30),
            reason: DenialReason::LockedOut,
        };
        match locked.into_result() {
            Err(Error::LockedOut { retry_after }) => {
                assert_eq!(retry_after, Duration::from_secs(30))
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let exhausted = Decision::Denied {
            retry_after: Duration::from_secs(3),
            reason: DenialReason::WindowExhausted,
        };
        assert!(matches!(
            exhausted.into_result(),
            Err(Error::WindowExhausted { .. })
        ));
    }

    #[test]
    fn test_lockout_status_retry_after() {
        let now = Utc::now();
        let status = LockoutStatus::locked_until(now + TimeDelta::minutes(15));
        assert_eq!(status.retry_after(now), Some(Duration::from_secs(900)));

        // Past unlock instants clamp to zero rather than going negative
        let stale = LockoutStatus::locked_until(now - TimeDelta::seconds(1));
        assert_eq!(stale.retry_after(now), Some(Duration::ZERO));

        assert_eq!(LockoutStatus::unlocked().retry_after(now), None);
    }
}
