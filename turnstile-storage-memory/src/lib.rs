//! In-process limiter backend.
//!
//! State lives in two maps guarded by a single reader/writer lock, so every
//! operation is one critical section and no operation holds the lock across an
//! await point. Nothing is shared between processes: each limiter instance has
//! its own view of every principal.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use turnstile_core::{
    AttemptOutcome, BackendError, BackendKind, CounterMode, Error, FailureRecord, LimitPolicy,
    LimiterBackend, LimiterMetrics, Lockout, LockoutState, SweepReport,
};

/// Per-identifier counting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AttemptWindow {
    count: u32,
    /// Only used with [`CounterMode::Separate`].
    failures: u32,
    window_start: DateTime<Utc>,
}

impl AttemptWindow {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            failures: 0,
            window_start: now,
        }
    }

    fn is_stale(&self, policy: &LimitPolicy, now: DateTime<Utc>) -> bool {
        now - self.window_start > policy.window_delta()
    }

    fn retry_after(&self, policy: &LimitPolicy, now: DateTime<Utc>) -> Duration {
        match self.window_start.checked_add_signed(policy.window_delta()) {
            Some(window_end) => (window_end - now).to_std().unwrap_or(Duration::ZERO),
            None => policy.window,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    attempts: HashMap<String, AttemptWindow>,
    lockouts: HashMap<String, Lockout>,
}

impl MemoryState {
    /// The live window for `identifier`, reset first if it has gone stale.
    fn window(
        &mut self,
        identifier: &str,
        policy: &LimitPolicy,
        now: DateTime<Utc>,
    ) -> &mut AttemptWindow {
        let window = self
            .attempts
            .entry(identifier.to_string())
            .or_insert_with(|| AttemptWindow::new(now));
        if window.is_stale(policy, now) {
            *window = AttemptWindow::new(now);
        }
        window
    }
}

/// Limiter backend keeping all state in process memory.
///
/// Cloning yields a handle to the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of identifiers currently holding a lockout record, expired or not.
    pub fn lockout_count(&self) -> usize {
        self.read().map(|state| state.lockouts.len()).unwrap_or(0)
    }

    /// Number of identifiers currently holding an attempt window.
    pub fn window_count(&self) -> usize {
        self.read().map(|state| state.attempts.len()).unwrap_or(0)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>, Error> {
        self.state.read().map_err(|_| {
            tracing::error!("Memory limiter state lock poisoned");
            BackendError::Poisoned.into()
        })
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>, Error> {
        self.state.write().map_err(|_| {
            tracing::error!("Memory limiter state lock poisoned");
            BackendError::Poisoned.into()
        })
    }
}

#[async_trait]
impl LimiterBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn check_and_increment_attempts(
        &self,
        identifier: &str,
        policy: &LimitPolicy,
        now: DateTime<Utc>,
    ) -> Result<AttemptOutcome, Error> {
        let mut state = self.write()?;
        let window = state.window(identifier, policy, now);

        if window.count >= policy.max_attempts {
            return Ok(AttemptOutcome::Rejected {
                retry_after: window.retry_after(policy, now),
            });
        }

        window.count += 1;
        Ok(AttemptOutcome::Accepted {
            count: window.count,
        })
    }

    async fn increment_failures_and_maybe_lock(
        &self,
        identifier: &str,
        policy: &LimitPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailureRecord, Error> {
        let mut state = self.write()?;
        let window = state.window(identifier, policy, now);
        let count = match policy.counter_mode {
            CounterMode::Shared => {
                window.count = window.count.saturating_add(1);
                window.count
            }
            CounterMode::Separate => {
                window.failures = window.failures.saturating_add(1);
                window.failures
            }
        };

        let mut record = FailureRecord {
            count,
            created: None,
            replaced_expired: false,
        };
        if count < policy.max_attempts {
            return Ok(record);
        }

        if let Some(existing) = state.lockouts.get(identifier) {
            if existing.is_active(now) {
                return Ok(record);
            }
            record.replaced_expired = true;
        }

        let lockout = Lockout::new(now, policy);
        state.lockouts.insert(identifier.to_string(), lockout);
        state.attempts.remove(identifier);
        record.created = Some(lockout);
        Ok(record)
    }

    async fn read_lockout(
        &self,
        identifier: &str,
        _policy: &LimitPolicy,
        now: DateTime<Utc>,
    ) -> Result<LockoutState, Error> {
        let observed = match self.read()?.lockouts.get(identifier) {
            None => return Ok(LockoutState::Absent),
            Some(lockout) if lockout.is_active(now) => return Ok(LockoutState::Active(*lockout)),
            Some(lockout) => *lockout,
        };

        // Upgrade and re-check: another caller may have collected or replaced it
        let mut state = self.write()?;
        match state.lockouts.get(identifier).copied() {
            Some(current) if current == observed => {
                state.lockouts.remove(identifier);
                state.attempts.remove(identifier);
                Ok(LockoutState::Expired(observed))
            }
            Some(current) if current.is_active(now) => Ok(LockoutState::Active(current)),
            _ => Ok(LockoutState::Absent),
        }
    }

    async fn clear_attempts(
        &self,
        identifier: &str,
        _policy: &LimitPolicy,
    ) -> Result<Option<Lockout>, Error> {
        let mut state = self.write()?;
        state.attempts.remove(identifier);
        Ok(state.lockouts.get(identifier).copied())
    }

    async fn clear_lockout_and_attempts(&self, identifier: &str) -> Result<bool, Error> {
        let mut state = self.write()?;
        state.attempts.remove(identifier);
        Ok(state.lockouts.remove(identifier).is_some())
    }

    async fn sweep(
        &self,
        policy: &LimitPolicy,
        now: DateTime<Utc>,
        metrics: &LimiterMetrics,
    ) -> Result<SweepReport, Error> {
        let mut state = self.write()?;
        let MemoryState { attempts, lockouts } = &mut *state;

        let mut expired_lockouts = 0;
        lockouts.retain(|identifier, lockout| {
            if lockout.is_active(now) {
                return true;
            }
            attempts.remove(identifier);
            expired_lockouts += 1;
            false
        });

        let stale_after = policy
            .window_delta()
            .checked_mul(2)
            .unwrap_or(TimeDelta::MAX);
        let before = attempts.len();
        attempts.retain(|_, window| now - window.window_start <= stale_after);
        let stale_windows = before - attempts.len();

        let active_lockouts = lockouts.len();
        metrics
            .active_locked_accounts
            .set(i64::try_from(active_lockouts).unwrap_or(i64::MAX));

        Ok(SweepReport {
            expired_lockouts,
            stale_windows,
            active_lockouts,
        })
    }

    async fn health_check(&self) -> Result<(), Error> {
        self.read().map(|_| ())
    }
}
