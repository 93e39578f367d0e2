//! Key layout and value encoding.
//!
//! ```text
//! <prefix>attempts:<identifier>   decimal counter, TTL = login window
//! <prefix>failures:<identifier>   decimal counter, separate counter mode only
//! <prefix>lockout:<identifier>    unlock instant as RFC 3339, TTL = lockout
//! ```

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use turnstile_core::{BackendError, LimitPolicy, Lockout};

#[derive(Debug, Clone)]
pub(crate) struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub(crate) fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub(crate) fn attempts(&self, identifier: &str) -> String {
        format!("{}attempts:{identifier}", self.prefix)
    }

    pub(crate) fn failures(&self, identifier: &str) -> String {
        format!("{}failures:{identifier}", self.prefix)
    }

    pub(crate) fn lockout(&self, identifier: &str) -> String {
        format!("{}lockout:{identifier}", self.prefix)
    }

    /// SCAN pattern matching every lockout key.
    pub(crate) fn lockout_pattern(&self) -> String {
        format!("{}lockout:*", self.prefix)
    }

    /// Recover the identifier from a lockout key.
    pub(crate) fn identifier_of<'a>(&self, lockout_key: &'a str) -> Option<&'a str> {
        lockout_key
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix("lockout:")
    }
}

/// Whole seconds for an `EX` argument: rounded up, never zero.
pub(crate) fn ttl_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    secs.max(1)
}

/// Drop sub-millisecond precision so stored and in-memory instants agree.
pub(crate) fn to_millis(now: DateTime<Utc>) -> DateTime<Utc> {
    now.trunc_subsecs(3)
}

/// Fixed-width RFC 3339 (`YYYY-MM-DDTHH:MM:SS.mmmZ`), ordered like the instant.
pub(crate) fn encode_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Rebuild a lockout from its stored unlock instant. Any RFC 3339 form is
/// accepted.
pub(crate) fn decode_lockout(
    key: &str,
    value: &str,
    policy: &LimitPolicy,
) -> Result<Lockout, BackendError> {
    let unlock_at = DateTime::parse_from_rfc3339(value)
        .map_err(|e| BackendError::CorruptRecord {
            key: key.to_string(),
            reason: e.to_string(),
        })?
        .with_timezone(&Utc);

    Ok(Lockout {
        locked_at: unlock_at
            .checked_sub_signed(policy.lockout_delta())
            .unwrap_or(DateTime::<Utc>::MIN_UTC),
        unlock_at,
    })
}
