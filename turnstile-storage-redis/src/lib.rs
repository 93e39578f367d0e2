//! Redis limiter backend.
//!
//! Every mutation that must be atomic runs as a single server-side script, so
//! any number of limiter processes can share one Redis without coordinating.
//! Expiry of attempt windows and lockouts is delegated to key TTLs; the
//! lockout value itself is compared against the caller's clock for exact
//! boundaries.
mod keys;
mod scripts;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{Client, RedisError};
use turnstile_core::{
    AttemptOutcome, BackendError, BackendKind, CounterMode, Error, FailureRecord, LimitPolicy,
    LimiterBackend, LimiterMetrics, Lockout, LockoutState, RedisConfig, SweepReport,
};

use crate::keys::{KeySpace, decode_lockout, encode_instant, to_millis, ttl_secs};
use crate::scripts::Scripts;

const SCAN_BATCH: usize = 100;

/// Limiter backend storing windows and lockouts in Redis.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    keys: KeySpace,
    scripts: Scripts,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Connect and verify the server answers a PING within
    /// `config.connect_timeout`.
    ///
    /// # Errors
    ///
    /// [`BackendError::Unavailable`] if the url is invalid or the server
    /// cannot be reached in time.
    pub async fn connect(config: &RedisConfig) -> Result<Self, Error> {
        let client = Client::open(config.url.as_str()).map_err(|e| {
            tracing::error!(error = %e, "Invalid Redis connection url");
            BackendError::Unavailable(format!("invalid Redis connection url: {e}"))
        })?;

        let conn = tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| connect_timeout(config.connect_timeout))?
            .map_err(map_redis_error("Failed to connect to Redis"))?;

        let backend = Self::from_connection(conn, config.key_prefix.clone());
        tokio::time::timeout(config.connect_timeout, backend.ping())
            .await
            .map_err(|_| connect_timeout(config.connect_timeout))??;

        tracing::info!(key_prefix = %config.key_prefix, "Connected to Redis limiter backend");
        Ok(backend)
    }

    /// Wrap an existing connection.
    pub fn from_connection(conn: ConnectionManager, key_prefix: impl Into<String>) -> Self {
        Self {
            conn,
            keys: KeySpace::new(key_prefix),
            scripts: Scripts::new(),
        }
    }

    async fn ping(&self) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error("Redis ping failed"))?;
        if pong != "PONG" {
            return Err(BackendError::Unavailable(format!("unexpected PING reply: {pong}")).into());
        }
        Ok(())
    }

    fn failure_counter_key(&self, identifier: &str, mode: CounterMode) -> String {
        match mode {
            CounterMode::Shared => self.keys.attempts(identifier),
            CounterMode::Separate => self.keys.failures(identifier),
        }
    }

    /// Delete an expired lockout (and the counters) if it still holds `value`.
    async fn expire_lockout(&self, identifier: &str, value: &str) -> Result<bool, Error> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .scripts
            .expire
            .key(self.keys.lockout(identifier))
            .key(self.keys.attempts(identifier))
            .key(self.keys.failures(identifier))
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error("Failed to clear expired lockout"))?;
        Ok(removed == 1)
    }

    async fn get_lockout(
        &self,
        identifier: &str,
        policy: &LimitPolicy,
    ) -> Result<Option<(Lockout, String)>, Error> {
        let key = self.keys.lockout(identifier);
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error("Failed to read lockout"))?;

        match value {
            Some(value) => Ok(Some((decode_lockout(&key, &value, policy)?, value))),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl LimiterBackend for RedisBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    async fn check_and_increment_attempts(
        &self,
        identifier: &str,
        policy: &LimitPolicy,
        _now: DateTime<Utc>,
    ) -> Result<AttemptOutcome, Error> {
        let mut conn = self.conn.clone();
        let (admitted, value): (i64, i64) = self
            .scripts
            .allow
            .key(self.keys.attempts(identifier))
            .arg(policy.max_attempts)
            .arg(ttl_secs(policy.window))
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error("Failed to check attempt window"))?;

        if admitted == 1 {
            return Ok(AttemptOutcome::Accepted {
                count: u32::try_from(value).unwrap_or(u32::MAX),
            });
        }

        // PTTL is negative when the key vanished or has no expiry
        let retry_after = u64::try_from(value)
            .map(Duration::from_millis)
            .unwrap_or(policy.window);
        Ok(AttemptOutcome::Rejected { retry_after })
    }

    async fn increment_failures_and_maybe_lock(
        &self,
        identifier: &str,
        policy: &LimitPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailureRecord, Error> {
        let now = to_millis(now);
        let lockout = Lockout::new(now, policy);

        let mut conn = self.conn.clone();
        let (count, created, replaced): (i64, i64, i64) = self
            .scripts
            .failure
            .key(self.failure_counter_key(identifier, policy.counter_mode))
            .key(self.keys.lockout(identifier))
            .key(self.keys.attempts(identifier))
            .key(self.keys.failures(identifier))
            .arg(policy.max_attempts)
            .arg(ttl_secs(policy.window))
            .arg(ttl_secs(policy.lockout))
            .arg(encode_instant(lockout.unlock_at))
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error("Failed to record failure"))?;

        Ok(FailureRecord {
            count: u32::try_from(count).unwrap_or(u32::MAX),
            created: (created == 1).then_some(lockout),
            replaced_expired: replaced == 1,
        })
    }

    async fn read_lockout(
        &self,
        identifier: &str,
        policy: &LimitPolicy,
        now: DateTime<Utc>,
    ) -> Result<LockoutState, Error> {
        let Some((lockout, value)) = self.get_lockout(identifier, policy).await? else {
            return Ok(LockoutState::Absent);
        };
        if lockout.is_active(now) {
            return Ok(LockoutState::Active(lockout));
        }
        if self.expire_lockout(identifier, &value).await? {
            return Ok(LockoutState::Expired(lockout));
        }

        // Lost the race: someone collected it, possibly locking the principal again
        match self.get_lockout(identifier, policy).await? {
            Some((current, _)) if current.is_active(now) => Ok(LockoutState::Active(current)),
            _ => Ok(LockoutState::Absent),
        }
    }

    async fn clear_attempts(
        &self,
        identifier: &str,
        policy: &LimitPolicy,
    ) -> Result<Option<Lockout>, Error> {
        let key = self.keys.lockout(identifier);
        let mut conn = self.conn.clone();
        let (value,): (Option<String>,) = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(self.keys.attempts(identifier))
            .ignore()
            .cmd("DEL")
            .arg(self.keys.failures(identifier))
            .ignore()
            .cmd("GET")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error("Failed to clear attempts"))?;

        value
            .map(|value| decode_lockout(&key, &value, policy))
            .transpose()
            .map_err(Error::from)
    }

    async fn clear_lockout_and_attempts(&self, identifier: &str) -> Result<bool, Error> {
        let mut conn = self.conn.clone();
        let (removed,): (i64,) = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(self.keys.lockout(identifier))
            .cmd("DEL")
            .arg(self.keys.attempts(identifier))
            .ignore()
            .cmd("DEL")
            .arg(self.keys.failures(identifier))
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error("Failed to clear lockout"))?;
        Ok(removed > 0)
    }

    async fn sweep(
        &self,
        policy: &LimitPolicy,
        now: DateTime<Utc>,
        metrics: &LimiterMetrics,
    ) -> Result<SweepReport, Error> {
        let pattern = self.keys.lockout_pattern();
        let mut conn = self.conn.clone();
        let mut report = SweepReport::default();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_error("Failed to scan lockouts"))?;

            if !batch.is_empty() {
                let values: Vec<Option<String>> = redis::cmd("MGET")
                    .arg(&batch)
                    .query_async(&mut conn)
                    .await
                    .map_err(map_redis_error("Failed to read lockouts"))?;

                for (key, value) in batch.iter().zip(values) {
                    // Expired by TTL between SCAN and MGET
                    let Some(value) = value else { continue };
                    let Some(identifier) = self.keys.identifier_of(key) else {
                        continue;
                    };
                    match decode_lockout(key, &value, policy) {
                        Ok(lockout) if lockout.is_active(now) => report.active_lockouts += 1,
                        Ok(_) => {
                            if self.expire_lockout(identifier, &value).await? {
                                report.expired_lockouts += 1;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(key = %key, error = %e, "Skipping unreadable lockout");
                        }
                    }
                }
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        metrics
            .active_locked_accounts
            .set(i64::try_from(report.active_lockouts).unwrap_or(i64::MAX));
        Ok(report)
    }

    async fn health_check(&self) -> Result<(), Error> {
        self.ping().await
    }
}

/// Log a Redis failure and classify it.
fn map_redis_error(context: &'static str) -> impl FnOnce(RedisError) -> Error {
    move |e| {
        tracing::error!(error = %e, "{context}");
        let reason = format!("{context}: {e}");
        let transport = e.is_io_error()
            || e.is_connection_dropped()
            || e.is_connection_refusal()
            || e.is_timeout();
        if transport {
            BackendError::Unavailable(reason).into()
        } else {
            BackendError::Script(reason).into()
        }
    }
}

fn connect_timeout(timeout: Duration) -> Error {
    tracing::error!(
        timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        "Timed out connecting to Redis"
    );
    BackendError::Unavailable(format!("no response from Redis within {timeout:?}")).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_url_is_unavailable() {
        let config = RedisConfig {
            url: "not-a-url".to_string(),
            ..RedisConfig::default()
        };
        let err = RedisBackend::connect(&config).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Backend(BackendError::Unavailable(_))
        ));
    }

    #[test]
    fn test_connect_timeout_error() {
        let err = connect_timeout(Duration::MAX);
        assert!(matches!(
            err,
            Error::Backend(BackendError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        let config = RedisConfig {
            // Reserved TEST-NET address; never routable
            url: "redis://192.0.2.1:6379".to_string(),
            connect_timeout: Duration::from_millis(200),
            ..RedisConfig::default()
        };
        let err = RedisBackend::connect(&config).await.unwrap_err();
        assert!(err.is_backend_error());
    }
}
