//! Lockout values written in any RFC 3339 form are compared as instants.
//!
//! Ignored by default; run with `cargo test -p turnstile-storage-redis -- --ignored`.

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use testcontainers_modules::redis::{REDIS_PORT, Redis};
use testcontainers_modules::testcontainers::runners::AsyncRunner;
use turnstile_core::{LimitPolicy, LimiterBackend, LimiterConfig, LockoutState, RedisConfig};
use turnstile_storage_redis::RedisBackend;

async fn store_lockout(url: &str, identifier: &str, value: &str) {
    let client = redis::Client::open(url).expect("Failed to parse Redis url");
    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .expect("Failed to connect to Redis");
    let _: () = redis::cmd("SET")
        .arg(format!("auth_limiter:lockout:{identifier}"))
        .arg(value)
        .arg("EX")
        .arg(3600)
        .query_async(&mut conn)
        .await
        .expect("Failed to store lockout");
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_failure_script_compares_instants() {
    let container = Redis::default()
        .start()
        .await
        .expect("Failed to start Redis container");
    let host_port = container
        .get_host_port_ipv4(REDIS_PORT)
        .await
        .expect("Failed to resolve Redis port");
    let url = format!("redis://127.0.0.1:{host_port}");
    let backend = RedisBackend::connect(&RedisConfig {
        url: url.clone(),
        ..RedisConfig::default()
    })
    .await
    .expect("Failed to connect");

    let policy = LimitPolicy {
        max_attempts: 1,
        ..LimiterConfig::default().policy()
    };
    let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap() + TimeDelta::milliseconds(400);

    // 10:10Z written with an offset: still active
    store_lockout(&url, "offset", "2024-01-01T05:10:00-05:00").await;
    let record = backend
        .increment_failures_and_maybe_lock("offset", &policy, now)
        .await
        .unwrap();
    assert_eq!(record.created, None);
    assert!(!record.replaced_expired);
    let unlock_at: DateTime<Utc> = Utc.with_ymd_and_hms(2024, 1, 1, 10, 10, 0).unwrap();
    assert!(matches!(
        backend.read_lockout("offset", &policy, now).await.unwrap(),
        LockoutState::Active(lockout) if lockout.unlock_at == unlock_at
    ));

    // Whole seconds, 400ms in the past: expired and replaced
    store_lockout(&url, "coarse", "2024-01-01T10:00:00Z").await;
    let record = backend
        .increment_failures_and_maybe_lock("coarse", &policy, now)
        .await
        .unwrap();
    assert!(record.replaced_expired);
    let lockout = record.created.expect("expired lockout should be replaced");
    assert_eq!(lockout.unlock_at, now + TimeDelta::minutes(15));
}
