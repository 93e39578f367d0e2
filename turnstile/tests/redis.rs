//! Limiter behavior against a real Redis.
//!
//! These tests start a Redis container and are ignored by default; run them
//! with `cargo test -p turnstile --features redis -- --ignored`.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use testcontainers_modules::redis::{REDIS_PORT, Redis};
use testcontainers_modules::testcontainers::{ContainerAsync, runners::AsyncRunner};
use turnstile::{
    AuthLimiter, Decision, DenialReason, LimiterConfig, LockoutStatus, ManualClock,
    RequestContext, TurnstileBuilder,
};

async fn start_redis() -> (ContainerAsync<Redis>, String) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let container = Redis::default()
        .start()
        .await
        .expect("Failed to start Redis container");
    let host_port = container
        .get_host_port_ipv4(REDIS_PORT)
        .await
        .expect("Failed to resolve Redis port");
    (container, format!("redis://127.0.0.1:{host_port}"))
}

async fn limiter_with(config: LimiterConfig, clock: &ManualClock) -> AuthLimiter {
    TurnstileBuilder::new(config)
        .with_clock(Arc::new(clock.clone()))
        .without_cleanup_task()
        .build()
        .await
        .expect("Failed to build limiter")
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_lockout_and_expiry() {
    let (_container, url) = start_redis().await;
    let clock = ManualClock::default();
    let limiter = limiter_with(
        LimiterConfig {
            lockout_duration: Duration::from_millis(100),
            ..LimiterConfig::redis(url)
        },
        &clock,
    )
    .await;
    let ctx = RequestContext::background();
    limiter.health_check(&ctx).await.unwrap();

    let mut lockout = None;
    for _ in 0..5 {
        lockout = limiter
            .record_failure(&ctx, "user@example.com")
            .await
            .unwrap()
            .lockout;
    }
    let lockout = lockout.expect("fifth failure should lock");
    assert_eq!(lockout.unlock_at - lockout.locked_at, TimeDelta::milliseconds(100));

    assert_eq!(
        limiter
            .lockout_status(&ctx, "user@example.com")
            .await
            .unwrap(),
        LockoutStatus::locked_until(lockout.unlock_at)
    );
    let decision = limiter
        .allow_attempt(&ctx, "user@example.com")
        .await
        .unwrap();
    assert_eq!(decision.denial_reason(), Some(DenialReason::LockedOut));

    // The key outlives the lockout (TTLs are whole seconds); the stored
    // instant decides
    clock.advance(Duration::from_millis(150));
    assert!(!limiter.is_locked(&ctx, "user@example.com").await.unwrap());
    assert_eq!(
        limiter
            .allow_attempt(&ctx, "user@example.com")
            .await
            .unwrap(),
        Decision::Allowed {
            attempts: 1,
            remaining: 4
        }
    );

    limiter.shutdown().await;
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_window_and_unlock() {
    let (_container, url) = start_redis().await;
    let clock = ManualClock::default();
    let limiter = limiter_with(LimiterConfig::redis(url), &clock).await;
    let ctx = RequestContext::background();

    for _ in 0..5 {
        assert!(limiter.allow_attempt(&ctx, "10.0.0.1").await.unwrap().is_allowed());
    }
    let decision = limiter.allow_attempt(&ctx, "10.0.0.1").await.unwrap();
    assert_eq!(decision.denial_reason(), Some(DenialReason::WindowExhausted));
    assert!(decision.retry_after() <= Duration::from_secs(15 * 60));
    assert!(decision.retry_after() > Duration::from_secs(14 * 60));

    assert!(limiter.allow_attempt(&ctx, "10.0.0.2").await.unwrap().is_allowed());

    limiter.record_failure(&ctx, "10.0.0.1").await.unwrap();
    assert!(limiter.is_locked(&ctx, "10.0.0.1").await.unwrap());
    assert!(!limiter.is_locked(&ctx, "10.0.0.2").await.unwrap());

    assert!(limiter.unlock(&ctx, "10.0.0.1").await.unwrap());
    assert!(!limiter.unlock(&ctx, "10.0.0.1").await.unwrap());
    assert!(!limiter.unlock(&ctx, "absent").await.unwrap());
    assert!(limiter.allow_attempt(&ctx, "10.0.0.1").await.unwrap().is_allowed());

    limiter.record_success(&ctx, "10.0.0.2").await.unwrap();
    assert_eq!(
        limiter.allow_attempt(&ctx, "10.0.0.2").await.unwrap(),
        Decision::Allowed {
            attempts: 1,
            remaining: 4
        }
    );

    limiter.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore = "requires docker"]
async fn test_redis_admission_cap_across_limiters() {
    let (_container, url) = start_redis().await;
    let clock = ManualClock::default();
    let first = limiter_with(LimiterConfig::redis(url.clone()), &clock).await;
    let second = limiter_with(LimiterConfig::redis(url), &clock).await;

    let mut handles = Vec::new();
    for i in 0..100 {
        let limiter = if i % 2 == 0 {
            first.clone()
        } else {
            second.clone()
        };
        handles.push(tokio::spawn(async move {
            let ctx = RequestContext::background();
            limiter.allow_attempt(&ctx, "shared").await.unwrap()
        }));
    }

    let mut allowed = 0;
    for handle in handles {
        if handle.await.unwrap().is_allowed() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 5);

    first.shutdown().await;
    second.shutdown().await;
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_sweep_collects_expired_lockouts() {
    let (_container, url) = start_redis().await;
    let clock = ManualClock::default();
    let limiter = limiter_with(
        LimiterConfig {
            max_login_attempts: 1,
            lockout_duration: Duration::from_secs(60),
            ..LimiterConfig::redis(url)
        },
        &clock,
    )
    .await;
    let ctx = RequestContext::background();

    limiter.record_failure(&ctx, "old").await.unwrap();
    clock.advance(Duration::from_secs(45));
    limiter.record_failure(&ctx, "new").await.unwrap();
    clock.advance(Duration::from_secs(30));

    let report = limiter.sweep().await.unwrap();
    assert_eq!(report.expired_lockouts, 1);
    assert_eq!(report.active_lockouts, 1);
    assert!(limiter.is_locked(&ctx, "new").await.unwrap());
    assert!(!limiter.is_locked(&ctx, "old").await.unwrap());

    limiter.shutdown().await;
}
