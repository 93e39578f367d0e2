//! Metric accounting.
//!
//! The instruments are process-wide, so every assertion on their values lives
//! in a single test in this binary.

use std::sync::Arc;
use std::time::Duration;

use turnstile::{
    LimiterConfig, LimiterMetrics, ManualClock, RequestContext, TurnstileBuilder,
};

#[derive(Debug, PartialEq, Eq)]
struct Snapshot {
    attempts: u64,
    success: u64,
    failure: u64,
    lockouts: u64,
    rate_limited: u64,
    locked: i64,
}

fn snapshot(metrics: &LimiterMetrics) -> Snapshot {
    Snapshot {
        attempts: metrics.login_attempts.get(),
        success: metrics.login_success.get(),
        failure: metrics.login_failure.get(),
        lockouts: metrics.account_lockouts.get(),
        rate_limited: metrics.rate_limit_exceeded.get(),
        locked: metrics.active_locked_accounts.get(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_metric_accounting() {
    let clock = ManualClock::default();
    let limiter = TurnstileBuilder::new(LimiterConfig::default())
        .with_clock(Arc::new(clock.clone()))
        .without_cleanup_task()
        .build()
        .await
        .expect("Failed to build limiter");
    let metrics = limiter.metrics();
    let ctx = RequestContext::background();

    // Concurrent admission cap
    let before = snapshot(metrics);
    let mut handles = Vec::new();
    for _ in 0..50 {
        let limiter = limiter.clone();
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
    let after = snapshot(metrics);
    assert_eq!(allowed, 5);
    assert_eq!(after.attempts - before.attempts, 50);
    assert_eq!(after.rate_limited - before.rate_limited, 45);

    // Unlocking an unknown principal changes nothing
    let before = snapshot(metrics);
    assert!(!limiter.unlock(&ctx, "absent").await.unwrap());
    assert_eq!(snapshot(metrics), before);

    // Lockouts move the counter and the gauge
    let before = snapshot(metrics);
    for identifier in ["a", "b", "c"] {
        for _ in 0..5 {
            limiter.record_failure(&ctx, identifier).await.unwrap();
        }
    }
    let after = snapshot(metrics);
    assert_eq!(after.failure - before.failure, 15);
    assert_eq!(after.lockouts - before.lockouts, 3);
    assert_eq!(after.locked - before.locked, 3);

    assert!(limiter.unlock(&ctx, "c").await.unwrap());
    assert!(!limiter.unlock(&ctx, "c").await.unwrap());
    assert_eq!(snapshot(metrics).locked - before.locked, 2);

    limiter.record_success(&ctx, "shared").await.unwrap();
    assert_eq!(snapshot(metrics).success - before.success, 1);

    // The sweep reconciles the gauge to the lockouts that are still active
    clock.advance(Duration::from_secs(10 * 60));
    for _ in 0..5 {
        limiter.record_failure(&ctx, "d").await.unwrap();
    }
    clock.advance(Duration::from_secs(6 * 60));
    metrics.active_locked_accounts.set(42);

    let report = limiter.sweep().await.unwrap();
    assert_eq!(report.expired_lockouts, 2);
    assert_eq!(report.active_lockouts, 1);
    assert_eq!(metrics.active_locked_accounts.get(), 1);

    limiter.shutdown().await;
}
