// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Provider rate limits over the memory backend with a manual clock.

use chrono::Utc;
use cloudbrain_sync::config::Config;
use cloudbrain_sync::models::{CredentialKey, Provider, RateLimitDecision};
use cloudbrain_sync::services::rate_limit::APP_KEY;
use cloudbrain_sync::services::{MemoryBackend, RateLimiter};
use cloudbrain_sync::time_utils::ManualClock;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;

fn limiter() -> (Arc<RateLimiter>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let limiter = RateLimiter::new(
        Arc::new(MemoryBackend::new()),
        clock.clone(),
        &Config::test_default(),
    );
    (Arc::new(limiter), clock)
}

fn retry_after(decision: RateLimitDecision) -> Duration {
    match decision {
        RateLimitDecision::Denied { retry_after } => retry_after,
        RateLimitDecision::Allowed => panic!("expected a denial"),
    }
}

#[tokio::test]
async fn test_oura_5000th_allowed_5001st_denied() {
    let (limiter, clock) = limiter();

    // Spread 5000 calls over the first ~50 minutes of the hour.
    for i in 0..5000 {
        if i % 100 == 0 && i > 0 {
            clock.advance(chrono::Duration::minutes(1));
        }
        let decision = limiter.try_acquire(Provider::Oura, "u1").await.unwrap();
        assert!(decision.is_allowed(), "call {} should be allowed", i + 1);
    }

    let denied = limiter.try_acquire(Provider::Oura, "u1").await.unwrap();
    let wait = retry_after(denied);
    // Oldest call was 49 minutes ago; it leaves the window in 11 minutes.
    assert_eq!(wait, Duration::from_secs(11 * 60));

    // Another user has their own quota.
    assert!(limiter
        .try_acquire(Provider::Oura, "u2")
        .await
        .unwrap()
        .is_allowed());

    // Once the first minute's calls age out, there is room again.
    clock.advance(chrono::Duration::minutes(11));
    assert!(limiter
        .try_acquire(Provider::Oura, "u1")
        .await
        .unwrap()
        .is_allowed());
}

#[tokio::test]
async fn test_strava_window_is_app_wide() {
    let (limiter, clock) = limiter();

    for i in 0..100 {
        let user = format!("user-{}", i % 7);
        let key = CredentialKey::new(user, Provider::Strava);
        assert!(limiter.acquire_for(&key).await.unwrap().is_allowed());
        clock.advance(chrono::Duration::seconds(1));
    }

    // The 101st request within 15 minutes is denied, whoever makes it.
    let key = CredentialKey::new("someone-else", Provider::Strava);
    let wait = retry_after(limiter.acquire_for(&key).await.unwrap());
    assert!(wait > Duration::ZERO);
    assert_eq!(wait, Duration::from_secs(15 * 60 - 100));

    let window = limiter
        .snapshot(Provider::Strava, APP_KEY)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(window.request_count, 100);
    assert_eq!(window.limit, 100);
}

#[tokio::test]
async fn test_fitbit_bucket_refills_continuously() {
    let (limiter, clock) = limiter();

    for _ in 0..150 {
        assert!(limiter
            .try_acquire(Provider::Fitbit, "u1")
            .await
            .unwrap()
            .is_allowed());
    }

    // Empty: one token takes an hour / 150 = 24s to come back.
    let wait = retry_after(limiter.try_acquire(Provider::Fitbit, "u1").await.unwrap());
    assert_eq!(wait, Duration::from_secs(24));

    clock.advance(chrono::Duration::seconds(24));
    assert!(limiter
        .try_acquire(Provider::Fitbit, "u1")
        .await
        .unwrap()
        .is_allowed());
    assert!(!limiter
        .try_acquire(Provider::Fitbit, "u1")
        .await
        .unwrap()
        .is_allowed());

    // Token buckets have no window snapshot.
    assert!(limiter
        .snapshot(Provider::Fitbit, "u1")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_concurrent_acquires_never_overshoot() {
    let (limiter, _clock) = limiter();

    let tasks = (0..250).map(|_| {
        let limiter = limiter.clone();
        tokio::spawn(async move { limiter.try_acquire(Provider::Strava, APP_KEY).await })
    });

    let allowed = join_all(tasks)
        .await
        .into_iter()
        .filter(|r| r.as_ref().unwrap().as_ref().unwrap().is_allowed())
        .count();

    assert_eq!(allowed, 100);
}
