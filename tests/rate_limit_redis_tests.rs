// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Redis rate-limit backend tests.
//!
//! These tests need a Redis server; set REDIS_URL or they skip.
//! Every test uses fresh keys, so runs don't interfere.

use chrono::{DateTime, DurationRound, Utc};
use cloudbrain_sync::config::Config;
use cloudbrain_sync::models::{Provider, RateLimitDecision, RateLimitStrategy};
use cloudbrain_sync::services::{RateLimitBackend, RateLimiter, RedisBackend};
use cloudbrain_sync::time_utils::{Clock, ManualClock};
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;

mod common;

fn unique_key() -> String {
    format!("test:{}", uuid::Uuid::new_v4())
}

/// Now, truncated to the millisecond precision the scripts use.
fn now_ms() -> DateTime<Utc> {
    Utc::now()
        .duration_trunc(chrono::Duration::milliseconds(1))
        .unwrap()
}

fn retry_after(decision: RateLimitDecision) -> Duration {
    match decision {
        RateLimitDecision::Denied { retry_after } => retry_after,
        RateLimitDecision::Allowed => panic!("expected a denial"),
    }
}

async fn pttl(url: &str, key: &str) -> i64 {
    let client = redis::Client::open(url).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    redis::cmd("PTTL").arg(key).query_async(&mut conn).await.unwrap()
}

#[tokio::test]
async fn test_sliding_window_denies_over_limit() {
    let url = require_redis!();
    let backend = RedisBackend::new(&url).await.unwrap();
    let key = unique_key();
    let window = Duration::from_secs(60);
    let start = now_ms();

    for _ in 0..5 {
        let decision = backend.sliding_window(&key, 5, window, start).await.unwrap();
        assert!(decision.is_allowed());
    }

    let later = start + chrono::Duration::seconds(10);
    let wait = retry_after(backend.sliding_window(&key, 5, window, later).await.unwrap());
    assert_eq!(wait, Duration::from_secs(50));

    // The first five leave the window after 60s.
    let after = start + chrono::Duration::seconds(60);
    assert!(backend
        .sliding_window(&key, 5, window, after)
        .await
        .unwrap()
        .is_allowed());
}

#[tokio::test]
async fn test_token_bucket_refills() {
    let url = require_redis!();
    let backend = RedisBackend::new(&url).await.unwrap();
    let key = unique_key();
    let refill = Duration::from_secs(30);
    let start = now_ms();

    for _ in 0..3 {
        assert!(backend
            .token_bucket(&key, 3, refill, start)
            .await
            .unwrap()
            .is_allowed());
    }

    // Three tokens per 30s: one every 10s.
    let wait = retry_after(backend.token_bucket(&key, 3, refill, start).await.unwrap());
    assert_eq!(wait, Duration::from_secs(10));

    let later = start + chrono::Duration::seconds(10);
    assert!(backend
        .token_bucket(&key, 3, refill, later)
        .await
        .unwrap()
        .is_allowed());
    assert!(!backend
        .token_bucket(&key, 3, refill, later)
        .await
        .unwrap()
        .is_allowed());
}

#[tokio::test]
async fn test_keys_expire_after_one_window() {
    let url = require_redis!();
    let backend = RedisBackend::new(&url).await.unwrap();
    let now = now_ms();

    let window_key = unique_key();
    backend
        .sliding_window(&window_key, 10, Duration::from_secs(60), now)
        .await
        .unwrap();
    let ttl = pttl(&url, &window_key).await;
    assert!(ttl > 0 && ttl <= 60_000, "unexpected TTL {ttl}");

    let bucket_key = unique_key();
    backend
        .token_bucket(&bucket_key, 10, Duration::from_secs(30), now)
        .await
        .unwrap();
    let ttl = pttl(&url, &bucket_key).await;
    assert!(ttl > 0 && ttl <= 30_000, "unexpected TTL {ttl}");
}

#[tokio::test]
async fn test_concurrent_acquires_never_overshoot() {
    let url = require_redis!();
    let backend = Arc::new(RedisBackend::new(&url).await.unwrap());
    let key = unique_key();
    let now = now_ms();

    let tasks = (0..50).map(|_| {
        let backend = backend.clone();
        let key = key.clone();
        tokio::spawn(async move {
            backend
                .sliding_window(&key, 20, Duration::from_secs(60), now)
                .await
        })
    });

    let allowed = join_all(tasks)
        .await
        .into_iter()
        .filter(|r| r.as_ref().unwrap().as_ref().unwrap().is_allowed())
        .count();

    assert_eq!(allowed, 20);
}

#[tokio::test]
async fn test_limiter_over_redis_reports_window() {
    let url = require_redis!();
    let clock = Arc::new(ManualClock::new(now_ms()));
    let mut config = Config::test_default();
    config.rate_limit_overrides.insert(
        Provider::Oura,
        RateLimitStrategy::SlidingWindow {
            limit: 3,
            window: Duration::from_secs(60),
        },
    );
    let limiter = RateLimiter::new(
        Arc::new(RedisBackend::new(&url).await.unwrap()),
        clock.clone(),
        &config,
    );
    let user = uuid::Uuid::new_v4().to_string();
    let first = clock.now();

    for _ in 0..3 {
        assert!(limiter
            .try_acquire(Provider::Oura, &user)
            .await
            .unwrap()
            .is_allowed());
        clock.advance(chrono::Duration::seconds(5));
    }
    assert!(!limiter
        .try_acquire(Provider::Oura, &user)
        .await
        .unwrap()
        .is_allowed());

    let window = limiter
        .snapshot(Provider::Oura, &user)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(window.request_count, 3);
    assert_eq!(window.limit, 3);
    assert_eq!(window.window_start, first);
}
