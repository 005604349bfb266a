// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! In-process rate-limit counters.
//!
//! Used when no Redis is configured (single instance) and in tests. Each
//! check-and-debit runs under the `DashMap` entry lock for its key.

use super::{millis, RateLimitBackend};
use crate::error::AppError;
use crate::models::RateLimitDecision;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    updated_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct MemoryBackend {
    windows: DashMap<String, VecDeque<DateTime<Utc>>>,
    buckets: DashMap<String, Bucket>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Drop timestamps at or before `now - window`.
fn prune(log: &mut VecDeque<DateTime<Utc>>, window: Duration, now: DateTime<Utc>) {
    let cutoff = now - chrono::Duration::milliseconds(millis(window));
    while log.front().is_some_and(|t| *t <= cutoff) {
        log.pop_front();
    }
}

#[async_trait]
impl RateLimitBackend for MemoryBackend {
    async fn sliding_window(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, AppError> {
        let mut log = self.windows.entry(key.to_string()).or_default();
        prune(&mut log, window, now);

        if log.len() < limit as usize {
            log.push_back(now);
            return Ok(RateLimitDecision::Allowed);
        }

        let oldest = log.front().copied().unwrap_or(now);
        let retry_ms = (oldest - now).num_milliseconds() + millis(window);
        Ok(RateLimitDecision::Denied {
            retry_after: Duration::from_millis(retry_ms.max(1) as u64),
        })
    }

    async fn token_bucket(
        &self,
        key: &str,
        capacity: u32,
        refill_window: Duration,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, AppError> {
        let capacity = f64::from(capacity);
        let window_ms = millis(refill_window).max(1) as f64;

        let mut bucket = self.buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: capacity,
            updated_at: now,
        });

        let elapsed_ms = (now - bucket.updated_at).num_milliseconds().max(0) as f64;
        bucket.tokens = (bucket.tokens + elapsed_ms * capacity / window_ms).min(capacity);
        bucket.updated_at = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(RateLimitDecision::Allowed);
        }

        let wait_ms = ((1.0 - bucket.tokens) * window_ms / capacity).ceil().max(1.0);
        Ok(RateLimitDecision::Denied {
            retry_after: Duration::from_millis(wait_ms as u64),
        })
    }

    async fn window_usage(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<(u32, Option<DateTime<Utc>>), AppError> {
        let Some(mut log) = self.windows.get_mut(key) else {
            return Ok((0, None));
        };
        prune(&mut log, window, now);
        Ok((log.len() as u32, log.front().copied()))
    }
}
