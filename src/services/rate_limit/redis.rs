// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Redis-backed rate-limit counters shared by all instances.
//!
//! Sliding windows are sorted sets of request timestamps; token buckets are
//! hashes of `{tokens, ts}`. Each check-and-debit is one Lua script, so it is
//! atomic on the server. Every key carries a `PEXPIRE` of one window, so idle
//! state decays on its own and survives restarts while it matters.

use super::{millis, RateLimitBackend};
use crate::error::AppError;
use crate::models::RateLimitDecision;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::Client;
use std::time::Duration;

/// KEYS[1] = window key; ARGV = now_ms, window_ms, limit, member.
/// Returns `{allowed, retry_after_ms}`.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
if count < limit then
    redis.call('ZADD', key, now, ARGV[4])
    redis.call('PEXPIRE', key, window)
    return {1, 0}
end

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local retry = tonumber(oldest[2]) + window - now
if retry < 1 then
    retry = 1
end
return {0, retry}
"#;

/// KEYS[1] = bucket key; ARGV = now_ms, capacity, refill_window_ms.
/// Returns `{allowed, retry_after_ms}`.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local window = tonumber(ARGV[3])

local state = redis.call('HMGET', key, 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
    tokens = capacity
    ts = now
end

local elapsed = math.max(0, now - ts)
tokens = math.min(capacity, tokens + elapsed * capacity / window)

local allowed = 0
local retry = 0
if tokens >= 1 then
    tokens = tokens - 1
    allowed = 1
else
    retry = math.max(1, math.ceil((1 - tokens) * window / capacity))
end

redis.call('HSET', key, 'tokens', tostring(tokens), 'ts', now)
redis.call('PEXPIRE', key, window)
return {allowed, retry}
"#;

/// KEYS[1] = window key; ARGV = now_ms, window_ms.
/// Returns `{count, oldest_ms or -1}`.
const WINDOW_USAGE_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if oldest[2] then
    return {count, tonumber(oldest[2])}
end
return {count, -1}
"#;

#[derive(Clone)]
pub struct RedisBackend {
    conn_manager: ConnectionManager,
    sliding: redis::Script,
    bucket: redis::Script,
    usage: redis::Script,
}

impl RedisBackend {
    pub async fn new(redis_url: &str) -> Result<Self, AppError> {
        let client = Client::open(redis_url).map_err(|e| {
            AppError::Internal(anyhow::anyhow!("Failed to create Redis client: {}", e))
        })?;

        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            AppError::Internal(anyhow::anyhow!(
                "Failed to create Redis connection manager: {}",
                e
            ))
        })?;

        tracing::info!("Connected to Redis for rate limiting");

        Ok(Self {
            conn_manager,
            sliding: redis::Script::new(SLIDING_WINDOW_SCRIPT),
            bucket: redis::Script::new(TOKEN_BUCKET_SCRIPT),
            usage: redis::Script::new(WINDOW_USAGE_SCRIPT),
        })
    }
}

fn redis_err(e: redis::RedisError) -> AppError {
    tracing::error!(error = %e, "Redis rate-limit script failed");
    AppError::Internal(anyhow::anyhow!("Rate limiter unavailable: {}", e))
}

fn decision((allowed, retry_ms): (i64, i64)) -> RateLimitDecision {
    if allowed == 1 {
        RateLimitDecision::Allowed
    } else {
        RateLimitDecision::Denied {
            retry_after: Duration::from_millis(retry_ms.max(1) as u64),
        }
    }
}

#[async_trait]
impl RateLimitBackend for RedisBackend {
    async fn sliding_window(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, AppError> {
        let mut conn = self.conn_manager.clone();
        let now_ms = now.timestamp_millis();
        // Unique member so simultaneous requests are all counted.
        let member = format!("{}-{}", now_ms, uuid::Uuid::new_v4().simple());

        let result: (i64, i64) = self
            .sliding
            .key(key)
            .arg(now_ms)
            .arg(millis(window))
            .arg(limit)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err)?;

        Ok(decision(result))
    }

    async fn token_bucket(
        &self,
        key: &str,
        capacity: u32,
        refill_window: Duration,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, AppError> {
        let mut conn = self.conn_manager.clone();

        let result: (i64, i64) = self
            .bucket
            .key(key)
            .arg(now.timestamp_millis())
            .arg(capacity)
            .arg(millis(refill_window).max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err)?;

        Ok(decision(result))
    }

    async fn window_usage(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<(u32, Option<DateTime<Utc>>), AppError> {
        let mut conn = self.conn_manager.clone();

        let (count, oldest_ms): (i64, i64) = self
            .usage
            .key(key)
            .arg(now.timestamp_millis())
            .arg(millis(window))
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err)?;

        let oldest = (oldest_ms >= 0)
            .then(|| DateTime::from_timestamp_millis(oldest_ms))
            .flatten();
        Ok((u32::try_from(count).unwrap_or(u32::MAX), oldest))
    }
}
