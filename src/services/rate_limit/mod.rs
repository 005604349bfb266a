// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Provider rate limiting.
//!
//! Each provider binds at startup to one strategy (sliding window or token
//! bucket) and one scope (app-wide or per-user). Counters live in a shared
//! backend so every instance draws from the same quota.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

use crate::config::Config;
use crate::error::AppError;
use crate::models::{
    CredentialKey, Provider, RateLimitDecision, RateLimitScope, RateLimitStrategy,
    RateLimitWindow,
};
use crate::time_utils::Clock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Key used for providers whose quota is shared by the whole app.
pub const APP_KEY: &str = "app";

/// Atomic counter operations. Implementations must make each call a single
/// check-and-debit so concurrent callers never overshoot the limit.
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    async fn sliding_window(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, AppError>;

    async fn token_bucket(
        &self,
        key: &str,
        capacity: u32,
        refill_window: Duration,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, AppError>;

    /// Requests counted in the window ending at `now`, and the oldest one.
    async fn window_usage(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<(u32, Option<DateTime<Utc>>), AppError>;
}

pub struct RateLimiter {
    backend: Arc<dyn RateLimitBackend>,
    clock: Arc<dyn Clock>,
    bindings: BTreeMap<Provider, RateLimitStrategy>,
}

impl RateLimiter {
    /// Bind every provider to its configured strategy.
    pub fn new(backend: Arc<dyn RateLimitBackend>, clock: Arc<dyn Clock>, config: &Config) -> Self {
        let bindings = Provider::ALL
            .into_iter()
            .map(|p| (p, config.rate_limit_for(p)))
            .collect();
        Self {
            backend,
            clock,
            bindings,
        }
    }

    pub fn strategy(&self, provider: Provider) -> RateLimitStrategy {
        self.bindings
            .get(&provider)
            .copied()
            .unwrap_or(provider.capabilities().rate_limit)
    }

    /// Limiter key for a user's request: the user ID, or [`APP_KEY`] when
    /// the provider's quota is app-wide.
    pub fn key_for(provider: Provider, user_id: &str) -> &str {
        match provider.capabilities().rate_limit_scope {
            RateLimitScope::App => APP_KEY,
            RateLimitScope::User => user_id,
        }
    }

    /// Ask for one request's worth of quota.
    pub async fn try_acquire(
        &self,
        provider: Provider,
        key: &str,
    ) -> Result<RateLimitDecision, AppError> {
        let storage_key = storage_key(provider, key);
        let now = self.clock.now();

        let decision = match self.strategy(provider) {
            RateLimitStrategy::SlidingWindow { limit, window } => {
                self.backend
                    .sliding_window(&storage_key, limit, window, now)
                    .await?
            }
            RateLimitStrategy::TokenBucket {
                capacity,
                refill_window,
            } => {
                self.backend
                    .token_bucket(&storage_key, capacity, refill_window, now)
                    .await?
            }
        };

        if let RateLimitDecision::Denied { retry_after } = decision {
            tracing::debug!(
                provider = %provider,
                key,
                retry_after_ms = retry_after.as_millis() as u64,
                "Rate limit denied"
            );
        }
        Ok(decision)
    }

    /// [`try_acquire`](Self::try_acquire) for a user's pair, picking the key by scope.
    pub async fn acquire_for(&self, key: &CredentialKey) -> Result<RateLimitDecision, AppError> {
        self.try_acquire(key.provider, Self::key_for(key.provider, &key.user_id))
            .await
    }

    /// Current sliding-window usage; `None` for token-bucket providers.
    pub async fn snapshot(
        &self,
        provider: Provider,
        key: &str,
    ) -> Result<Option<RateLimitWindow>, AppError> {
        let RateLimitStrategy::SlidingWindow { limit, window } = self.strategy(provider) else {
            return Ok(None);
        };

        let now = self.clock.now();
        let (request_count, oldest) = self
            .backend
            .window_usage(&storage_key(provider, key), window, now)
            .await?;

        Ok(Some(RateLimitWindow {
            provider,
            key: key.to_string(),
            window_start: oldest.unwrap_or(now),
            request_count,
            limit,
        }))
    }
}

fn storage_key(provider: Provider, key: &str) -> String {
    format!("ratelimit:{}:{}", provider, key)
}

/// Milliseconds in a duration, saturating.
pub(crate) fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
