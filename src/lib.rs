// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Cloudbrain-Sync: OAuth token and rate-limit coordinator for wearable
//! providers.
//!
//! This crate keeps provider credentials fresh, shares provider quotas
//! across instances, maintains webhook subscriptions and schedules data
//! syncs for Strava, Fitbit and Oura.

pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod time_utils;

use config::Config;
use db::Database;
use services::{
    KmsService, OAuthService, ProviderClient, RateLimitBackend, RateLimiter, RefreshCoordinator,
    SyncScheduler, TokenStore, WebhookSubscriptionManager,
};
use std::sync::Arc;
use time_utils::Clock;

/// Shared application state.
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Arc<dyn Database>,
    pub tokens: Arc<TokenStore>,
    pub refresh: RefreshCoordinator,
    pub limiter: Arc<RateLimiter>,
    pub subscriptions: Arc<WebhookSubscriptionManager>,
    pub scheduler: SyncScheduler,
    pub oauth: OAuthService,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Wire every service from its injected dependencies.
    pub fn build(
        config: Config,
        db: Arc<dyn Database>,
        kms: KmsService,
        provider: Arc<dyn ProviderClient>,
        rate_limit_backend: Arc<dyn RateLimitBackend>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let config = Arc::new(config);

        let tokens = Arc::new(TokenStore::new(db.clone(), kms, clock.clone()));
        let refresh = RefreshCoordinator::new(
            tokens.clone(),
            db.clone(),
            provider.clone(),
            clock.clone(),
            config.refresh.margin,
            config.refresh.failure_grace,
        );
        let limiter = Arc::new(RateLimiter::new(rate_limit_backend, clock.clone(), &config));
        let subscriptions = Arc::new(WebhookSubscriptionManager::new(
            db.clone(),
            provider.clone(),
            refresh.clone(),
            clock.clone(),
            config.clone(),
        ));
        let scheduler = SyncScheduler::new(
            db.clone(),
            refresh.clone(),
            limiter.clone(),
            provider.clone(),
            subscriptions.clone(),
            clock.clone(),
            config.scheduler.clone(),
            config.enabled_providers().collect(),
        );
        let oauth = OAuthService::new(
            config.clone(),
            db.clone(),
            tokens.clone(),
            provider,
            subscriptions.clone(),
            scheduler.clone(),
            clock.clone(),
        );

        Arc::new(Self {
            config,
            db,
            tokens,
            refresh,
            limiter,
            subscriptions,
            scheduler,
            oauth,
            clock,
        })
    }
}
