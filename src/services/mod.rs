// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Services module - business logic layer.

pub mod kms;
pub mod oauth;
pub mod provider_client;
pub mod rate_limit;
pub mod refresh;
pub mod scheduler;
pub mod subscriptions;
pub mod token_store;

pub use kms::KmsService;
pub use oauth::{AuthorizationRequest, OAuthService};
pub use provider_client::{HttpProviderClient, ProviderClient, ProviderError};
pub use rate_limit::{MemoryBackend, RateLimitBackend, RateLimiter, RedisBackend};
pub use refresh::RefreshCoordinator;
pub use scheduler::{JobCounts, SyncScheduler, TickReport};
pub use subscriptions::WebhookSubscriptionManager;
pub use token_store::TokenStore;
