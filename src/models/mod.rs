// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Data models for the application.

pub mod credential;
pub mod integration;
pub mod provider;
pub mod rate_limit;
pub mod subscription;
pub mod sync_job;

pub use credential::{Credential, CredentialKey, PendingAuthorization, StoredCredential, TokenGrant};
pub use integration::{IntegrationRecord, IntegrationStatus, IntegrationUpdate};
pub use provider::{
    Capabilities, Provider, RateLimitScope, RateLimitStrategy, SignatureScheme, SinceParam,
    SubscriptionAuth, SubscriptionCardinality, TokenAuth, UnknownProvider, VerificationStyle,
    WebhookPolicy,
};
pub use rate_limit::{RateLimitDecision, RateLimitWindow};
pub use subscription::{
    RenewalResult, SubscriptionGrant, SubscriptionOwner, SubscriptionState, WebhookSubscription,
};
pub use sync_job::{FetchBatch, JobStatus, JobTrigger, SyncJob};
