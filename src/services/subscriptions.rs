// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Webhook subscription lifecycle.
//!
//! Subscriptions move `active -> renewing -> active | failed`. A failed
//! subscription is retried on every pass; until it recovers, the pairs it
//! covered fall back to polling.

use crate::config::Config;
use crate::db::Database;
use crate::error::AppError;
use crate::models::{
    CredentialKey, Provider, RenewalResult, SubscriptionCardinality, SubscriptionGrant,
    SubscriptionOwner, SubscriptionState, WebhookPolicy, WebhookSubscription,
};
use crate::services::provider_client::{ProviderClient, ProviderError};
use crate::services::RefreshCoordinator;
use crate::time_utils::{to_chrono, Clock};
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub struct WebhookSubscriptionManager {
    db: Arc<dyn Database>,
    provider: Arc<dyn ProviderClient>,
    refresh: RefreshCoordinator,
    clock: Arc<dyn Clock>,
    config: Arc<Config>,
}

impl WebhookSubscriptionManager {
    pub fn new(
        db: Arc<dyn Database>,
        provider: Arc<dyn ProviderClient>,
        refresh: RefreshCoordinator,
        clock: Arc<dyn Clock>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            db,
            provider,
            refresh,
            clock,
            config,
        }
    }

    /// Renew every subscription of `provider` that is inside its renewal
    /// threshold or whose last renewal failed. Others are left untouched.
    pub async fn renew_if_needed(&self, provider: Provider) -> Result<RenewalResult, AppError> {
        let mut result = RenewalResult::default();
        let Some(policy) = provider.capabilities().webhook else {
            return Ok(result);
        };

        let now = self.clock.now();
        for subscription in self.db.subscriptions_for(provider).await? {
            result.checked += 1;

            if !needs_renewal(&subscription, &policy, now) {
                result.skipped += 1;
                continue;
            }

            let owner = subscription.owner.clone();
            match self.renew(subscription, &policy).await {
                Ok(true) => result.renewed += 1,
                Ok(false) => result.failed += 1,
                Err(e) => {
                    tracing::error!(
                        provider = %provider,
                        owner = %owner,
                        error = %e,
                        "Could not record subscription renewal"
                    );
                    result.failed += 1;
                }
            }
        }

        if result.renewed + result.failed > 0 {
            tracing::info!(
                provider = %provider,
                checked = result.checked,
                renewed = result.renewed,
                failed = result.failed,
                "Subscription renewal pass complete"
            );
        }
        Ok(result)
    }

    /// Renew one subscription. Returns whether it ended up `active`.
    async fn renew(
        &self,
        mut subscription: WebhookSubscription,
        policy: &WebhookPolicy,
    ) -> Result<bool, AppError> {
        let provider = subscription.provider;

        subscription.state = SubscriptionState::Renewing;
        subscription.updated_at = self.clock.now();
        self.db.put_subscription(&subscription).await?;

        let outcome = if subscription.exists_remotely() && policy.lifetime.is_some() {
            self.provider
                .renew_subscription(provider, &subscription.subscription_id)
                .await
        } else {
            // Never-expiring subscriptions only get here after a failure;
            // recreate them.
            self.create_remote(provider, &subscription.owner).await
        };

        let now = self.clock.now();
        subscription.updated_at = now;
        match outcome {
            Ok(grant) => {
                subscription.state = SubscriptionState::Active;
                subscription.expires_at = expiry(&grant, policy, now);
                subscription.subscription_id = grant.subscription_id;
                subscription.renewed_at = Some(now);
                subscription.last_error = None;
                self.db.put_subscription(&subscription).await?;

                tracing::info!(
                    provider = %provider,
                    owner = %subscription.owner,
                    expires_at = ?subscription.expires_at,
                    "Webhook subscription renewed"
                );
                Ok(true)
            }
            Err(e) => {
                subscription.state = SubscriptionState::Failed;
                subscription.last_error = Some(e.to_string());
                self.db.put_subscription(&subscription).await?;

                tracing::error!(
                    provider = %provider,
                    owner = %subscription.owner,
                    error = %e,
                    "Webhook subscription renewal failed, falling back to polling"
                );
                Ok(false)
            }
        }
    }

    /// Make sure `owner` has a subscription with `provider`, creating one if
    /// none exists or the previous one failed.
    pub async fn ensure_subscription(
        &self,
        provider: Provider,
        owner: SubscriptionOwner,
    ) -> Result<WebhookSubscription, AppError> {
        let policy = provider.capabilities().webhook.ok_or_else(|| {
            AppError::BadRequest(format!("{} does not support webhooks", provider))
        })?;

        if owner.cardinality() != policy.cardinality {
            return Err(AppError::BadRequest(format!(
                "{} subscriptions are {:?}, not {:?}",
                provider,
                policy.cardinality,
                owner.cardinality()
            )));
        }

        if let Some(existing) = self.db.get_subscription(provider, &owner).await? {
            if existing.state != SubscriptionState::Failed {
                return Ok(existing);
            }
        }

        let outcome = self.create_remote(provider, &owner).await;
        let now = self.clock.now();
        let (subscription, error) = match outcome {
            Ok(grant) => (
                WebhookSubscription {
                    provider,
                    owner: owner.clone(),
                    expires_at: expiry(&grant, &policy, now),
                    subscription_id: grant.subscription_id,
                    state: SubscriptionState::Active,
                    renewed_at: None,
                    last_error: None,
                    updated_at: now,
                },
                None,
            ),
            Err(e) => (
                WebhookSubscription {
                    provider,
                    owner: owner.clone(),
                    subscription_id: String::new(),
                    state: SubscriptionState::Failed,
                    expires_at: None,
                    renewed_at: None,
                    last_error: Some(e.to_string()),
                    updated_at: now,
                },
                Some(e),
            ),
        };

        self.db.put_subscription(&subscription).await?;

        if let Some(e) = error {
            tracing::error!(
                provider = %provider,
                owner = %owner,
                error = %e,
                "Failed to create webhook subscription"
            );
            return Err(AppError::ProviderApi(e.to_string()));
        }

        tracing::info!(
            provider = %provider,
            owner = %owner,
            subscription_id = %subscription.subscription_id,
            "Webhook subscription created"
        );
        Ok(subscription)
    }

    /// Whether a live push subscription delivers events for this user.
    pub async fn covers(&self, provider: Provider, user_id: &str) -> Result<bool, AppError> {
        let Some(policy) = provider.capabilities().webhook else {
            return Ok(false);
        };

        let owner = match policy.cardinality {
            SubscriptionCardinality::PerApp => SubscriptionOwner::App,
            SubscriptionCardinality::PerUser => SubscriptionOwner::User(user_id.to_string()),
        };

        Ok(self
            .db
            .get_subscription(provider, &owner)
            .await?
            .is_some_and(|s| s.is_live(self.clock.now())))
    }

    /// Forget a user's own subscription after disconnect.
    pub async fn remove_user_subscription(
        &self,
        provider: Provider,
        user_id: &str,
    ) -> Result<(), AppError> {
        let owner = SubscriptionOwner::User(user_id.to_string());
        self.db.delete_subscription(provider, &owner).await
    }

    async fn create_remote(
        &self,
        provider: Provider,
        owner: &SubscriptionOwner,
    ) -> Result<SubscriptionGrant, ProviderError> {
        let access_token = match owner {
            SubscriptionOwner::App => None,
            SubscriptionOwner::User(user_id) => {
                let key = CredentialKey::new(user_id.clone(), provider);
                let credential = self
                    .refresh
                    .ensure_valid(&key)
                    .await
                    .map_err(|e| ProviderError::Transport(format!("no usable token: {}", e)))?;
                Some(credential.access_token)
            }
        };

        self.provider
            .create_subscription(
                provider,
                &self.config.webhook_url(provider),
                &self.config.webhook_verify_token,
                access_token.as_deref(),
            )
            .await
    }
}

impl WebhookSubscription {
    /// A subscription that exists on the provider side (has an ID).
    fn exists_remotely(&self) -> bool {
        !self.subscription_id.is_empty()
    }
}

/// Whether a subscription is due for renewal at `now`.
fn needs_renewal(
    subscription: &WebhookSubscription,
    policy: &WebhookPolicy,
    now: DateTime<Utc>,
) -> bool {
    match subscription.state {
        SubscriptionState::Failed | SubscriptionState::Renewing => true,
        SubscriptionState::Active => subscription
            .expires_at
            .is_some_and(|expires_at| expires_at - now <= to_chrono(policy.renew_within)),
    }
}

/// Expiry reported by the provider, or derived from the policy lifetime.
fn expiry(
    grant: &SubscriptionGrant,
    policy: &WebhookPolicy,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    grant
        .expires_at
        .or_else(|| policy.lifetime.map(|l| now + to_chrono(l)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oura_subscription(expires_in_days: i64, now: DateTime<Utc>) -> WebhookSubscription {
        WebhookSubscription {
            provider: Provider::Oura,
            owner: SubscriptionOwner::App,
            subscription_id: "sub-1".to_string(),
            state: SubscriptionState::Active,
            expires_at: Some(now + chrono::Duration::days(expires_in_days)),
            renewed_at: None,
            last_error: None,
            updated_at: now,
        }
    }

    #[test]
    fn renewal_threshold() {
        let now = Utc::now();
        let policy = Provider::Oura.capabilities().webhook.unwrap();

        assert!(needs_renewal(&oura_subscription(6, now), &policy, now));
        assert!(needs_renewal(&oura_subscription(7, now), &policy, now));
        assert!(!needs_renewal(&oura_subscription(10, now), &policy, now));

        let mut failed = oura_subscription(60, now);
        failed.state = SubscriptionState::Failed;
        assert!(needs_renewal(&failed, &policy, now));
    }

    #[test]
    fn never_expiring_subscriptions_are_not_renewed() {
        let now = Utc::now();
        let policy = Provider::Strava.capabilities().webhook.unwrap();
        let mut sub = oura_subscription(0, now);
        sub.provider = Provider::Strava;
        sub.expires_at = None;

        assert!(!needs_renewal(&sub, &policy, now));
    }

    #[test]
    fn expiry_falls_back_to_lifetime() {
        let now = Utc::now();
        let policy = Provider::Oura.capabilities().webhook.unwrap();
        let grant = SubscriptionGrant {
            subscription_id: "s".to_string(),
            expires_at: None,
        };
        assert_eq!(
            expiry(&grant, &policy, now),
            Some(now + chrono::Duration::days(90))
        );
    }
}
