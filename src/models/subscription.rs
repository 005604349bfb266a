// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Webhook push subscription models.

use crate::models::{Provider, SubscriptionCardinality};
use chrono::serde::{ts_milliseconds, ts_milliseconds_option};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who a subscription belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "user_id", rename_all = "lowercase")]
pub enum SubscriptionOwner {
    App,
    User(String),
}

impl SubscriptionOwner {
    /// Cardinality this owner implies.
    pub fn cardinality(&self) -> SubscriptionCardinality {
        match self {
            SubscriptionOwner::App => SubscriptionCardinality::PerApp,
            SubscriptionOwner::User(_) => SubscriptionCardinality::PerUser,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            SubscriptionOwner::App => None,
            SubscriptionOwner::User(id) => Some(id),
        }
    }
}

impl fmt::Display for SubscriptionOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionOwner::App => f.write_str("app"),
            SubscriptionOwner::User(id) => write!(f, "user:{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    Active,
    Renewing,
    Failed,
}

/// A provider push subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub provider: Provider,
    pub owner: SubscriptionOwner,
    /// Provider-assigned subscription ID.
    pub subscription_id: String,
    pub state: SubscriptionState,
    /// `None` for subscriptions that never expire.
    #[serde(with = "ts_milliseconds_option", default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(with = "ts_milliseconds_option", default)]
    pub renewed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    #[serde(with = "ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl WebhookSubscription {
    /// Firestore document ID: one subscription per (provider, owner).
    pub fn doc_id(provider: Provider, owner: &SubscriptionOwner) -> String {
        match owner {
            SubscriptionOwner::App => format!("{provider}_app"),
            SubscriptionOwner::User(id) => {
                format!("{provider}_user_{}", urlencoding::encode(id))
            }
        }
    }

    /// True when this subscription delivers events: active, and not past
    /// its expiry.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.state == SubscriptionState::Active && self.expires_at.is_none_or(|exp| exp > now)
    }
}

/// Subscription returned by the provider on create or renew.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionGrant {
    pub subscription_id: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Outcome of one `renew_if_needed` pass over a provider.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RenewalResult {
    pub checked: usize,
    pub renewed: usize,
    pub failed: usize,
    /// Subscriptions outside the renewal threshold.
    pub skipped: usize,
}

impl RenewalResult {
    pub fn merge(&mut self, other: &RenewalResult) {
        self.checked += other.checked;
        self.renewed += other.renewed;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn subscription(expires_at: Option<DateTime<Utc>>) -> WebhookSubscription {
        WebhookSubscription {
            provider: Provider::Oura,
            owner: SubscriptionOwner::App,
            subscription_id: "sub-1".to_string(),
            state: SubscriptionState::Active,
            expires_at,
            renewed_at: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn doc_id_separates_owners() {
        assert_eq!(
            WebhookSubscription::doc_id(Provider::Oura, &SubscriptionOwner::App),
            "oura_app"
        );
        assert_eq!(
            WebhookSubscription::doc_id(
                Provider::Fitbit,
                &SubscriptionOwner::User("u/1".to_string())
            ),
            "fitbit_user_u%2F1"
        );
    }

    #[test]
    fn expired_subscription_is_not_live() {
        let now = Utc::now();
        assert!(subscription(None).is_live(now));
        assert!(subscription(Some(now + Duration::days(1))).is_live(now));
        assert!(!subscription(Some(now)).is_live(now));

        let mut failed = subscription(None);
        failed.state = SubscriptionState::Failed;
        assert!(!failed.is_live(now));
    }

    #[test]
    fn owner_serializes_tagged() {
        let json = serde_json::to_value(SubscriptionOwner::User("u1".to_string())).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "user", "user_id": "u1"}));
        let app = serde_json::to_value(SubscriptionOwner::App).unwrap();
        assert_eq!(app, serde_json::json!({"kind": "app"}));
    }
}
