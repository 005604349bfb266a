// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Storage layer.
//!
//! Services depend on the [`Database`] trait object so that production
//! (Firestore) and tests (in-memory) share the same code paths.

pub mod firestore;
pub mod memory;

pub use firestore::FirestoreDb;
pub use memory::MemoryDb;

use crate::error::AppError;
use crate::models::{
    CredentialKey, FetchBatch, IntegrationRecord, IntegrationUpdate, PendingAuthorization,
    Provider, StoredCredential, SubscriptionOwner, SyncJob, WebhookSubscription,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Collection names as constants.
pub mod collections {
    /// Encrypted OAuth credentials (keyed by `{provider}_{user}`)
    pub const CREDENTIALS: &str = "credentials";
    pub const INTEGRATIONS: &str = "integrations";
    pub const SUBSCRIPTIONS: &str = "webhook_subscriptions";
    pub const SYNC_JOBS: &str = "sync_jobs";
    /// Raw provider records (keyed by `{provider}_{user}_{record_id}`)
    pub const PROVIDER_RECORDS: &str = "provider_records";
    pub const PENDING_AUTHORIZATIONS: &str = "pending_authorizations";
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_credential(&self, key: &CredentialKey)
        -> Result<Option<StoredCredential>, AppError>;
    async fn put_credential(&self, credential: &StoredCredential) -> Result<(), AppError>;
    async fn delete_credential(&self, key: &CredentialKey) -> Result<(), AppError>;
}

#[async_trait]
pub trait IntegrationStore: Send + Sync {
    async fn get_integration(
        &self,
        key: &CredentialKey,
    ) -> Result<Option<IntegrationRecord>, AppError>;

    async fn put_integration(&self, record: &IntegrationRecord) -> Result<(), AppError>;

    /// Atomically read, apply `update` and write back.
    ///
    /// Returns the updated record, or `None` if the pair has no record.
    async fn update_integration(
        &self,
        key: &CredentialKey,
        update: &IntegrationUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<IntegrationRecord>, AppError>;

    async fn integrations_for_user(&self, user_id: &str)
        -> Result<Vec<IntegrationRecord>, AppError>;

    /// All integrations in `connected` or `syncing`.
    async fn active_integrations(&self) -> Result<Vec<IntegrationRecord>, AppError>;

    /// Integrations matching a provider-side user ID (webhook routing).
    async fn find_by_provider_user(
        &self,
        provider: Provider,
        provider_user_id: &str,
    ) -> Result<Vec<IntegrationRecord>, AppError>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get_subscription(
        &self,
        provider: Provider,
        owner: &SubscriptionOwner,
    ) -> Result<Option<WebhookSubscription>, AppError>;

    async fn put_subscription(&self, subscription: &WebhookSubscription) -> Result<(), AppError>;

    async fn delete_subscription(
        &self,
        provider: Provider,
        owner: &SubscriptionOwner,
    ) -> Result<(), AppError>;

    async fn subscriptions_for(
        &self,
        provider: Provider,
    ) -> Result<Vec<WebhookSubscription>, AppError>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn put_job(&self, job: &SyncJob) -> Result<(), AppError>;

    async fn get_job(&self, id: &str) -> Result<Option<SyncJob>, AppError>;

    /// Pending jobs scheduled at or before `now`, oldest first.
    async fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<SyncJob>, AppError>;

    /// The pending job for a pair, if any.
    async fn pending_job_for(&self, key: &CredentialKey) -> Result<Option<SyncJob>, AppError>;

    /// Running jobs started before `started_before`.
    async fn stale_running_jobs(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<SyncJob>, AppError>;

    /// Atomically move a due pending job to `running`, bumping `attempts`.
    ///
    /// Returns `None` when another worker claimed it first.
    async fn claim_job(&self, id: &str, now: DateTime<Utc>) -> Result<Option<SyncJob>, AppError>;
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Upsert fetched records for a pair. Returns the number written.
    async fn append_records(
        &self,
        key: &CredentialKey,
        batch: &FetchBatch,
        fetched_at: DateTime<Utc>,
    ) -> Result<usize, AppError>;
}

#[async_trait]
pub trait AuthorizationStore: Send + Sync {
    async fn put_pending(&self, pending: &PendingAuthorization) -> Result<(), AppError>;

    /// Remove and return the pending authorization for `state`.
    async fn take_pending(&self, state: &str) -> Result<Option<PendingAuthorization>, AppError>;
}

/// Everything the services need from storage.
pub trait Database:
    CredentialStore + IntegrationStore + SubscriptionStore + JobStore + RecordStore + AuthorizationStore
{
}

impl<T> Database for T where
    T: CredentialStore
        + IntegrationStore
        + SubscriptionStore
        + JobStore
        + RecordStore
        + AuthorizationStore
{
}

/// A provider record as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub user_id: String,
    pub provider: Provider,
    pub record_id: String,
    /// The provider's JSON, serialized.
    pub payload: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub fetched_at: DateTime<Utc>,
}

impl ProviderRecord {
    pub fn new(key: &CredentialKey, record: &serde_json::Value, fetched_at: DateTime<Utc>) -> Self {
        let payload = record.to_string();
        Self {
            user_id: key.user_id.clone(),
            provider: key.provider,
            record_id: record_id(record, &payload),
            payload,
            fetched_at,
        }
    }

    pub fn doc_id(&self) -> String {
        let key = CredentialKey::new(self.user_id.clone(), self.provider);
        format!("{}_{}", key.doc_id(), urlencoding::encode(&self.record_id))
    }
}

/// Provider ID of a record (`id`, `logId` or `day`), or a content hash.
fn record_id(record: &serde_json::Value, payload: &str) -> String {
    use sha2::{Digest, Sha256};

    for field in ["id", "logId", "day"] {
        match record.get(field) {
            Some(serde_json::Value::String(s)) => return s.clone(),
            Some(serde_json::Value::Number(n)) => return n.to_string(),
            _ => {}
        }
    }
    hex::encode(Sha256::digest(payload.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_id_prefers_provider_ids() {
        let key = CredentialKey::new("u1", Provider::Strava);
        let now = Utc::now();

        assert_eq!(ProviderRecord::new(&key, &json!({"id": 12345}), now).record_id, "12345");
        assert_eq!(
            ProviderRecord::new(&key, &json!({"logId": "abc"}), now).record_id,
            "abc"
        );
        assert_eq!(
            ProviderRecord::new(&key, &json!({"day": "2026-01-01"}), now).doc_id(),
            "strava_u1_2026-01-01"
        );
    }

    #[test]
    fn record_id_falls_back_to_hash() {
        let key = CredentialKey::new("u1", Provider::Oura);
        let a = ProviderRecord::new(&key, &json!({"score": 80}), Utc::now());
        let b = ProviderRecord::new(&key, &json!({"score": 80}), Utc::now());
        assert_eq!(a.record_id, b.record_id);
        assert_eq!(a.record_id.len(), 64);
    }
}
