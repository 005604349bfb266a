// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! In-memory storage for tests and single-instance development.
//!
//! Each collection is a `DashMap` keyed by the same document IDs Firestore
//! uses. Read-modify-write operations hold the entry lock for their duration.

use crate::db::{
    AuthorizationStore, CredentialStore, IntegrationStore, JobStore, ProviderRecord, RecordStore,
    SubscriptionStore,
};
use crate::error::AppError;
use crate::models::{
    CredentialKey, FetchBatch, IntegrationRecord, IntegrationUpdate, JobStatus,
    PendingAuthorization, Provider, StoredCredential, SubscriptionOwner, SyncJob,
    WebhookSubscription,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};

#[derive(Default)]
pub struct MemoryDb {
    credentials: DashMap<String, StoredCredential>,
    integrations: DashMap<String, IntegrationRecord>,
    subscriptions: DashMap<String, WebhookSubscription>,
    jobs: DashMap<String, SyncJob>,
    records: DashMap<String, ProviderRecord>,
    pending: DashMap<String, PendingAuthorization>,
    unavailable_subscriptions: DashSet<String>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored records for a pair (test inspection).
    pub fn records_for(&self, key: &CredentialKey) -> Vec<ProviderRecord> {
        self.records
            .iter()
            .filter(|r| r.user_id == key.user_id && r.provider == key.provider)
            .map(|r| r.value().clone())
            .collect()
    }

    /// All jobs for a pair, any status (test inspection).
    pub fn jobs_for(&self, key: &CredentialKey) -> Vec<SyncJob> {
        let mut jobs: Vec<SyncJob> = self
            .jobs
            .iter()
            .filter(|j| j.user_id == key.user_id && j.provider == key.provider)
            .map(|j| j.value().clone())
            .collect();
        jobs.sort_by_key(|j| j.scheduled_at);
        jobs
    }

    /// Make reads and writes of one subscription document fail, as if its
    /// shard were unreachable. Listing still returns it.
    pub fn break_subscription(&self, provider: Provider, owner: &SubscriptionOwner) {
        self.unavailable_subscriptions
            .insert(WebhookSubscription::doc_id(provider, owner));
    }

    fn subscription_available(&self, id: &str) -> Result<(), AppError> {
        if self.unavailable_subscriptions.contains(id) {
            return Err(AppError::Storage(format!("subscription {} unavailable", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for MemoryDb {
    async fn get_credential(
        &self,
        key: &CredentialKey,
    ) -> Result<Option<StoredCredential>, AppError> {
        Ok(self.credentials.get(&key.doc_id()).map(|c| c.clone()))
    }

    async fn put_credential(&self, credential: &StoredCredential) -> Result<(), AppError> {
        self.credentials
            .insert(credential.key().doc_id(), credential.clone());
        Ok(())
    }

    async fn delete_credential(&self, key: &CredentialKey) -> Result<(), AppError> {
        self.credentials.remove(&key.doc_id());
        Ok(())
    }
}

#[async_trait]
impl IntegrationStore for MemoryDb {
    async fn get_integration(
        &self,
        key: &CredentialKey,
    ) -> Result<Option<IntegrationRecord>, AppError> {
        Ok(self.integrations.get(&key.doc_id()).map(|r| r.clone()))
    }

    async fn put_integration(&self, record: &IntegrationRecord) -> Result<(), AppError> {
        self.integrations
            .insert(record.key().doc_id(), record.clone());
        Ok(())
    }

    async fn update_integration(
        &self,
        key: &CredentialKey,
        update: &IntegrationUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<IntegrationRecord>, AppError> {
        Ok(self.integrations.get_mut(&key.doc_id()).map(|mut record| {
            record.apply(update, now);
            record.clone()
        }))
    }

    async fn integrations_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<IntegrationRecord>, AppError> {
        Ok(self
            .integrations
            .iter()
            .filter(|r| r.user_id == user_id)
            .map(|r| r.value().clone())
            .collect())
    }

    async fn active_integrations(&self) -> Result<Vec<IntegrationRecord>, AppError> {
        Ok(self
            .integrations
            .iter()
            .filter(|r| r.status.is_active())
            .map(|r| r.value().clone())
            .collect())
    }

    async fn find_by_provider_user(
        &self,
        provider: Provider,
        provider_user_id: &str,
    ) -> Result<Vec<IntegrationRecord>, AppError> {
        Ok(self
            .integrations
            .iter()
            .filter(|r| {
                r.provider == provider && r.provider_user_id.as_deref() == Some(provider_user_id)
            })
            .map(|r| r.value().clone())
            .collect())
    }
}

#[async_trait]
impl SubscriptionStore for MemoryDb {
    async fn get_subscription(
        &self,
        provider: Provider,
        owner: &SubscriptionOwner,
    ) -> Result<Option<WebhookSubscription>, AppError> {
        let id = WebhookSubscription::doc_id(provider, owner);
        self.subscription_available(&id)?;
        Ok(self.subscriptions.get(&id).map(|s| s.clone()))
    }

    async fn put_subscription(&self, subscription: &WebhookSubscription) -> Result<(), AppError> {
        let id = WebhookSubscription::doc_id(subscription.provider, &subscription.owner);
        self.subscription_available(&id)?;
        self.subscriptions.insert(id, subscription.clone());
        Ok(())
    }

    async fn delete_subscription(
        &self,
        provider: Provider,
        owner: &SubscriptionOwner,
    ) -> Result<(), AppError> {
        self.subscriptions
            .remove(&WebhookSubscription::doc_id(provider, owner));
        Ok(())
    }

    async fn subscriptions_for(
        &self,
        provider: Provider,
    ) -> Result<Vec<WebhookSubscription>, AppError> {
        Ok(self
            .subscriptions
            .iter()
            .filter(|s| s.provider == provider)
            .map(|s| s.value().clone())
            .collect())
    }
}

#[async_trait]
impl JobStore for MemoryDb {
    async fn put_job(&self, job: &SyncJob) -> Result<(), AppError> {
        self.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<SyncJob>, AppError> {
        Ok(self.jobs.get(id).map(|j| j.clone()))
    }

    async fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<SyncJob>, AppError> {
        let mut due: Vec<SyncJob> = self
            .jobs
            .iter()
            .filter(|j| j.is_due(now))
            .map(|j| j.value().clone())
            .collect();
        due.sort_by_key(|j| j.scheduled_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn pending_job_for(&self, key: &CredentialKey) -> Result<Option<SyncJob>, AppError> {
        Ok(self
            .jobs
            .iter()
            .find(|j| {
                j.status == JobStatus::Pending
                    && j.user_id == key.user_id
                    && j.provider == key.provider
            })
            .map(|j| j.value().clone()))
    }

    async fn stale_running_jobs(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<SyncJob>, AppError> {
        Ok(self
            .jobs
            .iter()
            .filter(|j| {
                j.status == JobStatus::Running
                    && j.started_at.is_some_and(|started| started < started_before)
            })
            .map(|j| j.value().clone())
            .collect())
    }

    async fn claim_job(&self, id: &str, now: DateTime<Utc>) -> Result<Option<SyncJob>, AppError> {
        let Some(mut job) = self.jobs.get_mut(id) else {
            return Ok(None);
        };
        if !job.is_due(now) {
            return Ok(None);
        }
        job.status = JobStatus::Running;
        job.attempts += 1;
        job.started_at = Some(now);
        Ok(Some(job.clone()))
    }
}

#[async_trait]
impl RecordStore for MemoryDb {
    async fn append_records(
        &self,
        key: &CredentialKey,
        batch: &FetchBatch,
        fetched_at: DateTime<Utc>,
    ) -> Result<usize, AppError> {
        for record in &batch.records {
            let record = ProviderRecord::new(key, record, fetched_at);
            self.records.insert(record.doc_id(), record);
        }
        Ok(batch.len())
    }
}

#[async_trait]
impl AuthorizationStore for MemoryDb {
    async fn put_pending(&self, pending: &PendingAuthorization) -> Result<(), AppError> {
        self.pending.insert(pending.state.clone(), pending.clone());
        Ok(())
    }

    async fn take_pending(&self, state: &str) -> Result<Option<PendingAuthorization>, AppError> {
        Ok(self.pending.remove(state).map(|(_, p)| p))
    }
}
