// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Firestore client wrapper with typed operations.
//!
//! Provides the storage traits for:
//! - Credentials (KMS-encrypted OAuth tokens)
//! - Integrations (per-pair status)
//! - Webhook subscriptions
//! - Sync jobs (the durable work queue)
//! - Provider records and pending authorizations

use crate::db::{
    collections, AuthorizationStore, CredentialStore, IntegrationStore, JobStore, ProviderRecord,
    RecordStore, SubscriptionStore,
};
use crate::error::AppError;
use crate::models::{
    CredentialKey, FetchBatch, IntegrationRecord, IntegrationUpdate, JobStatus,
    PendingAuthorization, Provider, StoredCredential, SubscriptionOwner, SyncJob,
    WebhookSubscription,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use firestore::errors::{BackoffError, FirestoreError};
use firestore::FirestoreTransactionOptions;
use futures_util::{stream, FutureExt, StreamExt};
use std::sync::Arc;

const MAX_CONCURRENT_DB_OPS: usize = 50;

fn storage_err(e: impl std::fmt::Display) -> AppError {
    AppError::Storage(e.to_string())
}

/// Firestore database client.
#[derive(Clone)]
pub struct FirestoreDb {
    client: Option<firestore::FirestoreDb>,
}

impl FirestoreDb {
    /// Create a new Firestore client.
    ///
    /// For local development with emulator, set FIRESTORE_EMULATOR_HOST.
    pub async fn new(project_id: &str) -> Result<Self, AppError> {
        if std::env::var("FIRESTORE_EMULATOR_HOST").is_ok() {
            return Self::create_emulator_client(project_id).await;
        }

        let client = firestore::FirestoreDb::new(project_id)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to connect to Firestore: {}", e)))?;

        tracing::info!(project = project_id, "Connected to Firestore");

        Ok(Self {
            client: Some(client),
        })
    }

    /// Create a Firestore client for the emulator with unauthenticated access.
    async fn create_emulator_client(project_id: &str) -> Result<Self, AppError> {
        let token_source = gcloud_sdk::ExternalJwtFunctionSource::new(|| async {
            Ok(gcloud_sdk::Token {
                token_type: "Bearer".to_string(),
                token: gcloud_sdk::SecretValue::new(
                    "eyJhbGciOiJub25lIn0.eyJ1aWQiOiJ0ZXN0In0."
                        .to_string()
                        .into(),
                ),
                expiry: Utc::now() + chrono::Duration::hours(1),
            })
        });

        let options = firestore::FirestoreDbOptions::new(project_id.to_string());

        let client = firestore::FirestoreDb::with_options_token_source(
            options,
            gcloud_sdk::GCP_DEFAULT_SCOPES.clone(),
            gcloud_sdk::TokenSourceType::ExternalSource(Box::new(token_source)),
        )
        .await
        .map_err(|e| {
            AppError::Storage(format!("Failed to connect to Firestore Emulator: {}", e))
        })?;

        tracing::info!(project = project_id, "Connected to Firestore emulator");

        Ok(Self {
            client: Some(client),
        })
    }

    /// Create an offline client; every operation returns a storage error.
    pub fn new_mock() -> Self {
        Self { client: None }
    }

    fn get_client(&self) -> Result<&firestore::FirestoreDb, AppError> {
        self.client
            .as_ref()
            .ok_or_else(|| AppError::Storage("Database not connected (offline mode)".to_string()))
    }

    async fn get_doc<T>(&self, collection: &str, id: &str) -> Result<Option<T>, AppError>
    where
        T: serde::de::DeserializeOwned + Send,
    {
        self.get_client()?
            .fluent()
            .select()
            .by_id_in(collection)
            .obj()
            .one(id)
            .await
            .map_err(storage_err)
    }

    async fn set_doc<T>(&self, collection: &str, id: &str, value: &T) -> Result<(), AppError>
    where
        T: serde::Serialize + serde::de::DeserializeOwned + Send + Sync,
    {
        let _: T = self
            .get_client()?
            .fluent()
            .update()
            .in_col(collection)
            .document_id(id)
            .object(value)
            .execute()
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn delete_doc(&self, collection: &str, id: &str) -> Result<(), AppError> {
        self.get_client()?
            .fluent()
            .delete()
            .from(collection)
            .document_id(id)
            .execute()
            .await
            .map_err(storage_err)
    }

    /// Read a document, modify it, and write it back in one transaction.
    ///
    /// The read goes through the transaction, so a concurrent writer makes
    /// the commit fail and the whole read-modify-write is retried.
    /// `modify` returns `None` to leave the document untouched.
    async fn read_modify_write<T, F>(
        &self,
        collection: &'static str,
        id: &str,
        modify: F,
    ) -> Result<Option<T>, AppError>
    where
        T: serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
        F: Fn(T) -> Option<T> + Send + Sync + 'static,
    {
        let modify = Arc::new(modify);
        let id = id.to_string();

        self.get_client()?
            .run_transaction_with_options::<_, _, FirestoreError>(
                |db, transaction| {
                    let modify = modify.clone();
                    let id = id.clone();
                    async move {
                        let current: Option<T> = db
                            .fluent()
                            .select()
                            .by_id_in(collection)
                            .obj()
                            .one(&id)
                            .await
                            .map_err(BackoffError::permanent)?;
                        let Some(updated) = current.and_then(|doc| (*modify)(doc)) else {
                            return Ok(None);
                        };

                        db.fluent()
                            .update()
                            .in_col(collection)
                            .document_id(&id)
                            .object(&updated)
                            .add_to_transaction(transaction)
                            .map_err(BackoffError::permanent)?;
                        Ok(Some(updated))
                    }
                    .boxed()
                },
                transaction_options(),
            )
            .await
            .map_err(|e| AppError::Storage(format!("Transaction failed: {}", e)))
    }
}

/// Contended transactions are retried with backoff for at most this long.
fn transaction_options() -> FirestoreTransactionOptions {
    FirestoreTransactionOptions::new().with_max_elapsed_time(chrono::Duration::seconds(10))
}

#[async_trait]
impl CredentialStore for FirestoreDb {
    async fn get_credential(
        &self,
        key: &CredentialKey,
    ) -> Result<Option<StoredCredential>, AppError> {
        self.get_doc(collections::CREDENTIALS, &key.doc_id()).await
    }

    async fn put_credential(&self, credential: &StoredCredential) -> Result<(), AppError> {
        self.set_doc(
            collections::CREDENTIALS,
            &credential.key().doc_id(),
            credential,
        )
        .await
    }

    async fn delete_credential(&self, key: &CredentialKey) -> Result<(), AppError> {
        self.delete_doc(collections::CREDENTIALS, &key.doc_id())
            .await
    }
}

#[async_trait]
impl IntegrationStore for FirestoreDb {
    async fn get_integration(
        &self,
        key: &CredentialKey,
    ) -> Result<Option<IntegrationRecord>, AppError> {
        self.get_doc(collections::INTEGRATIONS, &key.doc_id()).await
    }

    async fn put_integration(&self, record: &IntegrationRecord) -> Result<(), AppError> {
        self.set_doc(collections::INTEGRATIONS, &record.key().doc_id(), record)
            .await
    }

    async fn update_integration(
        &self,
        key: &CredentialKey,
        update: &IntegrationUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<IntegrationRecord>, AppError> {
        let update = update.clone();
        self.read_modify_write(
            collections::INTEGRATIONS,
            &key.doc_id(),
            move |mut record: IntegrationRecord| {
                record.apply(&update, now);
                Some(record)
            },
        )
        .await
    }

    async fn integrations_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<IntegrationRecord>, AppError> {
        self.get_client()?
            .fluent()
            .select()
            .from(collections::INTEGRATIONS)
            .filter(|q| q.for_all([q.field("user_id").eq(user_id)]))
            .obj()
            .query()
            .await
            .map_err(storage_err)
    }

    async fn active_integrations(&self) -> Result<Vec<IntegrationRecord>, AppError> {
        let client = self.get_client()?;
        let mut active = Vec::new();

        for status in ["connected", "syncing"] {
            let records: Vec<IntegrationRecord> = client
                .fluent()
                .select()
                .from(collections::INTEGRATIONS)
                .filter(|q| q.for_all([q.field("status").eq(status)]))
                .obj()
                .query()
                .await
                .map_err(storage_err)?;
            active.extend(records);
        }

        Ok(active)
    }

    async fn find_by_provider_user(
        &self,
        provider: Provider,
        provider_user_id: &str,
    ) -> Result<Vec<IntegrationRecord>, AppError> {
        self.get_client()?
            .fluent()
            .select()
            .from(collections::INTEGRATIONS)
            .filter(|q| {
                q.for_all([
                    q.field("provider").eq(provider.as_str()),
                    q.field("provider_user_id").eq(provider_user_id),
                ])
            })
            .obj()
            .query()
            .await
            .map_err(storage_err)
    }
}

#[async_trait]
impl SubscriptionStore for FirestoreDb {
    async fn get_subscription(
        &self,
        provider: Provider,
        owner: &SubscriptionOwner,
    ) -> Result<Option<WebhookSubscription>, AppError> {
        self.get_doc(
            collections::SUBSCRIPTIONS,
            &WebhookSubscription::doc_id(provider, owner),
        )
        .await
    }

    async fn put_subscription(&self, subscription: &WebhookSubscription) -> Result<(), AppError> {
        self.set_doc(
            collections::SUBSCRIPTIONS,
            &WebhookSubscription::doc_id(subscription.provider, &subscription.owner),
            subscription,
        )
        .await
    }

    async fn delete_subscription(
        &self,
        provider: Provider,
        owner: &SubscriptionOwner,
    ) -> Result<(), AppError> {
        self.delete_doc(
            collections::SUBSCRIPTIONS,
            &WebhookSubscription::doc_id(provider, owner),
        )
        .await
    }

    async fn subscriptions_for(
        &self,
        provider: Provider,
    ) -> Result<Vec<WebhookSubscription>, AppError> {
        self.get_client()?
            .fluent()
            .select()
            .from(collections::SUBSCRIPTIONS)
            .filter(|q| q.for_all([q.field("provider").eq(provider.as_str())]))
            .obj()
            .query()
            .await
            .map_err(storage_err)
    }
}

#[async_trait]
impl JobStore for FirestoreDb {
    async fn put_job(&self, job: &SyncJob) -> Result<(), AppError> {
        self.set_doc(collections::SYNC_JOBS, &job.id, job).await
    }

    async fn get_job(&self, id: &str) -> Result<Option<SyncJob>, AppError> {
        self.get_doc(collections::SYNC_JOBS, id).await
    }

    async fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<SyncJob>, AppError> {
        let now_ms = now.timestamp_millis();
        self.get_client()?
            .fluent()
            .select()
            .from(collections::SYNC_JOBS)
            .filter(|q| {
                q.for_all([
                    q.field("status").eq("pending"),
                    q.field("scheduled_at").less_than_or_equal(now_ms),
                ])
            })
            .order_by([("scheduled_at", firestore::FirestoreQueryDirection::Ascending)])
            .limit(u32::try_from(limit).unwrap_or(u32::MAX))
            .obj()
            .query()
            .await
            .map_err(storage_err)
    }

    async fn pending_job_for(&self, key: &CredentialKey) -> Result<Option<SyncJob>, AppError> {
        let jobs: Vec<SyncJob> = self
            .get_client()?
            .fluent()
            .select()
            .from(collections::SYNC_JOBS)
            .filter(|q| {
                q.for_all([
                    q.field("user_id").eq(key.user_id.as_str()),
                    q.field("provider").eq(key.provider.as_str()),
                    q.field("status").eq("pending"),
                ])
            })
            .limit(1)
            .obj()
            .query()
            .await
            .map_err(storage_err)?;
        Ok(jobs.into_iter().next())
    }

    async fn stale_running_jobs(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<SyncJob>, AppError> {
        let before_ms = started_before.timestamp_millis();
        self.get_client()?
            .fluent()
            .select()
            .from(collections::SYNC_JOBS)
            .filter(|q| {
                q.for_all([
                    q.field("status").eq("running"),
                    q.field("started_at").less_than(before_ms),
                ])
            })
            .obj()
            .query()
            .await
            .map_err(storage_err)
    }

    async fn claim_job(&self, id: &str, now: DateTime<Utc>) -> Result<Option<SyncJob>, AppError> {
        self.read_modify_write(collections::SYNC_JOBS, id, move |mut job: SyncJob| {
            if !job.is_due(now) {
                return None;
            }
            job.status = JobStatus::Running;
            job.attempts += 1;
            job.started_at = Some(now);
            Some(job)
        })
        .await
    }
}

#[async_trait]
impl RecordStore for FirestoreDb {
    /// Uses concurrent writes with a limit to avoid overloading Firestore.
    async fn append_records(
        &self,
        key: &CredentialKey,
        batch: &FetchBatch,
        fetched_at: DateTime<Utc>,
    ) -> Result<usize, AppError> {
        let records: Vec<ProviderRecord> = batch
            .records
            .iter()
            .map(|r| ProviderRecord::new(key, r, fetched_at))
            .collect();
        let count = records.len();

        stream::iter(records)
            .map(|record| async move {
                self.set_doc(collections::PROVIDER_RECORDS, &record.doc_id(), &record)
                    .await
            })
            .buffer_unordered(MAX_CONCURRENT_DB_OPS)
            .collect::<Vec<Result<(), AppError>>>()
            .await
            .into_iter()
            .collect::<Result<Vec<()>, AppError>>()?;

        tracing::debug!(
            user_id = %key.user_id,
            provider = %key.provider,
            count,
            "Stored provider records"
        );
        Ok(count)
    }
}

#[async_trait]
impl AuthorizationStore for FirestoreDb {
    async fn put_pending(&self, pending: &PendingAuthorization) -> Result<(), AppError> {
        self.set_doc(collections::PENDING_AUTHORIZATIONS, &pending.state, pending)
            .await
    }

    async fn take_pending(&self, state: &str) -> Result<Option<PendingAuthorization>, AppError> {
        let state = state.to_string();

        self.get_client()?
            .run_transaction_with_options::<_, _, FirestoreError>(
                |db, transaction| {
                    let state = state.clone();
                    async move {
                        let pending: Option<PendingAuthorization> = db
                            .fluent()
                            .select()
                            .by_id_in(collections::PENDING_AUTHORIZATIONS)
                            .obj()
                            .one(&state)
                            .await
                            .map_err(BackoffError::permanent)?;
                        if pending.is_some() {
                            db.fluent()
                                .delete()
                                .from(collections::PENDING_AUTHORIZATIONS)
                                .document_id(&state)
                                .add_to_transaction(transaction)
                                .map_err(BackoffError::permanent)?;
                        }
                        Ok(pending)
                    }
                    .boxed()
                },
                transaction_options(),
            )
            .await
            .map_err(|e| AppError::Storage(format!("Transaction failed: {}", e)))
    }
}
