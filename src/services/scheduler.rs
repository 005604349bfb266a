// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Periodic sync scheduling and the job worker pool.
//!
//! A tick renews webhook subscriptions, reclaims abandoned jobs, creates
//! poll jobs for pairs that are due, then executes every due job on a
//! bounded pool. Handlers never sync inline; they [`enqueue`] a job and
//! wake the loop.
//!
//! [`enqueue`]: SyncScheduler::enqueue

use crate::config::SchedulerSettings;
use crate::db::Database;
use crate::error::{AppError, RefreshError, SyncError};
use crate::models::{
    CredentialKey, FetchBatch, IntegrationRecord, IntegrationStatus, IntegrationUpdate,
    JobStatus, JobTrigger, Provider, RateLimitDecision, RenewalResult, SyncJob,
};
use crate::services::provider_client::{ProviderClient, ProviderError};
use crate::services::{RateLimiter, RefreshCoordinator, WebhookSubscriptionManager};
use crate::time_utils::{to_chrono, Clock};
use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Most jobs picked up in one pass.
const MAX_JOBS_PER_PASS: usize = 500;

/// How far back the first sync of a pair reaches.
const INITIAL_LOOKBACK_DAYS: i64 = 30;

/// Wait after a provider 429 that carried no `Retry-After`.
const DEFAULT_PROVIDER_BACKOFF: Duration = Duration::from_secs(60);

const RETRY_BASE: Duration = Duration::from_secs(30);
const RETRY_CAP: Duration = Duration::from_secs(3600);

/// Counts from one tick, returned by `POST /tasks/tick`.
#[derive(Debug, Default, Clone, Serialize)]
pub struct TickReport {
    pub subscriptions: RenewalResult,
    pub reclaimed: usize,
    pub enqueued: usize,
    #[serde(flatten)]
    pub jobs: JobCounts,
}

/// Job outcomes from one execution pass.
#[derive(Debug, Default, Clone, Serialize)]
pub struct JobCounts {
    pub executed: usize,
    pub succeeded: usize,
    pub deferred: usize,
    pub retried: usize,
    pub failed: usize,
    pub timed_out: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Succeeded,
    Deferred,
    Retried,
    Failed,
    TimedOut,
}

/// Why an authenticated fetch did not produce data.
#[derive(Debug)]
enum FetchFailure {
    /// Out of quota, locally or at the provider; try again after the wait.
    Deferred(Duration),
    Refresh(RefreshError),
    Provider(ProviderError),
    Storage(AppError),
}

impl From<FetchFailure> for AppError {
    fn from(failure: FetchFailure) -> Self {
        match failure {
            FetchFailure::Deferred(retry_after) => AppError::RateLimited(retry_after),
            FetchFailure::Refresh(e) => AppError::Refresh(e),
            FetchFailure::Provider(ProviderError::Unauthorized) => {
                AppError::Sync(SyncError::Unauthorized)
            }
            FetchFailure::Provider(e) if e.is_transient() => {
                AppError::Sync(SyncError::Transient(e.to_string()))
            }
            FetchFailure::Provider(e) => AppError::ProviderApi(e.to_string()),
            FetchFailure::Storage(e) => e,
        }
    }
}

#[derive(Clone)]
pub struct SyncScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    db: Arc<dyn Database>,
    refresh: RefreshCoordinator,
    limiter: Arc<RateLimiter>,
    provider: Arc<dyn ProviderClient>,
    subscriptions: Arc<WebhookSubscriptionManager>,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
    providers: Vec<Provider>,
    wake: Notify,
}

impl SyncScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<dyn Database>,
        refresh: RefreshCoordinator,
        limiter: Arc<RateLimiter>,
        provider: Arc<dyn ProviderClient>,
        subscriptions: Arc<WebhookSubscriptionManager>,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
        providers: Vec<Provider>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                refresh,
                limiter,
                provider,
                subscriptions,
                clock,
                settings,
                providers,
                wake: Notify::new(),
            }),
        }
    }

    /// One full scheduling pass.
    pub async fn tick(&self) -> Result<TickReport, AppError> {
        let mut report = TickReport::default();

        for &provider in &self.inner.providers {
            match self.inner.subscriptions.renew_if_needed(provider).await {
                Ok(result) => report.subscriptions.merge(&result),
                Err(e) => {
                    tracing::error!(provider = %provider, error = %e, "Subscription renewal pass failed");
                }
            }
        }

        report.reclaimed = self.reclaim_abandoned().await?;
        report.enqueued = self.enqueue_due_polls().await?;
        report.jobs = self.run_due().await?;

        tracing::info!(
            renewed = report.subscriptions.renewed,
            reclaimed = report.reclaimed,
            enqueued = report.enqueued,
            executed = report.jobs.executed,
            failed = report.jobs.failed,
            "Scheduler tick complete"
        );
        Ok(report)
    }

    /// Put jobs whose worker vanished (running for over twice the job
    /// timeout) back to `pending`.
    async fn reclaim_abandoned(&self) -> Result<usize, AppError> {
        let now = self.inner.clock.now();
        let cutoff = now - to_chrono(self.inner.settings.job_timeout * 2);

        let mut reclaimed = 0;
        for mut job in self.inner.db.stale_running_jobs(cutoff).await? {
            tracing::warn!(
                job_id = %job.id,
                user_id = %job.user_id,
                provider = %job.provider,
                "Reclaiming abandoned sync job"
            );
            job.status = JobStatus::Pending;
            job.scheduled_at = now;
            job.last_error = Some("abandoned by worker".to_string());
            self.inner.db.put_job(&job).await?;
            self.record(&job.key(), IntegrationUpdate::SyncReleased).await;
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    /// Create poll jobs for active pairs whose last sync is older than their
    /// poll interval.
    async fn enqueue_due_polls(&self) -> Result<usize, AppError> {
        let now = self.inner.clock.now();
        let mut enqueued = 0;

        for record in self.inner.db.active_integrations().await? {
            if record.status == IntegrationStatus::Syncing
                || !self.inner.providers.contains(&record.provider)
            {
                continue;
            }

            // Unknown coverage polls at the shorter interval.
            let covered = match self
                .inner
                .subscriptions
                .covers(record.provider, &record.user_id)
                .await
            {
                Ok(covered) => covered,
                Err(e) => {
                    tracing::warn!(
                        user_id = %record.user_id,
                        provider = %record.provider,
                        error = %e,
                        "Subscription lookup failed, polling"
                    );
                    false
                }
            };
            let interval = if covered {
                self.inner.settings.reconcile_interval
            } else {
                self.inner.settings.poll_interval
            };
            if !poll_due(&record, to_chrono(interval), now) {
                continue;
            }

            let key = record.key();
            let job = SyncJob::new(&key, JobTrigger::Poll, now);
            let created = match self.inner.db.pending_job_for(&key).await {
                Ok(Some(_)) => continue,
                Ok(None) => self.inner.db.put_job(&job).await,
                Err(e) => Err(e),
            };
            if let Err(e) = created {
                tracing::warn!(
                    user_id = %key.user_id,
                    provider = %key.provider,
                    error = %e,
                    "Failed to create poll job"
                );
                continue;
            }
            tracing::debug!(
                job_id = %job.id,
                user_id = %key.user_id,
                provider = %key.provider,
                covered,
                "Poll job created"
            );
            enqueued += 1;
        }
        Ok(enqueued)
    }

    /// Execute every due pending job on the bounded pool.
    pub async fn run_due(&self) -> Result<JobCounts, AppError> {
        let now = self.inner.clock.now();
        let due = self.inner.db.due_jobs(now, MAX_JOBS_PER_PASS).await?;

        // One job per pair per pass; duplicates stay pending.
        let mut seen = HashSet::new();
        let jobs: Vec<SyncJob> = due
            .into_iter()
            .filter(|job| seen.insert(job.key()))
            .collect();

        let executed = AtomicUsize::new(0);
        let succeeded = AtomicUsize::new(0);
        let deferred = AtomicUsize::new(0);
        let retried = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        let timed_out = AtomicUsize::new(0);

        stream::iter(jobs)
            .for_each_concurrent(self.inner.settings.concurrency.max(1), |job| {
                let (executed, succeeded, deferred, retried, failed, timed_out) =
                    (&executed, &succeeded, &deferred, &retried, &failed, &timed_out);
                async move {
                    let job_id = job.id.clone();
                    let outcome = match self.run_job(job).await {
                        Ok(Some(outcome)) => outcome,
                        Ok(None) => return,
                        Err(e) => {
                            tracing::error!(job_id = %job_id, error = %e, "Sync job bookkeeping failed");
                            return;
                        }
                    };

                    executed.fetch_add(1, Ordering::Relaxed);
                    let counter = match outcome {
                        JobOutcome::Succeeded => succeeded,
                        JobOutcome::Deferred => deferred,
                        JobOutcome::Retried => retried,
                        JobOutcome::Failed => failed,
                        JobOutcome::TimedOut => timed_out,
                    };
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            })
            .await;

        Ok(JobCounts {
            executed: executed.into_inner(),
            succeeded: succeeded.into_inner(),
            deferred: deferred.into_inner(),
            retried: retried.into_inner(),
            failed: failed.into_inner(),
            timed_out: timed_out.into_inner(),
        })
    }

    /// Claim and execute one job. `None` when another worker claimed it.
    async fn run_job(&self, job: SyncJob) -> Result<Option<JobOutcome>, AppError> {
        let db = &self.inner.db;
        let settings = &self.inner.settings;

        let Some(mut job) = db.claim_job(&job.id, self.inner.clock.now()).await? else {
            return Ok(None);
        };
        let key = job.key();

        let record = self.record(&key, IntegrationUpdate::SyncStarted).await;
        let Some(record) = record.filter(|r| r.status.is_active()) else {
            job.status = JobStatus::Failed;
            job.finished_at = Some(self.inner.clock.now());
            job.last_error = Some("integration is not connected".to_string());
            db.put_job(&job).await?;
            tracing::info!(
                job_id = %job.id,
                user_id = %key.user_id,
                provider = %key.provider,
                "Dropping sync job for inactive integration"
            );
            return Ok(Some(JobOutcome::Failed));
        };

        let since = record
            .last_synced_at
            .unwrap_or_else(|| self.inner.clock.now() - chrono::Duration::days(INITIAL_LOOKBACK_DAYS));

        tracing::debug!(
            job_id = %job.id,
            user_id = %key.user_id,
            provider = %key.provider,
            trigger = ?job.trigger,
            attempt = job.attempts,
            "Running sync job"
        );

        let result = tokio::time::timeout(settings.job_timeout, self.sync_pair(&key, since)).await;
        let now = self.inner.clock.now();

        let outcome = match result {
            Ok(Ok(count)) => {
                job.status = JobStatus::Done;
                job.finished_at = Some(now);
                job.records_fetched = count;
                job.last_error = None;
                db.put_job(&job).await?;
                self.record(&key, IntegrationUpdate::SyncSucceeded).await;

                tracing::info!(
                    job_id = %job.id,
                    user_id = %key.user_id,
                    provider = %key.provider,
                    records = count,
                    "Sync job complete"
                );
                JobOutcome::Succeeded
            }
            Ok(Err(FetchFailure::Deferred(retry_after))) => {
                // Quota waits don't use up an attempt.
                job.status = JobStatus::Pending;
                job.scheduled_at = now + to_chrono(retry_after);
                job.attempts = job.attempts.saturating_sub(1);
                db.put_job(&job).await?;
                self.record(&key, IntegrationUpdate::SyncReleased).await;

                tracing::info!(
                    job_id = %job.id,
                    user_id = %key.user_id,
                    provider = %key.provider,
                    retry_after_secs = retry_after.as_secs(),
                    "Sync job deferred by rate limit"
                );
                JobOutcome::Deferred
            }
            Ok(Err(FetchFailure::Refresh(e))) if !e.is_transient() => {
                job.status = JobStatus::Failed;
                job.finished_at = Some(now);
                job.last_error = Some(e.to_string());
                db.put_job(&job).await?;
                self.record(&key, IntegrationUpdate::SyncReleased).await;

                tracing::error!(
                    job_id = %job.id,
                    user_id = %key.user_id,
                    provider = %key.provider,
                    error = %e,
                    "Sync job failed: no usable credential"
                );
                JobOutcome::Failed
            }
            Ok(Err(failure)) => {
                let (retryable, error) = match failure {
                    FetchFailure::Provider(e) => (e.is_transient(), e.to_string()),
                    FetchFailure::Refresh(e) => (true, e.to_string()),
                    other => (true, AppError::from(other).to_string()),
                };

                if retryable && job.attempts < settings.max_attempts {
                    let delay = retry_backoff(job.attempts);
                    job.status = JobStatus::Pending;
                    job.scheduled_at = now + to_chrono(delay);
                    job.last_error = Some(error.clone());
                    db.put_job(&job).await?;
                    self.record(&key, IntegrationUpdate::SyncReleased).await;

                    tracing::warn!(
                        job_id = %job.id,
                        user_id = %key.user_id,
                        provider = %key.provider,
                        attempt = job.attempts,
                        retry_in_secs = delay.as_secs(),
                        error = %error,
                        "Sync job failed, will retry"
                    );
                    JobOutcome::Retried
                } else {
                    self.fail_job(&mut job, now, error).await?;
                    JobOutcome::Failed
                }
            }
            Err(_) => {
                if job.attempts < settings.max_attempts {
                    job.status = JobStatus::Pending;
                    job.scheduled_at = now;
                    job.last_error = Some(SyncError::Timeout(settings.job_timeout).to_string());
                    db.put_job(&job).await?;
                    self.record(&key, IntegrationUpdate::SyncReleased).await;

                    tracing::warn!(
                        job_id = %job.id,
                        user_id = %key.user_id,
                        provider = %key.provider,
                        timeout_secs = settings.job_timeout.as_secs(),
                        "Sync job timed out, abandoned until next tick"
                    );
                } else {
                    let error = SyncError::Timeout(settings.job_timeout).to_string();
                    self.fail_job(&mut job, now, error).await?;
                }
                JobOutcome::TimedOut
            }
        };

        Ok(Some(outcome))
    }

    async fn fail_job(
        &self,
        job: &mut SyncJob,
        now: DateTime<Utc>,
        error: String,
    ) -> Result<(), AppError> {
        job.status = JobStatus::Failed;
        job.finished_at = Some(now);
        job.last_error = Some(error.clone());
        self.inner.db.put_job(job).await?;

        let key = job.key();
        self.record(&key, IntegrationUpdate::SyncFailed { error: error.clone() })
            .await;

        tracing::error!(
            job_id = %job.id,
            user_id = %key.user_id,
            provider = %key.provider,
            attempts = job.attempts,
            error = %error,
            "Sync job failed"
        );
        Ok(())
    }

    /// Fetch and persist one pair's records. Returns the number stored.
    async fn sync_pair(
        &self,
        key: &CredentialKey,
        since: DateTime<Utc>,
    ) -> Result<usize, FetchFailure> {
        let batch = self.fetch_with_auth(key, since).await?;
        if batch.is_empty() {
            return Ok(0);
        }
        self.inner
            .db
            .append_records(key, &batch, self.inner.clock.now())
            .await
            .map_err(FetchFailure::Storage)
    }

    /// ensure_valid, then acquire quota, then fetch. A 401 on a token that
    /// looked valid gets one forced refresh and retry.
    async fn fetch_with_auth(
        &self,
        key: &CredentialKey,
        since: DateTime<Utc>,
    ) -> Result<FetchBatch, FetchFailure> {
        let credential = self
            .inner
            .refresh
            .ensure_valid(key)
            .await
            .map_err(FetchFailure::Refresh)?;

        self.acquire(key).await?;
        match self
            .inner
            .provider
            .fetch(key.provider, &credential.access_token, since)
            .await
        {
            Ok(batch) => Ok(batch),
            Err(ProviderError::Unauthorized) => {
                tracing::warn!(
                    user_id = %key.user_id,
                    provider = %key.provider,
                    "Provider rejected access token, forcing refresh"
                );
                let credential = self
                    .inner
                    .refresh
                    .force_refresh(key, &credential.access_token)
                    .await
                    .map_err(FetchFailure::Refresh)?;

                self.acquire(key).await?;
                self.inner
                    .provider
                    .fetch(key.provider, &credential.access_token, since)
                    .await
                    .map_err(classify)
            }
            Err(e) => Err(classify(e)),
        }
    }

    async fn acquire(&self, key: &CredentialKey) -> Result<(), FetchFailure> {
        match self
            .inner
            .limiter
            .acquire_for(key)
            .await
            .map_err(FetchFailure::Storage)?
        {
            RateLimitDecision::Allowed => Ok(()),
            RateLimitDecision::Denied { retry_after } => Err(FetchFailure::Deferred(retry_after)),
        }
    }

    /// On-demand fetch for chat requests. Nothing is persisted.
    pub async fn fetch_fresh(
        &self,
        user_id: &str,
        provider: Provider,
        since: DateTime<Utc>,
    ) -> Result<FetchBatch, AppError> {
        let key = CredentialKey::new(user_id, provider);
        let batch = self.fetch_with_auth(&key, since).await?;

        tracing::debug!(
            user_id,
            provider = %provider,
            records = batch.len(),
            "Fresh data fetched"
        );
        Ok(batch)
    }

    /// Queue a sync for a pair. An existing pending job is reused and pulled
    /// forward to now.
    pub async fn enqueue(
        &self,
        key: &CredentialKey,
        trigger: JobTrigger,
    ) -> Result<SyncJob, AppError> {
        let now = self.inner.clock.now();

        let job = match self.inner.db.pending_job_for(key).await? {
            Some(mut job) => {
                if job.scheduled_at > now {
                    job.scheduled_at = now;
                    self.inner.db.put_job(&job).await?;
                }
                job
            }
            None => {
                let job = SyncJob::new(key, trigger, now);
                self.inner.db.put_job(&job).await?;
                job
            }
        };

        tracing::info!(
            job_id = %job.id,
            user_id = %key.user_id,
            provider = %key.provider,
            trigger = ?trigger,
            "Sync job enqueued"
        );
        self.inner.wake.notify_one();
        Ok(job)
    }

    /// Embedded scheduling loop. Ticks every `interval`, runs due jobs as
    /// soon as something is enqueued, and exits when `shutdown` resolves.
    pub async fn run<F>(self, interval: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        tracing::info!(interval_secs = interval.as_secs(), "Sync scheduler started");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Sync scheduler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "Scheduler tick failed");
                    }
                }
                _ = self.inner.wake.notified() => {
                    if let Err(e) = self.run_due().await {
                        tracing::error!(error = %e, "Running enqueued jobs failed");
                    }
                }
            }
        }
    }

    /// Apply an integration update, logging storage errors.
    async fn record(
        &self,
        key: &CredentialKey,
        update: IntegrationUpdate,
    ) -> Option<IntegrationRecord> {
        match self
            .inner
            .db
            .update_integration(key, &update, self.inner.clock.now())
            .await
        {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(
                    user_id = %key.user_id,
                    provider = %key.provider,
                    error = %e,
                    "Failed to update integration"
                );
                None
            }
        }
    }
}

fn classify(e: ProviderError) -> FetchFailure {
    match e {
        ProviderError::RateLimited { retry_after } => {
            FetchFailure::Deferred(retry_after.unwrap_or(DEFAULT_PROVIDER_BACKOFF))
        }
        e => FetchFailure::Provider(e),
    }
}

fn poll_due(record: &IntegrationRecord, interval: chrono::Duration, now: DateTime<Utc>) -> bool {
    record
        .last_synced_at
        .is_none_or(|last| now - last >= interval)
}

/// Delay before retry `attempt` (1-based): 30s doubling, capped at an hour.
fn retry_backoff(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    (RETRY_BASE * 2u32.pow(exponent)).min(RETRY_CAP)
}
