// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Durable sync job descriptions.

use crate::models::{CredentialKey, Provider};
use chrono::serde::{ts_milliseconds, ts_milliseconds_option};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What caused a job to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobTrigger {
    Poll,
    Webhook,
    Manual,
    Connect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

/// One unit of sync work for a (user, provider) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: String,
    pub user_id: String,
    pub provider: Provider,
    pub trigger: JobTrigger,
    pub status: JobStatus,
    /// Earliest time the job may run.
    #[serde(with = "ts_milliseconds")]
    pub scheduled_at: DateTime<Utc>,
    pub attempts: u32,
    #[serde(with = "ts_milliseconds_option", default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(with = "ts_milliseconds_option", default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub records_fetched: usize,
    pub last_error: Option<String>,
}

impl SyncJob {
    /// New pending job.
    pub fn new(key: &CredentialKey, trigger: JobTrigger, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: key.user_id.clone(),
            provider: key.provider,
            trigger,
            status: JobStatus::Pending,
            scheduled_at,
            attempts: 0,
            started_at: None,
            finished_at: None,
            records_fetched: 0,
            last_error: None,
        }
    }

    pub fn key(&self) -> CredentialKey {
        CredentialKey::new(self.user_id.clone(), self.provider)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_at <= now
    }
}

/// Records fetched from a provider in one call.
#[derive(Debug, Default, Clone)]
pub struct FetchBatch {
    pub records: Vec<serde_json::Value>,
}

impl FetchBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
