// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Per-user integration status shown on the client's integration tiles.

use crate::models::{CredentialKey, Provider};
use chrono::serde::{ts_milliseconds, ts_milliseconds_option};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// User-visible state of one provider connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationStatus {
    Connected,
    Syncing,
    /// Refresh was rejected; the user has to reconnect.
    Error,
    Disconnected,
}

impl IntegrationStatus {
    /// Only `error` asks the user to do something.
    pub fn requires_user_action(self) -> bool {
        matches!(self, IntegrationStatus::Error)
    }

    /// Whether the scheduler should keep syncing this integration.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            IntegrationStatus::Connected | IntegrationStatus::Syncing
        )
    }
}

/// Stored integration record, keyed like the credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationRecord {
    pub user_id: String,
    pub provider: Provider,
    pub provider_user_id: Option<String>,
    pub status: IntegrationStatus,
    /// Consecutive failed refreshes since the last success.
    pub refresh_failures: u32,
    pub last_error: Option<String>,
    #[serde(with = "ts_milliseconds_option", default)]
    pub last_synced_at: Option<DateTime<Utc>>,
    #[serde(with = "ts_milliseconds")]
    pub connected_at: DateTime<Utc>,
    #[serde(with = "ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

/// A single mutation of an integration record.
///
/// Stores apply these atomically (read, [`IntegrationRecord::apply`], write)
/// so concurrent workers never lose each other's transitions.
#[derive(Debug, Clone, PartialEq)]
pub enum IntegrationUpdate {
    RefreshSucceeded,
    /// `grace` is the number of failures tolerated before the integration
    /// flips to `error`.
    RefreshFailed { error: String, grace: u32 },
    SyncStarted,
    SyncSucceeded,
    SyncFailed { error: String },
    /// The job gave up its slot without a result (deferred or timed out).
    SyncReleased,
    Disconnected,
}

impl IntegrationRecord {
    /// Fresh record for a just-completed OAuth connection.
    pub fn connected(
        key: &CredentialKey,
        provider_user_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: key.user_id.clone(),
            provider: key.provider,
            provider_user_id,
            status: IntegrationStatus::Connected,
            refresh_failures: 0,
            last_error: None,
            last_synced_at: None,
            connected_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> CredentialKey {
        CredentialKey::new(self.user_id.clone(), self.provider)
    }

    /// Apply an update in place.
    pub fn apply(&mut self, update: &IntegrationUpdate, now: DateTime<Utc>) {
        use IntegrationStatus::*;

        match update {
            IntegrationUpdate::RefreshSucceeded => {
                self.refresh_failures = 0;
            }
            IntegrationUpdate::RefreshFailed { error, grace } => {
                self.refresh_failures += 1;
                self.last_error = Some(error.clone());
                if self.refresh_failures > *grace && self.status != Disconnected {
                    self.status = Error;
                }
            }
            IntegrationUpdate::SyncStarted => {
                if self.status == Connected {
                    self.status = Syncing;
                }
            }
            IntegrationUpdate::SyncSucceeded => {
                if self.status == Syncing {
                    self.status = Connected;
                }
                self.last_synced_at = Some(now);
                self.last_error = None;
            }
            IntegrationUpdate::SyncFailed { error } => {
                if self.status == Syncing {
                    self.status = Connected;
                }
                self.last_error = Some(error.clone());
            }
            IntegrationUpdate::SyncReleased => {
                if self.status == Syncing {
                    self.status = Connected;
                }
            }
            IntegrationUpdate::Disconnected => {
                self.status = Disconnected;
                self.refresh_failures = 0;
            }
        }
        self.updated_at = now;
    }
}
