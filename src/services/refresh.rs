// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Single-flight token refresh.
//!
//! For each (user, provider) at most one refresh is in flight per instance.
//! Concurrent callers share the same future and receive the same result.
//! Across instances, a refresh token that another instance already rotated
//! comes back as `invalid_grant`; the winner's credential is then read from
//! storage instead of failing.

use crate::db::Database;
use crate::error::RefreshError;
use crate::models::{Credential, CredentialKey, IntegrationStatus, IntegrationUpdate};
use crate::services::provider_client::{ProviderClient, ProviderError};
use crate::services::TokenStore;
use crate::time_utils::{to_chrono, Clock};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::sync::Arc;
use std::time::Duration;

type RefreshFuture = Shared<BoxFuture<'static, Result<Credential, RefreshError>>>;

/// Attempts to store a refreshed credential before giving up.
const PERSIST_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    tokens: Arc<TokenStore>,
    db: Arc<dyn Database>,
    provider: Arc<dyn ProviderClient>,
    clock: Arc<dyn Clock>,
    margin: chrono::Duration,
    failure_grace: u32,
    in_flight: DashMap<CredentialKey, RefreshFuture>,
}

impl RefreshCoordinator {
    pub fn new(
        tokens: Arc<TokenStore>,
        db: Arc<dyn Database>,
        provider: Arc<dyn ProviderClient>,
        clock: Arc<dyn Clock>,
        margin: Duration,
        failure_grace: u32,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                tokens,
                db,
                provider,
                clock,
                margin: to_chrono(margin),
                failure_grace,
                in_flight: DashMap::new(),
            }),
        }
    }

    /// Return a credential valid for at least the safety margin, refreshing
    /// it first if necessary.
    pub async fn ensure_valid(&self, key: &CredentialKey) -> Result<Credential, RefreshError> {
        let credential = self
            .inner
            .tokens
            .get(key)
            .await
            .map_err(|e| RefreshError::Storage(e.to_string()))?
            .ok_or(RefreshError::NoCredential)?;

        if !credential.needs_refresh(self.inner.clock.now(), self.inner.margin) {
            return Ok(credential);
        }

        self.shared_refresh(key, None).await
    }

    /// Refresh even though the credential looks valid, because the provider
    /// rejected `rejected_access_token`.
    ///
    /// If another caller already replaced that token, the replacement is
    /// returned without a second refresh.
    pub async fn force_refresh(
        &self,
        key: &CredentialKey,
        rejected_access_token: &str,
    ) -> Result<Credential, RefreshError> {
        self.shared_refresh(key, Some(rejected_access_token.to_string()))
            .await
    }

    /// Number of refreshes currently in flight (for tests and health).
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    fn shared_refresh(&self, key: &CredentialKey, rejected: Option<String>) -> RefreshFuture {
        match self.inner.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let inner = self.inner.clone();
                let key = key.clone();
                let future = async move {
                    let result = inner.refresh(&key, rejected.as_deref()).await;
                    inner.in_flight.remove(&key);
                    result
                }
                .boxed()
                .shared();
                entry.insert(future.clone());
                future
            }
        }
    }
}

impl Inner {
    async fn refresh(
        &self,
        key: &CredentialKey,
        rejected: Option<&str>,
    ) -> Result<Credential, RefreshError> {
        let integration = self
            .db
            .get_integration(key)
            .await
            .map_err(|e| RefreshError::Storage(e.to_string()))?;
        if integration.is_some_and(|r| r.status == IntegrationStatus::Error) {
            tracing::debug!(
                user_id = %key.user_id,
                provider = %key.provider,
                "Integration needs re-authorization, not refreshing"
            );
            return Err(RefreshError::ReauthRequired);
        }

        // Double-check against storage: another task or instance may have
        // refreshed while this one was queued.
        let current = self
            .tokens
            .reload(key)
            .await
            .map_err(|e| RefreshError::Storage(e.to_string()))?
            .ok_or(RefreshError::NoCredential)?;

        let now = self.clock.now();
        let already_fresh = match rejected {
            Some(token) => current.access_token != token,
            None => !current.needs_refresh(now, self.margin),
        };
        if already_fresh {
            tracing::debug!(
                user_id = %key.user_id,
                provider = %key.provider,
                "Credential already refreshed"
            );
            return Ok(current);
        }

        tracing::info!(
            user_id = %key.user_id,
            provider = %key.provider,
            expires_at = %current.expires_at,
            forced = rejected.is_some(),
            "Refreshing access token"
        );

        match self
            .provider
            .refresh(key.provider, &current.refresh_token)
            .await
        {
            Ok(grant) => {
                let refreshed = current.refreshed(grant);
                self.persist(&refreshed).await?;
                self.record(key, IntegrationUpdate::RefreshSucceeded).await;

                tracing::info!(
                    user_id = %key.user_id,
                    provider = %key.provider,
                    expires_at = %refreshed.expires_at,
                    "Token refreshed"
                );
                Ok(refreshed)
            }
            Err(ProviderError::InvalidGrant(detail)) => {
                // Another instance may have won the refresh race and rotated
                // the refresh token; use its credential if so.
                let latest = self
                    .tokens
                    .reload(key)
                    .await
                    .map_err(|e| RefreshError::Storage(e.to_string()))?;
                if let Some(latest) = latest {
                    if latest.access_token != current.access_token
                        && !latest.needs_refresh(self.clock.now(), self.margin)
                    {
                        tracing::info!(
                            user_id = %key.user_id,
                            provider = %key.provider,
                            "Refresh race detected - another instance won, using its tokens"
                        );
                        return Ok(latest);
                    }
                }

                let update = IntegrationUpdate::RefreshFailed {
                    error: format!("refresh rejected: {}", detail),
                    grace: self.failure_grace,
                };
                let status = self.record(key, update).await;

                if status == Some(IntegrationStatus::Error) {
                    tracing::error!(
                        user_id = %key.user_id,
                        provider = %key.provider,
                        "Refresh rejected past grace, re-authorization required"
                    );
                    Err(RefreshError::ReauthRequired)
                } else {
                    tracing::warn!(
                        user_id = %key.user_id,
                        provider = %key.provider,
                        "Refresh rejected, will retry"
                    );
                    Err(RefreshError::Rejected(detail))
                }
            }
            Err(e) => {
                tracing::warn!(
                    user_id = %key.user_id,
                    provider = %key.provider,
                    error = %e,
                    "Token refresh failed"
                );
                Err(RefreshError::Transient(e.to_string()))
            }
        }
    }

    async fn persist(&self, credential: &Credential) -> Result<(), RefreshError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.tokens.put(credential).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < PERSIST_ATTEMPTS => {
                    tracing::warn!(
                        user_id = %credential.user_id,
                        provider = %credential.provider,
                        attempt,
                        error = %e,
                        "Failed to store refreshed credential, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                }
                Err(e) => {
                    tracing::error!(
                        user_id = %credential.user_id,
                        provider = %credential.provider,
                        error = %e,
                        "Failed to store refreshed credential"
                    );
                    return Err(RefreshError::Storage(e.to_string()));
                }
            }
        }
    }

    /// Apply an integration update, logging (not propagating) storage errors.
    async fn record(
        &self,
        key: &CredentialKey,
        update: IntegrationUpdate,
    ) -> Option<IntegrationStatus> {
        match self
            .db
            .update_integration(key, &update, self.clock.now())
            .await
        {
            Ok(record) => record.map(|r| r.status),
            Err(e) => {
                tracing::warn!(
                    user_id = %key.user_id,
                    provider = %key.provider,
                    error = %e,
                    "Failed to update integration after refresh"
                );
                None
            }
        }
    }
}
