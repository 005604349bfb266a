// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Per-user, per-provider credential storage.
//!
//! Credentials are encrypted with KMS at rest. Decrypted credentials are
//! cached in memory so the hot path (a token that is still valid) needs no
//! Firestore or KMS round trip. The cache is per-instance: callers that
//! must observe writes from other instances use [`TokenStore::reload`].

use crate::db::Database;
use crate::error::AppError;
use crate::models::{Credential, CredentialKey};
use crate::services::KmsService;
use crate::time_utils::Clock;
use dashmap::DashMap;
use std::sync::Arc;

pub struct TokenStore {
    db: Arc<dyn Database>,
    kms: KmsService,
    clock: Arc<dyn Clock>,
    cache: DashMap<CredentialKey, Credential>,
}

impl TokenStore {
    pub fn new(db: Arc<dyn Database>, kms: KmsService, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            kms,
            clock,
            cache: DashMap::new(),
        }
    }

    /// Get a credential, from cache when possible.
    pub async fn get(&self, key: &CredentialKey) -> Result<Option<Credential>, AppError> {
        if let Some(cached) = self.cache.get(key) {
            return Ok(Some(cached.clone()));
        }
        self.reload(key).await
    }

    /// Read the credential from storage, bypassing and then refreshing the cache.
    pub async fn reload(&self, key: &CredentialKey) -> Result<Option<Credential>, AppError> {
        let Some(stored) = self.db.get_credential(key).await? else {
            self.cache.remove(key);
            return Ok(None);
        };

        let credential = self.kms.open(&stored).await?;
        self.cache.insert(key.clone(), credential.clone());
        Ok(Some(credential))
    }

    /// Encrypt and persist a credential, replacing any existing one.
    pub async fn put(&self, credential: &Credential) -> Result<(), AppError> {
        let key = credential.key();
        let stored = self.kms.seal(credential, self.clock.now()).await?;

        // Drop the cached copy first so a failed write never leaves the cache
        // ahead of storage.
        self.cache.remove(&key);
        self.db.put_credential(&stored).await?;
        self.cache.insert(key.clone(), credential.clone());

        tracing::debug!(user_id = %key.user_id, provider = %key.provider, "Credential stored");
        Ok(())
    }

    pub async fn delete(&self, key: &CredentialKey) -> Result<(), AppError> {
        self.cache.remove(key);
        self.db.delete_credential(key).await?;
        tracing::info!(user_id = %key.user_id, provider = %key.provider, "Credential deleted");
        Ok(())
    }

    /// Drop a cached credential without touching storage.
    pub fn invalidate(&self, key: &CredentialKey) {
        self.cache.remove(key);
    }
}
