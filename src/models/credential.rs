// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! OAuth credential models.

use crate::models::Provider;
use chrono::serde::ts_milliseconds;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of every per-(user, provider) record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CredentialKey {
    pub user_id: String,
    pub provider: Provider,
}

impl CredentialKey {
    pub fn new(user_id: impl Into<String>, provider: Provider) -> Self {
        Self {
            user_id: user_id.into(),
            provider,
        }
    }

    /// Firestore document ID for this key.
    pub fn doc_id(&self) -> String {
        format!("{}_{}", self.provider, urlencoding::encode(&self.user_id))
    }

    /// Additional authenticated data binding ciphertext to this key.
    pub fn aad(&self) -> String {
        format!("{}:{}", self.user_id, self.provider)
    }
}

impl fmt::Display for CredentialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.user_id)
    }
}

/// Decrypted credential for one user and provider.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub user_id: String,
    pub provider: Provider,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<String>,
    /// The provider's own ID for this user (athlete ID, Fitbit user ID, ...).
    pub provider_user_id: Option<String>,
}

impl Credential {
    pub fn key(&self) -> CredentialKey {
        CredentialKey::new(self.user_id.clone(), self.provider)
    }

    /// True when the access token expires at or before `now + margin`.
    pub fn needs_refresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        self.expires_at <= now + margin
    }

    /// Build a credential from a fresh grant.
    pub fn from_grant(key: &CredentialKey, grant: TokenGrant) -> Self {
        Self {
            user_id: key.user_id.clone(),
            provider: key.provider,
            access_token: grant.access_token,
            refresh_token: grant.refresh_token.unwrap_or_default(),
            expires_at: grant.expires_at,
            scopes: grant.scopes,
            provider_user_id: grant.provider_user_id,
        }
    }

    /// Apply a refresh grant. Providers that do not rotate refresh tokens
    /// omit it, in which case the current one is kept.
    pub fn refreshed(&self, grant: TokenGrant) -> Self {
        Self {
            user_id: self.user_id.clone(),
            provider: self.provider,
            access_token: grant.access_token,
            refresh_token: grant
                .refresh_token
                .unwrap_or_else(|| self.refresh_token.clone()),
            expires_at: grant.expires_at,
            scopes: if grant.scopes.is_empty() {
                self.scopes.clone()
            } else {
                grant.scopes
            },
            provider_user_id: grant
                .provider_user_id
                .or_else(|| self.provider_user_id.clone()),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user_id", &self.user_id)
            .field("provider", &self.provider)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .field("provider_user_id", &self.provider_user_id)
            .finish()
    }
}

/// Token endpoint response, normalized across providers.
#[derive(Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<String>,
    pub provider_user_id: Option<String>,
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .field("provider_user_id", &self.provider_user_id)
            .finish_non_exhaustive()
    }
}

/// Credential as stored at rest (tokens encrypted with KMS).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCredential {
    pub user_id: String,
    pub provider: Provider,
    pub provider_user_id: Option<String>,
    /// Encrypted access token (base64)
    pub access_token_encrypted: String,
    /// Encrypted refresh token (base64)
    pub refresh_token_encrypted: String,
    #[serde(with = "ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<String>,
    #[serde(with = "ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl StoredCredential {
    pub fn key(&self) -> CredentialKey {
        CredentialKey::new(self.user_id.clone(), self.provider)
    }
}

/// An authorization started but not yet completed.
///
/// Keyed by the OAuth `state` value and consumed exactly once by the callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAuthorization {
    pub state: String,
    pub user_id: String,
    pub provider: Provider,
    /// PKCE verifier, for providers that use PKCE.
    pub code_verifier: Option<String>,
    pub redirect_uri: String,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}
