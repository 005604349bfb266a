// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Cloud KMS service for encrypting/decrypting OAuth tokens.
//!
//! Uses direct KMS encryption (not envelope encryption). Every ciphertext is
//! bound to its credential key through additional authenticated data, so a
//! token copied onto another user's document fails to decrypt.

use crate::error::AppError;
use crate::models::{Credential, StoredCredential};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};

/// KMS encryption service.
#[derive(Clone)]
pub struct KmsService {
    /// Full resource path to the KMS key
    /// Format: projects/{project}/locations/{location}/keyRings/{ring}/cryptoKeys/{key}
    key_path: String,

    /// GCP KMS client
    client: Option<std::sync::Arc<google_cloud_kms::client::Client>>,
}

impl KmsService {
    const KEY_RING_NAME: &str = "cloudbrain-sync";

    /// Connect to GCP KMS.
    pub async fn new(project_id: &str, location: &str, key_name: &str) -> Result<Self, AppError> {
        let key_path = format!(
            "projects/{}/locations/{}/keyRings/{}/cryptoKeys/{}",
            project_id,
            location,
            Self::KEY_RING_NAME,
            key_name
        );

        let config = google_cloud_kms::client::ClientConfig::default()
            .with_auth()
            .await
            .map_err(|e| {
                AppError::Internal(anyhow::anyhow!("Failed to create KMS auth config: {}", e))
            })?;

        let client = google_cloud_kms::client::Client::new(config)
            .await
            .map_err(|e| {
                AppError::Internal(anyhow::anyhow!("Failed to create KMS client: {}", e))
            })?;

        Ok(Self {
            key_path,
            client: Some(std::sync::Arc::new(client)),
        })
    }

    /// Create a mock KMS service for testing (offline mode).
    /// Only available in tests and with the `test-utils` feature.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn new_mock() -> Self {
        Self {
            key_path: "projects/mock/locations/mock/keyRings/mock/cryptoKeys/mock".to_string(),
            client: None,
        }
    }

    /// Mock ciphertext layout: `base64(hex(sha256(aad)) ":" plaintext)`.
    #[cfg(any(test, feature = "test-utils"))]
    fn mock_aad_tag(aad: &[u8]) -> String {
        use sha2::{Digest, Sha256};
        hex::encode(Sha256::digest(aad))
    }

    /// Encrypt plaintext bound to `aad`. Returns base64-encoded ciphertext.
    pub async fn encrypt(&self, plaintext: &str, aad: &[u8]) -> Result<String, AppError> {
        use google_cloud_googleapis::cloud::kms::v1::EncryptRequest;

        #[cfg(any(test, feature = "test-utils"))]
        {
            if self.client.is_none() {
                let tagged = format!("{}:{}", Self::mock_aad_tag(aad), plaintext);
                return Ok(BASE64.encode(tagged));
            }
        }

        // Outside tests a missing client is always an error.
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("KMS client not connected")))?;

        let req = EncryptRequest {
            name: self.key_path.clone(),
            plaintext: plaintext.as_bytes().to_vec(),
            additional_authenticated_data: aad.to_vec(),
            ..Default::default()
        };

        let response = client
            .encrypt(req, None)
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("KMS encrypt failed: {}", e)))?;

        Ok(BASE64.encode(response.ciphertext))
    }

    /// Decrypt base64 ciphertext that was encrypted with the same `aad`.
    pub async fn decrypt(&self, ciphertext_b64: &str, aad: &[u8]) -> Result<String, AppError> {
        use google_cloud_googleapis::cloud::kms::v1::DecryptRequest;

        #[cfg(any(test, feature = "test-utils"))]
        {
            if self.client.is_none() {
                let bytes = BASE64.decode(ciphertext_b64).map_err(|e| {
                    AppError::Internal(anyhow::anyhow!("Base64 decode failed (mock): {}", e))
                })?;
                let text = String::from_utf8(bytes).map_err(|e| {
                    AppError::Internal(anyhow::anyhow!("UTF-8 decode failed (mock): {}", e))
                })?;
                let (tag, plaintext) = text.split_once(':').ok_or_else(|| {
                    AppError::Internal(anyhow::anyhow!("Malformed mock ciphertext"))
                })?;
                if tag != Self::mock_aad_tag(aad) {
                    return Err(AppError::Internal(anyhow::anyhow!(
                        "KMS decrypt failed (mock): AAD mismatch"
                    )));
                }
                return Ok(plaintext.to_string());
            }
        }

        let client = self
            .client
            .as_ref()
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("KMS client not connected")))?;

        let ciphertext = BASE64
            .decode(ciphertext_b64)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Base64 decode failed: {}", e)))?;

        let req = DecryptRequest {
            name: self.key_path.clone(),
            ciphertext,
            additional_authenticated_data: aad.to_vec(),
            ..Default::default()
        };

        let response = client
            .decrypt(req, None)
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("KMS decrypt failed: {}", e)))?;

        String::from_utf8(response.plaintext)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("UTF-8 decode failed: {}", e)))
    }

    /// Encrypt a credential's tokens for storage.
    pub async fn seal(
        &self,
        credential: &Credential,
        now: DateTime<Utc>,
    ) -> Result<StoredCredential, AppError> {
        let aad = credential.key().aad();
        let (access_token_encrypted, refresh_token_encrypted) = tokio::try_join!(
            self.encrypt(&credential.access_token, aad.as_bytes()),
            self.encrypt(&credential.refresh_token, aad.as_bytes()),
        )?;

        Ok(StoredCredential {
            user_id: credential.user_id.clone(),
            provider: credential.provider,
            provider_user_id: credential.provider_user_id.clone(),
            access_token_encrypted,
            refresh_token_encrypted,
            expires_at: credential.expires_at,
            scopes: credential.scopes.clone(),
            updated_at: now,
        })
    }

    /// Decrypt a stored credential.
    pub async fn open(&self, stored: &StoredCredential) -> Result<Credential, AppError> {
        let aad = stored.key().aad();
        let (access_token, refresh_token) = tokio::try_join!(
            self.decrypt(&stored.access_token_encrypted, aad.as_bytes()),
            self.decrypt(&stored.refresh_token_encrypted, aad.as_bytes()),
        )?;

        Ok(Credential {
            user_id: stored.user_id.clone(),
            provider: stored.provider,
            access_token,
            refresh_token,
            expires_at: stored.expires_at,
            scopes: stored.scopes.clone(),
            provider_user_id: stored.provider_user_id.clone(),
        })
    }
}
