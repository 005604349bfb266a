// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! OAuth authorization-code flow: building the provider redirect and
//! completing the callback.

use crate::config::Config;
use crate::db::Database;
use crate::error::AppError;
use crate::models::{
    Credential, CredentialKey, IntegrationRecord, IntegrationUpdate, JobTrigger,
    PendingAuthorization, Provider, SubscriptionCardinality, SubscriptionOwner,
};
use crate::services::provider_client::ProviderClient;
use crate::services::{SyncScheduler, TokenStore, WebhookSubscriptionManager};
use crate::time_utils::Clock;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// How long a user has to finish the provider consent screen.
const AUTHORIZATION_MAX_AGE_MINUTES: i64 = 10;

/// Where to send the user to grant access.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationRequest {
    pub url: String,
    #[serde(skip)]
    pub state: String,
}

pub struct OAuthService {
    config: Arc<Config>,
    db: Arc<dyn Database>,
    tokens: Arc<TokenStore>,
    provider: Arc<dyn ProviderClient>,
    subscriptions: Arc<WebhookSubscriptionManager>,
    scheduler: SyncScheduler,
    clock: Arc<dyn Clock>,
}

impl OAuthService {
    pub fn new(
        config: Arc<Config>,
        db: Arc<dyn Database>,
        tokens: Arc<TokenStore>,
        provider: Arc<dyn ProviderClient>,
        subscriptions: Arc<WebhookSubscriptionManager>,
        scheduler: SyncScheduler,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            db,
            tokens,
            provider,
            subscriptions,
            scheduler,
            clock,
        }
    }

    /// Start a connection: persist a pending authorization and return the
    /// provider's consent URL.
    pub async fn begin(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<AuthorizationRequest, AppError> {
        let client = self
            .config
            .provider(provider)
            .ok_or_else(|| AppError::BadRequest(format!("{} is not enabled", provider)))?;
        let caps = provider.capabilities();

        let state = random_token();
        let redirect_uri = self.config.callback_url(provider);
        let scope = caps.default_scopes.join(caps.scope_separator);

        let mut params = vec![
            ("client_id", client.client_id.clone()),
            ("redirect_uri", redirect_uri.clone()),
            ("response_type", "code".to_string()),
            ("scope", scope),
            ("state", state.clone()),
        ];

        let code_verifier = if caps.uses_pkce {
            let verifier = random_token();
            params.push(("code_challenge", pkce_challenge(&verifier)));
            params.push(("code_challenge_method", "S256".to_string()));
            Some(verifier)
        } else {
            None
        };

        let url = reqwest::Url::parse_with_params(caps.authorize_url, &params)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("bad authorize URL: {}", e)))?;

        let pending = PendingAuthorization {
            state: state.clone(),
            user_id: user_id.to_string(),
            provider,
            code_verifier,
            redirect_uri,
            created_at: self.clock.now(),
        };
        self.db.put_pending(&pending).await?;

        tracing::info!(user_id, provider = %provider, "Authorization started");

        Ok(AuthorizationRequest {
            url: url.into(),
            state,
        })
    }

    /// Finish a connection from the provider callback.
    ///
    /// The pending authorization is consumed whether or not the exchange
    /// succeeds.
    pub async fn complete(
        &self,
        provider: Provider,
        code: &str,
        state: &str,
    ) -> Result<CredentialKey, AppError> {
        let pending = self
            .db
            .take_pending(state)
            .await?
            .ok_or_else(|| AppError::BadRequest("Unknown or already used state".to_string()))?;

        if pending.provider != provider {
            return Err(AppError::BadRequest(
                "State was issued for a different provider".to_string(),
            ));
        }

        let now = self.clock.now();
        if now - pending.created_at > chrono::Duration::minutes(AUTHORIZATION_MAX_AGE_MINUTES) {
            return Err(AppError::BadRequest("Authorization expired".to_string()));
        }

        let key = CredentialKey::new(pending.user_id.clone(), provider);

        let grant = self
            .provider
            .exchange_code(
                provider,
                code,
                &pending.redirect_uri,
                pending.code_verifier.as_deref(),
            )
            .await
            .map_err(|e| {
                tracing::error!(
                    user_id = %key.user_id,
                    provider = %provider,
                    error = %e,
                    "Code exchange failed"
                );
                AppError::ProviderApi(e.to_string())
            })?;

        if grant.refresh_token.is_none() {
            return Err(AppError::ProviderApi(
                "Token response had no refresh token".to_string(),
            ));
        }

        let credential = Credential::from_grant(&key, grant);
        self.tokens.put(&credential).await?;

        let record =
            IntegrationRecord::connected(&key, credential.provider_user_id.clone(), self.clock.now());
        self.db.put_integration(&record).await?;

        tracing::info!(
            user_id = %key.user_id,
            provider = %provider,
            provider_user_id = ?credential.provider_user_id,
            "Integration connected"
        );

        if provider
            .capabilities()
            .webhook
            .is_some_and(|w| w.cardinality == SubscriptionCardinality::PerUser)
        {
            let owner = SubscriptionOwner::User(key.user_id.clone());
            if let Err(e) = self.subscriptions.ensure_subscription(provider, owner).await {
                tracing::warn!(
                    user_id = %key.user_id,
                    provider = %provider,
                    error = %e,
                    "Webhook subscription failed, pair will be polled"
                );
            }
        }

        self.scheduler.enqueue(&key, JobTrigger::Connect).await?;
        Ok(key)
    }

    /// Remove the stored credential and mark the integration disconnected.
    pub async fn disconnect(&self, key: &CredentialKey) -> Result<(), AppError> {
        self.tokens.delete(key).await?;

        let record = self
            .db
            .update_integration(key, &IntegrationUpdate::Disconnected, self.clock.now())
            .await?;
        if record.is_none() {
            return Err(AppError::NotFound(format!("{} integration", key.provider)));
        }

        if key
            .provider
            .capabilities()
            .webhook
            .is_some_and(|w| w.cardinality == SubscriptionCardinality::PerUser)
        {
            self.subscriptions
                .remove_user_subscription(key.provider, &key.user_id)
                .await?;
        }

        tracing::info!(
            user_id = %key.user_id,
            provider = %key.provider,
            "Integration disconnected"
        );
        Ok(())
    }
}

/// 32 random bytes, URL-safe base64.
fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// RFC 7636 S256 code challenge.
fn pkce_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}
