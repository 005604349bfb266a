// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Offline test doubles: a scriptable provider and a fully wired app over
//! in-memory storage and a manual clock.
//!
//! Only available in debug/test builds.

use crate::config::Config;
use crate::db::{Database, IntegrationStore, MemoryDb};
use crate::models::{
    Credential, CredentialKey, FetchBatch, IntegrationRecord, Provider, SubscriptionGrant,
    TokenGrant,
};
use crate::services::{KmsService, MemoryBackend, ProviderClient, ProviderError};
use crate::time_utils::{Clock, ManualClock};
use crate::AppState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// A [`ProviderClient`] whose answers are scripted.
///
/// Each operation pops the next scripted result; once its script is empty
/// it succeeds with a default value derived from the clock. Refresh grants
/// are valid for one hour and rotate the refresh token.
pub struct FakeProvider {
    clock: Arc<dyn Clock>,
    refresh_delay: Mutex<Duration>,

    exchange_results: Mutex<VecDeque<Result<TokenGrant, ProviderError>>>,
    refresh_results: Mutex<VecDeque<Result<TokenGrant, ProviderError>>>,
    fetch_results: Mutex<VecDeque<Result<FetchBatch, ProviderError>>>,
    create_results: Mutex<VecDeque<Result<SubscriptionGrant, ProviderError>>>,
    renew_results: Mutex<VecDeque<Result<SubscriptionGrant, ProviderError>>>,

    /// Access tokens presented to `fetch`, in order.
    fetch_tokens: Mutex<Vec<String>>,
    /// Refresh tokens presented to `refresh`, in order.
    refresh_tokens: Mutex<Vec<String>>,

    exchange_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    create_calls: AtomicUsize,
    renew_calls: AtomicUsize,
}

impl FakeProvider {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            refresh_delay: Mutex::new(Duration::ZERO),
            exchange_results: Mutex::default(),
            refresh_results: Mutex::default(),
            fetch_results: Mutex::default(),
            create_results: Mutex::default(),
            renew_results: Mutex::default(),
            fetch_tokens: Mutex::default(),
            refresh_tokens: Mutex::default(),
            exchange_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
            renew_calls: AtomicUsize::new(0),
        }
    }

    /// Make every refresh take this long (real time).
    pub fn set_refresh_delay(&self, delay: Duration) {
        *lock(&self.refresh_delay) = delay;
    }

    pub fn push_exchange(&self, result: Result<TokenGrant, ProviderError>) {
        lock(&self.exchange_results).push_back(result);
    }

    pub fn push_refresh(&self, result: Result<TokenGrant, ProviderError>) {
        lock(&self.refresh_results).push_back(result);
    }

    pub fn push_fetch(&self, result: Result<FetchBatch, ProviderError>) {
        lock(&self.fetch_results).push_back(result);
    }

    pub fn push_create(&self, result: Result<SubscriptionGrant, ProviderError>) {
        lock(&self.create_results).push_back(result);
    }

    pub fn push_renew(&self, result: Result<SubscriptionGrant, ProviderError>) {
        lock(&self.renew_results).push_back(result);
    }

    pub fn exchange_calls(&self) -> usize {
        self.exchange_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn renew_calls(&self) -> usize {
        self.renew_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_tokens(&self) -> Vec<String> {
        lock(&self.fetch_tokens).clone()
    }

    pub fn refresh_tokens(&self) -> Vec<String> {
        lock(&self.refresh_tokens).clone()
    }

    /// A grant like the one a successful refresh returns.
    pub fn grant(&self, n: usize) -> TokenGrant {
        TokenGrant {
            access_token: format!("access-{}", n),
            refresh_token: Some(format!("refresh-{}", n)),
            expires_at: self.clock.now() + chrono::Duration::hours(1),
            scopes: vec![],
            provider_user_id: None,
        }
    }
}

#[async_trait]
impl ProviderClient for FakeProvider {
    async fn exchange_code(
        &self,
        _provider: Provider,
        code: &str,
        _redirect_uri: &str,
        _code_verifier: Option<&str>,
    ) -> Result<TokenGrant, ProviderError> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = lock(&self.exchange_results).pop_front() {
            return result;
        }
        Ok(TokenGrant {
            access_token: format!("access-{}", code),
            refresh_token: Some(format!("refresh-{}", code)),
            expires_at: self.clock.now() + chrono::Duration::hours(6),
            scopes: vec!["read".to_string()],
            provider_user_id: Some(format!("puid-{}", code)),
        })
    }

    async fn refresh(
        &self,
        _provider: Provider,
        refresh_token: &str,
    ) -> Result<TokenGrant, ProviderError> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.refresh_tokens).push(refresh_token.to_string());

        let delay = *lock(&self.refresh_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let scripted = lock(&self.refresh_results).pop_front();
        scripted.unwrap_or_else(|| Ok(self.grant(n)))
    }

    async fn fetch(
        &self,
        _provider: Provider,
        access_token: &str,
        _since: DateTime<Utc>,
    ) -> Result<FetchBatch, ProviderError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.fetch_tokens).push(access_token.to_string());

        let scripted = lock(&self.fetch_results).pop_front();
        scripted.unwrap_or_else(|| {
            Ok(FetchBatch {
                records: vec![serde_json::json!({ "id": format!("rec-{}", access_token) })],
            })
        })
    }

    async fn create_subscription(
        &self,
        provider: Provider,
        _callback_url: &str,
        _verify_token: &str,
        _access_token: Option<&str>,
    ) -> Result<SubscriptionGrant, ProviderError> {
        let n = self.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let scripted = lock(&self.create_results).pop_front();
        scripted.unwrap_or_else(|| {
            Ok(SubscriptionGrant {
                subscription_id: format!("{}-sub-{}", provider, n),
                expires_at: None,
            })
        })
    }

    async fn renew_subscription(
        &self,
        _provider: Provider,
        subscription_id: &str,
    ) -> Result<SubscriptionGrant, ProviderError> {
        self.renew_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = lock(&self.renew_results).pop_front();
        scripted.unwrap_or_else(|| {
            Ok(SubscriptionGrant {
                subscription_id: subscription_id.to_string(),
                expires_at: None,
            })
        })
    }
}

/// A fully wired [`AppState`] over [`MemoryDb`], the mock KMS, the memory
/// rate-limit backend, a [`FakeProvider`] and a [`ManualClock`].
pub struct TestHarness {
    pub state: Arc<AppState>,
    pub db: Arc<MemoryDb>,
    pub provider: Arc<FakeProvider>,
    pub clock: Arc<ManualClock>,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(Config::test_default())
    }

    pub fn with_config(config: Config) -> Self {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let db = Arc::new(MemoryDb::new());
        let provider = Arc::new(FakeProvider::new(clock.clone()));

        let state = AppState::build(
            config,
            db.clone(),
            KmsService::new_mock(),
            provider.clone(),
            Arc::new(MemoryBackend::new()),
            clock.clone(),
        );

        Self {
            state,
            db,
            provider,
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn database(&self) -> Arc<dyn Database> {
        self.db.clone()
    }

    /// Store a credential expiring `expires_in` from now and a `connected`
    /// integration for the pair.
    pub async fn connect(
        &self,
        user_id: &str,
        provider: Provider,
        expires_in: chrono::Duration,
    ) -> Credential {
        let key = CredentialKey::new(user_id, provider);
        let credential = Credential {
            user_id: user_id.to_string(),
            provider,
            access_token: format!("access-{}-{}", provider, user_id),
            refresh_token: format!("refresh-{}-{}", provider, user_id),
            expires_at: self.now() + expires_in,
            scopes: vec![],
            provider_user_id: Some(format!("puid-{}", user_id)),
        };

        self.state
            .tokens
            .put(&credential)
            .await
            .unwrap_or_else(|e| panic!("failed to store test credential: {e}"));

        let record = IntegrationRecord::connected(&key, credential.provider_user_id.clone(), self.now());
        self.db
            .put_integration(&record)
            .await
            .unwrap_or_else(|e| panic!("failed to store test integration: {e}"));

        credential
    }

    pub fn router(&self) -> axum::Router {
        crate::routes::create_router(self.state.clone())
    }
}
