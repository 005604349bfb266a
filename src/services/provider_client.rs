// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! HTTP client for the provider APIs.
//!
//! Handles:
//! - Authorization code exchange and token refresh
//! - Incremental data listing
//! - Webhook subscription create/renew
//! - Rate limit and token error detection
//!
//! Every endpoint and request shape comes from the provider's
//! [`Capabilities`](crate::models::Capabilities).

use crate::config::{Config, ProviderCredentials};
use crate::models::{
    FetchBatch, Provider, SinceParam, SubscriptionAuth, SubscriptionGrant, TokenAuth, TokenGrant,
};
use crate::time_utils::Clock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Classified provider failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    /// 401 from a data endpoint.
    #[error("access token rejected")]
    Unauthorized,

    /// The token endpoint refused the grant (revoked or already rotated).
    #[error("invalid_grant: {0}")]
    InvalidGrant(String),

    #[error("not found")]
    NotFound,

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request failed: {0}")]
    Transport(String),

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("provider {0} is not configured")]
    NotConfigured(Provider),
}

impl ProviderError {
    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::RateLimited { .. } | ProviderError::Transport(_) => true,
            ProviderError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Operations against a provider's API.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn exchange_code(
        &self,
        provider: Provider,
        code: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenGrant, ProviderError>;

    async fn refresh(
        &self,
        provider: Provider,
        refresh_token: &str,
    ) -> Result<TokenGrant, ProviderError>;

    /// Records created or updated since `since`.
    async fn fetch(
        &self,
        provider: Provider,
        access_token: &str,
        since: DateTime<Utc>,
    ) -> Result<FetchBatch, ProviderError>;

    /// Create a push subscription. `access_token` is required for per-user
    /// subscriptions.
    async fn create_subscription(
        &self,
        provider: Provider,
        callback_url: &str,
        verify_token: &str,
        access_token: Option<&str>,
    ) -> Result<SubscriptionGrant, ProviderError>;

    async fn renew_subscription(
        &self,
        provider: Provider,
        subscription_id: &str,
    ) -> Result<SubscriptionGrant, ProviderError>;
}

/// `reqwest` implementation driven by the capability table.
#[derive(Clone)]
pub struct HttpProviderClient {
    http: reqwest::Client,
    credentials: BTreeMap<Provider, ProviderCredentials>,
    clock: Arc<dyn Clock>,
}

impl HttpProviderClient {
    pub fn new(config: &Config, clock: Arc<dyn Clock>) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            credentials: config.providers.clone(),
            clock,
        })
    }

    fn credentials(&self, provider: Provider) -> Result<&ProviderCredentials, ProviderError> {
        self.credentials
            .get(&provider)
            .ok_or(ProviderError::NotConfigured(provider))
    }

    /// POST to the token endpoint with the provider's client authentication.
    async fn token_request(
        &self,
        provider: Provider,
        mut form: Vec<(&str, &str)>,
    ) -> Result<TokenGrant, ProviderError> {
        let caps = provider.capabilities();
        let creds = self.credentials(provider)?;

        let request = self.http.post(caps.token_url);
        let request = match caps.token_auth {
            TokenAuth::FormBody => {
                form.push(("client_id", creds.client_id.as_str()));
                form.push(("client_secret", creds.client_secret.as_str()));
                request
            }
            TokenAuth::BasicHeader => {
                request.basic_auth(&creds.client_id, Some(&creds.client_secret))
            }
        };

        let response = request
            .form(&form)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let body: serde_json::Value = check_response_json(response, true).await?;
        parse_token_response(&body, self.clock.now())
    }

    /// Look up the provider user ID from the profile endpoint.
    async fn fetch_identity(
        &self,
        provider: Provider,
        access_token: &str,
    ) -> Result<Option<String>, ProviderError> {
        let Some(path) = provider.capabilities().identity_path else {
            return Ok(None);
        };

        let url = format!("{}{}", provider.capabilities().api_base, path);
        let response = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let body: serde_json::Value = check_response_json(response, false).await?;
        Ok(id_string(body.get("id")))
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn exchange_code(
        &self,
        provider: Provider,
        code: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenGrant, ProviderError> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
        ];
        if let Some(verifier) = code_verifier {
            form.push(("code_verifier", verifier));
        }

        let mut grant = self.token_request(provider, form).await?;
        if grant.provider_user_id.is_none() {
            grant.provider_user_id = self.fetch_identity(provider, &grant.access_token).await?;
        }
        Ok(grant)
    }

    async fn refresh(
        &self,
        provider: Provider,
        refresh_token: &str,
    ) -> Result<TokenGrant, ProviderError> {
        self.token_request(
            provider,
            vec![
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ],
        )
        .await
    }

    async fn fetch(
        &self,
        provider: Provider,
        access_token: &str,
        since: DateTime<Utc>,
    ) -> Result<FetchBatch, ProviderError> {
        let caps = provider.capabilities();
        let url = format!("{}{}", caps.api_base, caps.data_path);

        let since_pair = match caps.since_param {
            SinceParam::UnixSeconds(name) => (name, since.timestamp().to_string()),
            SinceParam::Date(name) => (name, since.format("%Y-%m-%d").to_string()),
        };

        let response = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .query(caps.fixed_query)
            .query(&[since_pair])
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let body: serde_json::Value = check_response_json(response, false).await?;
        extract_records(&body, caps.records_field)
    }

    async fn create_subscription(
        &self,
        provider: Provider,
        callback_url: &str,
        verify_token: &str,
        access_token: Option<&str>,
    ) -> Result<SubscriptionGrant, ProviderError> {
        let caps = provider.capabilities();
        let creds = self.credentials(provider)?;
        let url = format!("{}{}", caps.api_base, caps.subscription_path);

        let request = match caps.subscription_auth {
            SubscriptionAuth::ClientForm => self.http.post(&url).form(&[
                ("client_id", creds.client_id.as_str()),
                ("client_secret", creds.client_secret.as_str()),
                ("callback_url", callback_url),
                ("verify_token", verify_token),
            ]),
            SubscriptionAuth::ClientHeaders => self
                .http
                .post(&url)
                .header("x-client-id", &creds.client_id)
                .header("x-client-secret", &creds.client_secret)
                .json(&serde_json::json!({
                    "callback_url": callback_url,
                    "verification_token": verify_token,
                    "event_type": "create",
                    "data_type": "daily_activity",
                })),
            SubscriptionAuth::UserBearer => {
                let token = access_token.ok_or_else(|| {
                    ProviderError::Decode("per-user subscription needs an access token".into())
                })?;
                let subscription_id = uuid::Uuid::new_v4().simple().to_string();
                let response = self
                    .http
                    .post(format!("{url}/{subscription_id}.json"))
                    .bearer_auth(token)
                    .header(reqwest::header::CONTENT_LENGTH, 0)
                    .send()
                    .await
                    .map_err(|e| ProviderError::Transport(e.to_string()))?;
                check_response(response, false).await?;
                return Ok(SubscriptionGrant {
                    subscription_id,
                    expires_at: None,
                });
            }
        };

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        let body: SubscriptionResponse = check_response_json(response, false).await?;
        body.into_grant()
    }

    async fn renew_subscription(
        &self,
        provider: Provider,
        subscription_id: &str,
    ) -> Result<SubscriptionGrant, ProviderError> {
        let caps = provider.capabilities();
        let lifetime = caps.webhook.and_then(|w| w.lifetime);

        // Subscriptions without a lifetime never need renewing.
        if lifetime.is_none() || caps.subscription_auth != SubscriptionAuth::ClientHeaders {
            return Ok(SubscriptionGrant {
                subscription_id: subscription_id.to_string(),
                expires_at: None,
            });
        }

        let creds = self.credentials(provider)?;
        let url = format!(
            "{}{}/renew/{}",
            caps.api_base, caps.subscription_path, subscription_id
        );

        let response = self
            .http
            .put(&url)
            .header("x-client-id", &creds.client_id)
            .header("x-client-secret", &creds.client_secret)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let body: SubscriptionResponse = check_response_json(response, false).await?;
        body.into_grant()
    }
}

// ─── Response handling ───────────────────────────────────────────────────────

/// Check response status and classify failures.
///
/// `token_endpoint` distinguishes a refused grant (400/401 from the token
/// endpoint) from a rejected access token (401 from a data endpoint).
async fn check_response(
    response: reqwest::Response,
    token_endpoint: bool,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();

    Err(classify_failure(status.as_u16(), retry_after, body, token_endpoint))
}

async fn check_response_json<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
    token_endpoint: bool,
) -> Result<T, ProviderError> {
    check_response(response, token_endpoint)
        .await?
        .json()
        .await
        .map_err(|e| ProviderError::Decode(format!("JSON parse error: {}", e)))
}

pub(crate) fn classify_failure(
    status: u16,
    retry_after: Option<Duration>,
    body: String,
    token_endpoint: bool,
) -> ProviderError {
    match status {
        429 => {
            tracing::warn!(?retry_after, "Provider rate limit hit (429)");
            ProviderError::RateLimited { retry_after }
        }
        400 | 401 if token_endpoint => ProviderError::InvalidGrant(body),
        401 => ProviderError::Unauthorized,
        404 => ProviderError::NotFound,
        _ => ProviderError::Status { status, body },
    }
}

/// Raw token endpoint response; fields vary by provider.
#[derive(Debug, Deserialize)]
struct RawTokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    /// Absolute expiry (Strava)
    expires_at: Option<i64>,
    /// Relative expiry in seconds (Fitbit, Oura)
    expires_in: Option<i64>,
    /// Space- or comma-separated
    scope: Option<String>,
    /// Fitbit
    user_id: Option<serde_json::Value>,
    /// Strava
    athlete: Option<RawAthlete>,
}

#[derive(Debug, Deserialize)]
struct RawAthlete {
    id: serde_json::Value,
}

/// Normalize a token endpoint response.
pub(crate) fn parse_token_response(
    body: &serde_json::Value,
    now: DateTime<Utc>,
) -> Result<TokenGrant, ProviderError> {
    let raw: RawTokenResponse = serde_json::from_value(body.clone())
        .map_err(|e| ProviderError::Decode(format!("token response: {}", e)))?;

    let expires_at = match (raw.expires_at, raw.expires_in) {
        (Some(at), _) => DateTime::from_timestamp(at, 0),
        (None, Some(secs)) => Some(now + chrono::Duration::seconds(secs)),
        (None, None) => None,
    }
    .ok_or_else(|| ProviderError::Decode("token response has no expiry".to_string()))?;

    let scopes = raw
        .scope
        .map(|s| {
            s.split([' ', ','])
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let provider_user_id = id_string(raw.user_id.as_ref())
        .or_else(|| raw.athlete.and_then(|a| id_string(Some(&a.id))));

    Ok(TokenGrant {
        access_token: raw.access_token,
        refresh_token: raw.refresh_token.filter(|t| !t.is_empty()),
        expires_at,
        scopes,
        provider_user_id,
    })
}

fn id_string(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Pull the record array out of a listing response.
pub(crate) fn extract_records(
    body: &serde_json::Value,
    field: Option<&str>,
) -> Result<FetchBatch, ProviderError> {
    let array = match field {
        Some(name) => body.get(name),
        None => Some(body),
    }
    .and_then(|v| v.as_array())
    .ok_or_else(|| ProviderError::Decode("listing is not an array".to_string()))?;

    Ok(FetchBatch {
        records: array.clone(),
    })
}

#[derive(Debug, Deserialize)]
struct SubscriptionResponse {
    id: serde_json::Value,
    expiration_time: Option<String>,
}

impl SubscriptionResponse {
    fn into_grant(self) -> Result<SubscriptionGrant, ProviderError> {
        let subscription_id = id_string(Some(&self.id))
            .ok_or_else(|| ProviderError::Decode("subscription id".to_string()))?;
        let expires_at = self
            .expiration_time
            .map(|t| {
                DateTime::parse_from_rfc3339(&t)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| ProviderError::Decode(format!("expiration_time: {}", e)))
            })
            .transpose()?;

        Ok(SubscriptionGrant {
            subscription_id,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn strava_token_response() {
        let now = Utc::now();
        let grant = parse_token_response(
            &json!({
                "token_type": "Bearer",
                "access_token": "a1",
                "refresh_token": "r1",
                "expires_at": 1_800_000_000,
                "expires_in": 21600,
                "athlete": {"id": 134815, "firstname": "Ada"}
            }),
            now,
        )
        .unwrap();

        assert_eq!(grant.access_token, "a1");
        assert_eq!(grant.refresh_token.as_deref(), Some("r1"));
        assert_eq!(
            grant.expires_at,
            Utc.timestamp_opt(1_800_000_000, 0).unwrap()
        );
        assert_eq!(grant.provider_user_id.as_deref(), Some("134815"));
    }

    #[test]
    fn fitbit_token_response() {
        let now = Utc::now();
        let grant = parse_token_response(
            &json!({
                "access_token": "a2",
                "refresh_token": "r2",
                "expires_in": 28800,
                "scope": "activity heartrate sleep",
                "user_id": "ABC123"
            }),
            now,
        )
        .unwrap();

        assert_eq!(grant.expires_at, now + chrono::Duration::seconds(28800));
        assert_eq!(grant.scopes, vec!["activity", "heartrate", "sleep"]);
        assert_eq!(grant.provider_user_id.as_deref(), Some("ABC123"));
    }

    #[test]
    fn token_response_without_expiry_is_rejected() {
        let result = parse_token_response(&json!({"access_token": "a"}), Utc::now());
        assert!(matches!(result, Err(ProviderError::Decode(_))));
    }

    #[test]
    fn classify_token_and_data_failures() {
        assert!(matches!(
            classify_failure(400, None, "invalid_grant".into(), true),
            ProviderError::InvalidGrant(_)
        ));
        assert_eq!(
            classify_failure(401, None, String::new(), false),
            ProviderError::Unauthorized
        );
        assert_eq!(
            classify_failure(429, Some(Duration::from_secs(30)), String::new(), false),
            ProviderError::RateLimited {
                retry_after: Some(Duration::from_secs(30))
            }
        );
        assert!(classify_failure(503, None, String::new(), false).is_transient());
        assert!(!classify_failure(400, None, String::new(), false).is_transient());
    }

    #[test]
    fn records_from_field_or_root() {
        let oura = extract_records(&json!({"data": [{"day": "2026-01-01"}]}), Some("data")).unwrap();
        assert_eq!(oura.len(), 1);

        let strava = extract_records(&json!([{"id": 1}, {"id": 2}]), None).unwrap();
        assert_eq!(strava.len(), 2);

        assert!(extract_records(&json!({"data": {}}), Some("data")).is_err());
    }
}
