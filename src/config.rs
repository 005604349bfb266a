// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application configuration loaded from environment variables.
//!
//! Cloud Run injects secrets as environment variables via secret bindings,
//! so everything is read from the environment once at startup.

use crate::models::{Provider, RateLimitStrategy};
use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// OAuth client registration for one provider.
#[derive(Debug, Clone)]
pub struct ProviderCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Token refresh policy.
#[derive(Debug, Clone)]
pub struct RefreshSettings {
    /// Refresh when the access token expires within this margin.
    pub margin: Duration,
    /// Failed refreshes tolerated before the integration goes to `error`.
    pub failure_grace: u32,
}

/// Sync scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick_interval: Duration,
    pub concurrency: usize,
    pub job_timeout: Duration,
    pub max_attempts: u32,
    /// Poll interval for pairs without a live webhook subscription.
    pub poll_interval: Duration,
    /// Safety-net poll interval for pairs covered by a webhook.
    pub reconcile_interval: Duration,
    /// Run the tick loop inside the server process.
    pub embedded: bool,
}

/// Application configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server port
    pub port: u16,
    /// Public base URL of this service (OAuth callbacks, webhook endpoints)
    pub api_url: String,
    /// Frontend URL for post-OAuth redirects and CORS
    pub frontend_url: String,
    pub gcp_project_id: String,
    pub gcp_region: String,
    /// Redis for shared rate-limit counters; memory backend when unset
    pub redis_url: Option<String>,

    // --- Secrets ---
    /// JWT signing key for session tokens (raw bytes)
    pub jwt_signing_key: Vec<u8>,
    /// Unguessable path segment on webhook URLs
    pub webhook_path_secret: String,
    /// Token echoed back during webhook subscription verification
    pub webhook_verify_token: String,
    /// Bearer secret for the external scheduler trigger
    pub tasks_secret: String,

    /// Enabled providers (both client ID and secret set)
    pub providers: BTreeMap<Provider, ProviderCredentials>,
    pub rate_limit_overrides: BTreeMap<Provider, RateLimitStrategy>,

    pub refresh: RefreshSettings,
    pub scheduler: SchedulerSettings,
}

impl Config {
    /// Default config for testing only.
    pub fn test_default() -> Self {
        let providers = Provider::ALL
            .into_iter()
            .map(|p| {
                (
                    p,
                    ProviderCredentials {
                        client_id: format!("test_{p}_client_id"),
                        client_secret: format!("test_{p}_secret"),
                    },
                )
            })
            .collect();

        Self {
            port: 8080,
            api_url: "http://localhost:8080".to_string(),
            frontend_url: "http://localhost:5173".to_string(),
            gcp_project_id: "test-project".to_string(),
            gcp_region: "us-west1".to_string(),
            redis_url: None,
            jwt_signing_key: b"test_jwt_key_32_bytes_minimum!!".to_vec(),
            webhook_path_secret: "test-webhook-path-secret".to_string(),
            webhook_verify_token: "test_verify_token".to_string(),
            tasks_secret: "test_tasks_secret".to_string(),
            providers,
            rate_limit_overrides: BTreeMap::new(),
            refresh: RefreshSettings {
                margin: Duration::from_secs(60),
                failure_grace: 1,
            },
            scheduler: SchedulerSettings {
                tick_interval: Duration::from_secs(300),
                concurrency: 16,
                job_timeout: Duration::from_secs(60),
                max_attempts: 3,
                poll_interval: Duration::from_secs(3600),
                reconcile_interval: Duration::from_secs(86400),
                embedded: false,
            },
        }
    }

    /// Load configuration from environment variables (and `.env` if present).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::Missing(name))
        };

        let mut providers = BTreeMap::new();
        let mut rate_limit_overrides = BTreeMap::new();
        for provider in Provider::ALL {
            let prefix = provider.as_str().to_ascii_uppercase();
            let id = lookup(&format!("{prefix}_CLIENT_ID"));
            let secret = lookup(&format!("{prefix}_CLIENT_SECRET"));
            if let (Some(client_id), Some(client_secret)) = (id, secret) {
                providers.insert(
                    provider,
                    ProviderCredentials {
                        client_id: client_id.trim().to_string(),
                        client_secret: client_secret.trim().to_string(),
                    },
                );
            }

            let name = format!("RATE_LIMIT_{prefix}");
            if let Some(value) = lookup(&name) {
                let strategy = parse_rate_limit(&value).ok_or(ConfigError::Invalid {
                    name,
                    value: value.clone(),
                })?;
                rate_limit_overrides.insert(provider, strategy);
            }
        }

        let port = parse_or(&lookup, "PORT", 8080u16)?;
        let api_url = lookup("API_URL").unwrap_or_else(|| format!("http://localhost:{port}"));

        Ok(Self {
            port,
            api_url: api_url.trim_end_matches('/').to_string(),
            frontend_url: lookup("FRONTEND_URL")
                .unwrap_or_else(|| "http://localhost:5173".to_string()),
            gcp_project_id: lookup("GCP_PROJECT_ID").unwrap_or_else(|| "local-dev".to_string()),
            gcp_region: lookup("GCP_REGION").unwrap_or_else(|| "us-west1".to_string()),
            redis_url: lookup("REDIS_URL").filter(|v| !v.trim().is_empty()),
            jwt_signing_key: required("JWT_SIGNING_KEY")?.into_bytes(),
            webhook_path_secret: required("WEBHOOK_PATH_SECRET")?,
            webhook_verify_token: required("WEBHOOK_VERIFY_TOKEN")?,
            tasks_secret: required("TASKS_SECRET")?,
            providers,
            rate_limit_overrides,
            refresh: RefreshSettings {
                margin: Duration::from_secs(parse_or(&lookup, "TOKEN_REFRESH_MARGIN_SECS", 60)?),
                failure_grace: parse_or(&lookup, "REFRESH_FAILURE_GRACE", 1)?,
            },
            scheduler: SchedulerSettings {
                tick_interval: Duration::from_secs(parse_or(&lookup, "SYNC_INTERVAL_SECS", 300)?),
                concurrency: parse_or(&lookup, "SYNC_CONCURRENCY", 16usize)?.max(1),
                job_timeout: Duration::from_secs(parse_or(&lookup, "SYNC_JOB_TIMEOUT_SECS", 60)?),
                max_attempts: parse_or(&lookup, "SYNC_MAX_ATTEMPTS", 3u32)?.max(1),
                poll_interval: Duration::from_secs(parse_or(
                    &lookup,
                    "SYNC_POLL_INTERVAL_SECS",
                    3600,
                )?),
                reconcile_interval: Duration::from_secs(parse_or(
                    &lookup,
                    "SYNC_RECONCILE_INTERVAL_SECS",
                    86400,
                )?),
                embedded: parse_or(&lookup, "EMBEDDED_SCHEDULER", true)?,
            },
        })
    }

    /// Client registration for a provider, if it is enabled.
    pub fn provider(&self, provider: Provider) -> Option<&ProviderCredentials> {
        self.providers.get(&provider)
    }

    pub fn enabled_providers(&self) -> impl Iterator<Item = Provider> + '_ {
        self.providers.keys().copied()
    }

    /// Rate-limit strategy for a provider: configured override or the default.
    pub fn rate_limit_for(&self, provider: Provider) -> RateLimitStrategy {
        self.rate_limit_overrides
            .get(&provider)
            .copied()
            .unwrap_or(provider.capabilities().rate_limit)
    }

    /// OAuth redirect URI registered with the provider.
    pub fn callback_url(&self, provider: Provider) -> String {
        format!("{}/auth/{}/callback", self.api_url, provider)
    }

    /// Webhook callback URL handed to the provider on subscribe.
    pub fn webhook_url(&self, provider: Provider) -> String {
        format!(
            "{}/webhooks/{}/{}",
            self.api_url, provider, self.webhook_path_secret
        )
    }
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            name: name.to_string(),
            value,
        }),
    }
}

/// Parse `sliding:{limit}/{window_secs}` or `bucket:{capacity}/{refill_secs}`.
pub fn parse_rate_limit(value: &str) -> Option<RateLimitStrategy> {
    let (kind, rest) = value.trim().split_once(':')?;
    let (count, secs) = rest.split_once('/')?;
    let count: u32 = count.trim().parse().ok().filter(|c| *c > 0)?;
    let secs: u64 = secs.trim().parse().ok().filter(|s| *s > 0)?;
    let period = Duration::from_secs(secs);

    match kind.trim() {
        "sliding" => Some(RateLimitStrategy::SlidingWindow {
            limit: count,
            window: period,
        }),
        "bucket" => Some(RateLimitStrategy::TokenBucket {
            capacity: count,
            refill_window: period,
        }),
        _ => None,
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {value:?}")]
    Invalid { name: String, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("JWT_SIGNING_KEY", "test_jwt_key_32_bytes_minimum!!"),
            ("WEBHOOK_PATH_SECRET", "path-secret"),
            ("WEBHOOK_VERIFY_TOKEN", "verify"),
            ("TASKS_SECRET", "tasks"),
            ("STRAVA_CLIENT_ID", "12345"),
            ("STRAVA_CLIENT_SECRET", " strava-secret \n"),
        ])
    }

    fn load(env: &HashMap<&'static str, &'static str>) -> Result<Config, ConfigError> {
        Config::from_lookup(|name| env.get(name).map(|v| v.to_string()))
    }

    #[test]
    fn test_config_from_env() {
        let config = load(&base_env()).expect("Config should load");

        assert_eq!(config.port, 8080);
        assert_eq!(config.refresh.margin, Duration::from_secs(60));
        assert_eq!(config.refresh.failure_grace, 1);
        assert!(config.scheduler.embedded);
        assert_eq!(
            config.provider(Provider::Strava).unwrap().client_secret,
            "strava-secret"
        );
        assert!(config.provider(Provider::Fitbit).is_none());
        assert_eq!(
            config.webhook_url(Provider::Strava),
            "http://localhost:8080/webhooks/strava/path-secret"
        );
    }

    #[test]
    fn test_missing_secret() {
        let mut env = base_env();
        env.remove("TASKS_SECRET");
        assert!(matches!(load(&env), Err(ConfigError::Missing("TASKS_SECRET"))));
    }

    #[test]
    fn test_invalid_number() {
        let mut env = base_env();
        env.insert("SYNC_CONCURRENCY", "lots");
        assert!(matches!(load(&env), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_rate_limit_override() {
        let mut env = base_env();
        env.insert("RATE_LIMIT_OURA", "sliding:10/60");
        let config = load(&env).unwrap();

        assert_eq!(
            config.rate_limit_for(Provider::Oura),
            RateLimitStrategy::SlidingWindow {
                limit: 10,
                window: Duration::from_secs(60)
            }
        );
        assert_eq!(
            config.rate_limit_for(Provider::Fitbit),
            Provider::Fitbit.capabilities().rate_limit
        );
    }

    #[test]
    fn test_parse_rate_limit() {
        assert_eq!(
            parse_rate_limit("bucket:150/3600"),
            Some(RateLimitStrategy::TokenBucket {
                capacity: 150,
                refill_window: Duration::from_secs(3600)
            })
        );
        assert_eq!(parse_rate_limit("sliding:0/60"), None);
        assert_eq!(parse_rate_limit("leaky:5/60"), None);
        assert_eq!(parse_rate_limit("sliding:5"), None);
    }
}
