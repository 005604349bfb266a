// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Supported providers and their capability table.
//!
//! Everything that differs between providers (endpoints, refresh style,
//! rate-limit algorithm, webhook cardinality) is data looked up here.
//! Callers never branch on the provider to pick behavior.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// A third-party fitness provider with server-side OAuth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Strava,
    Fitbit,
    Oura,
}

impl Provider {
    /// All providers, in display order.
    pub const ALL: [Provider; 3] = [Provider::Strava, Provider::Fitbit, Provider::Oura];

    /// Stable lowercase identifier used in URLs, keys and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Strava => "strava",
            Provider::Fitbit => "fitbit",
            Provider::Oura => "oura",
        }
    }

    /// Capability entry for this provider.
    pub fn capabilities(self) -> &'static Capabilities {
        match self {
            Provider::Strava => &STRAVA,
            Provider::Fitbit => &FITBIT,
            Provider::Oura => &OURA,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown provider: {0}")]
pub struct UnknownProvider(pub String);

impl FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strava" => Ok(Provider::Strava),
            "fitbit" => Ok(Provider::Fitbit),
            "oura" => Ok(Provider::Oura),
            other => Err(UnknownProvider(other.to_string())),
        }
    }
}

/// How the client authenticates against the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenAuth {
    /// `client_id` / `client_secret` in the form body.
    FormBody,
    /// HTTP Basic with `client_id:client_secret`.
    BasicHeader,
}

/// Rate-limit algorithm a provider binds to at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitStrategy {
    /// At most `limit` requests in any rolling `window`.
    SlidingWindow { limit: u32, window: Duration },
    /// `capacity` tokens, refilled continuously at `capacity` per `refill_window`.
    TokenBucket {
        capacity: u32,
        refill_window: Duration,
    },
}

/// Whose quota a provider's rate limit counts against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitScope {
    /// One shared quota for the whole application.
    App,
    /// One quota per connected user.
    User,
}

/// Whether a provider's push subscriptions are owned by the app or by each user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionCardinality {
    PerApp,
    PerUser,
}

/// How the provider proves a webhook endpoint during subscription setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationStyle {
    /// `hub.mode`, `hub.verify_token`, `hub.challenge`; echo `{"hub.challenge": ..}`.
    HubChallenge,
    /// `verification_token`, `challenge`; echo `{"challenge": ..}`.
    ChallengeEcho,
    /// `verify` code; 204 when it matches, 404 otherwise.
    VerifyCode,
}

/// How webhook deliveries are authenticated beyond the secret path segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    /// Only the unguessable path segment.
    PathSecret,
    /// Hex HMAC-SHA256 keyed with the client secret over `timestamp || body`.
    HmacSha256 {
        signature_header: &'static str,
        timestamp_header: &'static str,
    },
}

/// Webhook subscription policy for a provider.
#[derive(Debug, Clone, Copy)]
pub struct WebhookPolicy {
    pub cardinality: SubscriptionCardinality,
    /// `None` when subscriptions never expire.
    pub lifetime: Option<Duration>,
    /// Renew once the remaining lifetime is at or below this.
    pub renew_within: Duration,
    pub verification: VerificationStyle,
    pub signature: SignatureScheme,
    /// Status code returned for accepted deliveries.
    pub ack_status: u16,
    /// Event field carrying the provider user ID.
    pub owner_field: &'static str,
}

/// How the incremental data listing expresses its lower bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinceParam {
    /// Unix seconds in the named query parameter.
    UnixSeconds(&'static str),
    /// `YYYY-MM-DD` in the named query parameter.
    Date(&'static str),
}

/// How subscription create/renew calls are authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionAuth {
    /// `client_id` / `client_secret` form fields (app-level).
    ClientForm,
    /// `x-client-id` / `x-client-secret` headers (app-level).
    ClientHeaders,
    /// The subscribing user's bearer token.
    UserBearer,
}

/// Static per-provider data.
#[derive(Debug)]
pub struct Capabilities {
    pub authorize_url: &'static str,
    pub token_url: &'static str,
    pub api_base: &'static str,
    pub token_auth: TokenAuth,
    pub uses_pkce: bool,
    pub default_scopes: &'static [&'static str],
    /// Separator used when sending scopes in the authorize URL.
    pub scope_separator: &'static str,
    pub rate_limit: RateLimitStrategy,
    pub rate_limit_scope: RateLimitScope,
    pub webhook: Option<WebhookPolicy>,
    /// Path (relative to `api_base`) of the incremental data listing.
    pub data_path: &'static str,
    pub since_param: SinceParam,
    /// Extra query pairs always sent with the data listing.
    pub fixed_query: &'static [(&'static str, &'static str)],
    /// JSON field holding the record array; `None` when the body is the array.
    pub records_field: Option<&'static str>,
    /// Path of the subscription endpoint (create/renew), relative to `api_base`.
    pub subscription_path: &'static str,
    pub subscription_auth: SubscriptionAuth,
    /// Profile endpoint whose `id` is the provider user ID, for providers
    /// whose token response does not carry it.
    pub identity_path: Option<&'static str>,
}

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

static STRAVA: Capabilities = Capabilities {
    authorize_url: "https://www.strava.com/oauth/authorize",
    token_url: "https://www.strava.com/oauth/token",
    api_base: "https://www.strava.com/api/v3",
    token_auth: TokenAuth::FormBody,
    uses_pkce: false,
    default_scopes: &["read", "activity:read_all"],
    scope_separator: ",",
    rate_limit: RateLimitStrategy::SlidingWindow {
        limit: 100,
        window: Duration::from_secs(15 * MINUTE),
    },
    rate_limit_scope: RateLimitScope::App,
    webhook: Some(WebhookPolicy {
        cardinality: SubscriptionCardinality::PerApp,
        lifetime: None,
        renew_within: Duration::ZERO,
        verification: VerificationStyle::HubChallenge,
        signature: SignatureScheme::PathSecret,
        ack_status: 200,
        owner_field: "owner_id",
    }),
    data_path: "/athlete/activities",
    since_param: SinceParam::UnixSeconds("after"),
    fixed_query: &[("per_page", "100")],
    records_field: None,
    subscription_path: "/push_subscriptions",
    subscription_auth: SubscriptionAuth::ClientForm,
    identity_path: None,
};

static FITBIT: Capabilities = Capabilities {
    authorize_url: "https://www.fitbit.com/oauth2/authorize",
    token_url: "https://api.fitbit.com/oauth2/token",
    api_base: "https://api.fitbit.com",
    token_auth: TokenAuth::BasicHeader,
    uses_pkce: true,
    default_scopes: &["activity", "heartrate", "sleep", "profile"],
    scope_separator: " ",
    rate_limit: RateLimitStrategy::TokenBucket {
        capacity: 150,
        refill_window: Duration::from_secs(HOUR),
    },
    rate_limit_scope: RateLimitScope::User,
    webhook: Some(WebhookPolicy {
        cardinality: SubscriptionCardinality::PerUser,
        lifetime: None,
        renew_within: Duration::ZERO,
        verification: VerificationStyle::VerifyCode,
        signature: SignatureScheme::PathSecret,
        ack_status: 204,
        owner_field: "ownerId",
    }),
    data_path: "/1/user/-/activities/list.json",
    since_param: SinceParam::Date("afterDate"),
    fixed_query: &[("sort", "asc"), ("offset", "0"), ("limit", "100")],
    records_field: Some("activities"),
    subscription_path: "/1/user/-/apiSubscriptions",
    subscription_auth: SubscriptionAuth::UserBearer,
    identity_path: None,
};

static OURA: Capabilities = Capabilities {
    authorize_url: "https://cloud.ouraring.com/oauth/authorize",
    token_url: "https://api.ouraring.com/oauth/token",
    api_base: "https://api.ouraring.com",
    token_auth: TokenAuth::FormBody,
    uses_pkce: false,
    default_scopes: &["daily", "heartrate", "workout", "session"],
    scope_separator: " ",
    rate_limit: RateLimitStrategy::SlidingWindow {
        limit: 5000,
        window: Duration::from_secs(HOUR),
    },
    rate_limit_scope: RateLimitScope::User,
    webhook: Some(WebhookPolicy {
        cardinality: SubscriptionCardinality::PerApp,
        lifetime: Some(Duration::from_secs(90 * DAY)),
        renew_within: Duration::from_secs(7 * DAY),
        verification: VerificationStyle::ChallengeEcho,
        signature: SignatureScheme::HmacSha256 {
            signature_header: "x-oura-signature",
            timestamp_header: "x-oura-timestamp",
        },
        ack_status: 200,
        owner_field: "user_id",
    }),
    data_path: "/v2/usercollection/daily_activity",
    since_param: SinceParam::Date("start_date"),
    fixed_query: &[],
    records_field: Some("data"),
    subscription_path: "/v2/webhook/subscription",
    subscription_auth: SubscriptionAuth::ClientHeaders,
    identity_path: Some("/v2/usercollection/personal_info"),
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_round_trips_through_str() {
        for provider in Provider::ALL {
            assert_eq!(provider.as_str().parse::<Provider>().unwrap(), provider);
        }
        assert!("garmin".parse::<Provider>().is_err());
        assert_eq!("OURA".parse::<Provider>().unwrap(), Provider::Oura);
    }

    #[test]
    fn webhook_cardinality_is_provider_specific() {
        let oura = Provider::Oura.capabilities().webhook.unwrap();
        let fitbit = Provider::Fitbit.capabilities().webhook.unwrap();
        assert_eq!(oura.cardinality, SubscriptionCardinality::PerApp);
        assert_eq!(fitbit.cardinality, SubscriptionCardinality::PerUser);
        assert_eq!(oura.lifetime, Some(Duration::from_secs(90 * DAY)));
        assert_eq!(oura.renew_within, Duration::from_secs(7 * DAY));
    }

    #[test]
    fn rate_limit_bindings() {
        assert!(matches!(
            Provider::Fitbit.capabilities().rate_limit,
            RateLimitStrategy::TokenBucket { capacity: 150, .. }
        ));
        assert!(matches!(
            Provider::Oura.capabilities().rate_limit,
            RateLimitStrategy::SlidingWindow { limit: 5000, .. }
        ));
        assert_eq!(
            Provider::Strava.capabilities().rate_limit_scope,
            RateLimitScope::App
        );
    }
}
