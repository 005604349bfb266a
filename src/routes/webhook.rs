// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Webhook routes for provider push events.
//!
//! Every provider delivers to `/webhooks/{provider}/{path_secret}`. Events
//! only enqueue sync jobs; the data itself is always fetched through the
//! scheduler.

use crate::error::AppError;
use crate::middleware::tasks_auth::secrets_match;
use crate::models::{JobTrigger, Provider, SignatureScheme, VerificationStyle, WebhookPolicy};
use crate::time_utils::Clock;
use crate::AppState;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

/// Signed events older or newer than this are replays or clock trouble.
const SIGNATURE_TOLERANCE: chrono::Duration = chrono::Duration::minutes(5);

/// Webhook routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route(
        "/webhooks/{provider}/{secret}",
        get(verify).post(handle_event),
    )
}

/// Resolve provider and check the path secret. `None` answers 404 so the
/// endpoint does not reveal which providers exist.
fn authorize_path(
    state: &AppState,
    provider_name: &str,
    secret: &str,
) -> Option<(Provider, WebhookPolicy)> {
    let provider: Provider = provider_name.parse().ok()?;
    state.config.provider(provider)?;
    let policy = provider.capabilities().webhook?;

    if !secrets_match(secret, &state.config.webhook_path_secret) {
        tracing::warn!(provider = %provider, "Security Alert: Webhook path secret mismatch");
        return None;
    }
    Some((provider, policy))
}

/// Subscription verification (GET).
async fn verify(
    State(state): State<Arc<AppState>>,
    Path((provider_name, secret)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some((provider, policy)) = authorize_path(&state, &provider_name, &secret) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let expected = state.config.webhook_verify_token.as_str();
    let param = |name: &str| params.get(name).map(String::as_str);

    let response = match policy.verification {
        VerificationStyle::HubChallenge => {
            match (param("hub.mode"), param("hub.verify_token"), param("hub.challenge")) {
                (Some("subscribe"), Some(token), Some(challenge))
                    if secrets_match(token, expected) =>
                {
                    Json(json!({ "hub.challenge": challenge })).into_response()
                }
                _ => StatusCode::FORBIDDEN.into_response(),
            }
        }
        VerificationStyle::ChallengeEcho => {
            match (param("verification_token"), param("challenge")) {
                (Some(token), Some(challenge)) if secrets_match(token, expected) => {
                    Json(json!({ "challenge": challenge })).into_response()
                }
                _ => StatusCode::FORBIDDEN.into_response(),
            }
        }
        VerificationStyle::VerifyCode => match param("verify") {
            Some(code) if secrets_match(code, expected) => StatusCode::NO_CONTENT.into_response(),
            _ => StatusCode::NOT_FOUND.into_response(),
        },
    };

    if response.status().is_success() {
        tracing::info!(provider = %provider, "Webhook subscription verified");
    } else {
        tracing::warn!(provider = %provider, "Webhook verification failed");
    }
    response
}

/// Receive webhook events (POST).
async fn handle_event(
    State(state): State<Arc<AppState>>,
    Path((provider_name, secret)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let Some((provider, policy)) = authorize_path(&state, &provider_name, &secret) else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };

    if let SignatureScheme::HmacSha256 {
        signature_header,
        timestamp_header,
    } = policy.signature
    {
        let client_secret = state
            .config
            .provider(provider)
            .map(|c| c.client_secret.as_str())
            .unwrap_or_default();
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

        let valid = match (header(signature_header), header(timestamp_header)) {
            (Some(signature), Some(timestamp)) => {
                timestamp_is_fresh(timestamp, state.clock.now())
                    && verify_signature(client_secret, timestamp, &body, signature)
            }
            _ => false,
        };
        if !valid {
            tracing::warn!(provider = %provider, "Rejected webhook with invalid signature");
            return Ok(StatusCode::UNAUTHORIZED.into_response());
        }
    }

    let ack = StatusCode::from_u16(policy.ack_status).unwrap_or(StatusCode::OK);

    let event: Value = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(provider = %provider, error = %e, "Ignoring malformed webhook payload");
            return Ok(ack.into_response());
        }
    };

    let owners = event_owners(&event, policy.owner_field);
    if owners.is_empty() {
        tracing::warn!(provider = %provider, "Webhook event without owner, ignoring");
        return Ok(ack.into_response());
    }

    let mut enqueued = 0;
    for owner in owners {
        let integrations = state.db.find_by_provider_user(provider, &owner).await?;
        if integrations.is_empty() {
            tracing::debug!(provider = %provider, provider_user_id = %owner, "Webhook for unknown user");
        }

        for record in integrations.into_iter().filter(|r| r.status.is_active()) {
            state
                .scheduler
                .enqueue(&record.key(), JobTrigger::Webhook)
                .await?;
            enqueued += 1;
        }
    }

    tracing::info!(provider = %provider, enqueued, "Webhook event processed");
    Ok(ack.into_response())
}

/// Hex HMAC-SHA256 of `timestamp || body`, compared in constant time.
fn verify_signature(secret: &str, timestamp: &str, body: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(timestamp.as_bytes());
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Unix-seconds timestamp within `SIGNATURE_TOLERANCE` of now.
fn timestamp_is_fresh(timestamp: &str, now: DateTime<Utc>) -> bool {
    let Some(sent) = timestamp
        .trim()
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
    else {
        return false;
    };
    (now - sent).abs() <= SIGNATURE_TOLERANCE
}

/// Provider user IDs named by an event. Providers deliver either one
/// object or a batch array.
fn event_owners(event: &Value, owner_field: &str) -> Vec<String> {
    let events = match event {
        Value::Array(items) => items.iter().collect::<Vec<_>>(),
        other => vec![other],
    };

    let mut owners: Vec<String> = events
        .into_iter()
        .filter_map(|e| match e.get(owner_field)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .collect();
    owners.sort();
    owners.dedup();
    owners
}
