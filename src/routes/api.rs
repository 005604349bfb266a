// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! API routes for authenticated users.

use crate::error::{AppError, RefreshError, Result};
use crate::middleware::auth::AuthUser;
use crate::models::{CredentialKey, IntegrationStatus, JobTrigger};
use crate::routes::enabled_provider;
use crate::time_utils::format_utc_rfc3339;
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Default lookback for on-demand data requests.
const DEFAULT_DATA_LOOKBACK_DAYS: i64 = 7;

/// API routes (require authentication via JWT).
/// The auth middleware is applied in routes/mod.rs for these routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/integrations", get(list_integrations))
        .route("/api/integrations/{provider}", delete(disconnect))
        .route("/api/integrations/{provider}/authorize", post(authorize))
        .route("/api/integrations/{provider}/sync", post(request_sync))
        .route("/api/providers/{provider}/data", get(provider_data))
}

// ─── Integrations ────────────────────────────────────────────

/// One provider tile on the integrations page.
#[derive(Serialize)]
pub struct IntegrationTile {
    pub provider: String,
    pub status: IntegrationStatus,
    /// Only `error` needs the user to reconnect.
    pub requires_action: bool,
    pub last_synced_at: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Serialize)]
pub struct IntegrationsResponse {
    pub integrations: Vec<IntegrationTile>,
}

/// List every enabled provider with the user's connection status.
async fn list_integrations(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<IntegrationsResponse>> {
    let records = state.db.integrations_for_user(&user.user_id).await?;

    let integrations = state
        .config
        .enabled_providers()
        .map(|provider| {
            let record = records.iter().find(|r| r.provider == provider);
            let status = record.map_or(IntegrationStatus::Disconnected, |r| r.status);
            IntegrationTile {
                provider: provider.to_string(),
                status,
                requires_action: status.requires_user_action(),
                last_synced_at: record
                    .and_then(|r| r.last_synced_at)
                    .map(format_utc_rfc3339),
                last_error: record.and_then(|r| r.last_error.clone()),
            }
        })
        .collect();

    Ok(Json(IntegrationsResponse { integrations }))
}

#[derive(Serialize)]
pub struct AuthorizeResponse {
    pub authorization_url: String,
}

/// Start connecting a provider.
async fn authorize(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(provider): Path<String>,
) -> Result<Json<AuthorizeResponse>> {
    let provider = enabled_provider(&state, &provider)?;
    let request = state.oauth.begin(&user.user_id, provider).await?;

    Ok(Json(AuthorizeResponse {
        authorization_url: request.url,
    }))
}

#[derive(Serialize)]
pub struct SyncResponse {
    pub job_id: String,
}

/// Queue a manual sync.
async fn request_sync(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(provider): Path<String>,
) -> Result<(StatusCode, Json<SyncResponse>)> {
    let provider = enabled_provider(&state, &provider)?;
    let key = CredentialKey::new(user.user_id, provider);

    let record = state
        .db
        .get_integration(&key)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("{} is not connected", provider)))?;

    match record.status {
        IntegrationStatus::Error => {
            return Err(AppError::Refresh(RefreshError::ReauthRequired));
        }
        IntegrationStatus::Disconnected => {
            return Err(AppError::NotFound(format!("{} is not connected", provider)));
        }
        IntegrationStatus::Connected | IntegrationStatus::Syncing => {}
    }

    let job = state.scheduler.enqueue(&key, JobTrigger::Manual).await?;
    Ok((StatusCode::ACCEPTED, Json(SyncResponse { job_id: job.id })))
}

#[derive(Serialize)]
pub struct DisconnectResponse {
    pub success: bool,
}

/// Disconnect a provider and delete its stored credential.
async fn disconnect(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(provider): Path<String>,
) -> Result<Json<DisconnectResponse>> {
    let provider = enabled_provider(&state, &provider)?;
    let key = CredentialKey::new(user.user_id, provider);

    tracing::info!(user_id = %key.user_id, provider = %provider, "User-initiated disconnect");
    state.oauth.disconnect(&key).await?;

    Ok(Json(DisconnectResponse { success: true }))
}

// ─── Provider data ───────────────────────────────────────────

#[derive(Deserialize)]
struct DataQuery {
    /// Lower bound, RFC3339 or `YYYY-MM-DD`
    since: Option<String>,
}

#[derive(Serialize)]
pub struct DataResponse {
    pub provider: String,
    pub since: String,
    pub count: usize,
    pub records: Vec<serde_json::Value>,
}

fn parse_since(since: Option<&str>, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let Some(raw) = since else {
        return Ok(now - chrono::Duration::days(DEFAULT_DATA_LOOKBACK_DAYS));
    };

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| {
            AppError::BadRequest(
                "Invalid 'since' parameter: must be RFC3339 datetime or YYYY-MM-DD".to_string(),
            )
        })
}

/// Fresh provider data for the chat agent, fetched through the token and
/// rate-limit coordinators.
async fn provider_data(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(provider): Path<String>,
    Query(params): Query<DataQuery>,
) -> Result<Json<DataResponse>> {
    let provider = enabled_provider(&state, &provider)?;
    let since = parse_since(params.since.as_deref(), state.clock.now())?;

    if since > state.clock.now() {
        return Err(AppError::BadRequest(
            "'since' must not be in the future".to_string(),
        ));
    }

    tracing::debug!(user_id = %user.user_id, provider = %provider, since = %since, "Fetching provider data");

    let batch = state
        .scheduler
        .fetch_fresh(&user.user_id, provider, since)
        .await?;

    Ok(Json(DataResponse {
        provider: provider.to_string(),
        since: format_utc_rfc3339(since),
        count: batch.len(),
        records: batch.records,
    }))
}
