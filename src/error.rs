// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application error types with consistent API responses.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;

/// Application error type that converts to HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Token refresh failed: {0}")]
    Refresh(#[from] RefreshError),

    #[error("Sync failed: {0}")]
    Sync(#[from] SyncError),

    #[error("Rate limited, retry after {0:?}")]
    RateLimited(Duration),

    #[error("Provider API error: {0}")]
    ProviderApi(String),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Why a credential could not be made valid.
///
/// Cloned to every caller waiting on the same in-flight refresh.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    #[error("no credential stored")]
    NoCredential,

    /// The integration is in `error`; the user has to reconnect.
    #[error("re-authorization required")]
    ReauthRequired,

    /// The provider refused the refresh token.
    #[error("refresh rejected: {0}")]
    Rejected(String),

    #[error("transient refresh failure: {0}")]
    Transient(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl RefreshError {
    /// Whether the user must reconnect before this pair can work again.
    pub fn needs_user_action(&self) -> bool {
        matches!(self, RefreshError::NoCredential | RefreshError::ReauthRequired)
    }

    /// Network, 5xx or storage trouble; the next attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RefreshError::Transient(_) | RefreshError::Storage(_))
    }
}

/// Why a sync job attempt did not complete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("provider rejected the access token")]
    Unauthorized,

    #[error("rate limited for {0:?}")]
    RateLimited(Duration),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// JSON error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut retry_after = None;
        let (status, error, details) = match &self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", None),
            AppError::InvalidToken => (StatusCode::UNAUTHORIZED, "invalid_token", None),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", Some(msg.clone())),
            AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, "bad_request", Some(msg.clone()))
            }
            AppError::Storage(msg) => {
                tracing::error!(error = %msg, "Storage error");
                (StatusCode::INTERNAL_SERVER_ERROR, "storage_error", None)
            }
            AppError::Refresh(err) if err.needs_user_action() => {
                (StatusCode::CONFLICT, "reauth_required", Some(err.to_string()))
            }
            AppError::Refresh(err) => {
                (StatusCode::BAD_GATEWAY, "refresh_failed", Some(err.to_string()))
            }
            AppError::Sync(SyncError::RateLimited(after)) | AppError::RateLimited(after) => {
                retry_after = Some(*after);
                (StatusCode::TOO_MANY_REQUESTS, "rate_limited", None)
            }
            AppError::Sync(err) => (StatusCode::BAD_GATEWAY, "sync_failed", Some(err.to_string())),
            AppError::ProviderApi(msg) => {
                (StatusCode::BAD_GATEWAY, "provider_error", Some(msg.clone()))
            }
            AppError::Internal(err) => {
                tracing::error!(error = %err, "Internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", None)
            }
        };

        let body = ErrorResponse {
            error: error.to_string(),
            details,
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(after) = retry_after {
            // Whole seconds, rounded up.
            let secs = after.as_secs() + u64::from(after.subsec_nanos() > 0);
            if let Ok(value) = HeaderValue::from_str(&secs.max(1).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;
