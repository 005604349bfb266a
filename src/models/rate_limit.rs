// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Rate-limit observations and decisions.

use crate::models::Provider;
use chrono::serde::ts_milliseconds;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// Snapshot of a sliding window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitWindow {
    pub provider: Provider,
    /// Limiter key (`app` or a user ID).
    pub key: String,
    /// Oldest request still counted, or now when the window is empty.
    #[serde(with = "ts_milliseconds")]
    pub window_start: DateTime<Utc>,
    pub request_count: u32,
    pub limit: u32,
}

/// Result of asking for one request's worth of quota.
///
/// `Denied` is backpressure, not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Denied { retry_after: Duration },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed)
    }
}
