// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Scheduler trigger routes.
//!
//! Called by an external scheduler (Cloud Scheduler) when the embedded
//! loop is disabled, authenticated with the shared tasks secret.

use crate::error::Result;
use crate::middleware::require_tasks_auth;
use crate::services::TickReport;
use crate::AppState;
use axum::{extract::State, middleware, routing::post, Json, Router};
use std::sync::Arc;

/// Task routes (called by the external scheduler).
pub fn routes(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/tasks/tick", post(tick))
        .route_layer(middleware::from_fn_with_state(state, require_tasks_auth))
}

/// Run one scheduler pass and report what it did.
async fn tick(State(state): State<Arc<AppState>>) -> Result<Json<TickReport>> {
    tracing::info!("Scheduler tick triggered externally");
    let report = state.scheduler.tick().await?;
    Ok(Json(report))
}
