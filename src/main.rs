// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Cloudbrain-Sync API Server
//!
//! Coordinates OAuth tokens, provider rate limits, webhook subscriptions
//! and data syncs for Strava, Fitbit and Oura.

use cloudbrain_sync::{
    config::Config,
    db::FirestoreDb,
    models::{SubscriptionCardinality, SubscriptionOwner},
    services::{HttpProviderClient, KmsService, MemoryBackend, RateLimitBackend, RedisBackend},
    time_utils::{Clock, SystemClock},
    AppState,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured JSON logging for GCP
    init_logging();

    // Load configuration from environment
    let config = Config::from_env().expect("Failed to load configuration");
    tracing::info!(
        port = config.port,
        providers = ?config.enabled_providers().collect::<Vec<_>>(),
        "Starting Cloudbrain-Sync API"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Initialize Firestore database
    let db = FirestoreDb::new(&config.gcp_project_id)
        .await
        .expect("Failed to connect to Firestore");

    // Initialize KMS service
    let kms = KmsService::new(
        &config.gcp_project_id,
        &config.gcp_region,
        "token-encryption",
    )
    .await
    .expect("Failed to initialize KMS service");
    tracing::info!("KMS service initialized");

    // Rate-limit counters: Redis when configured so all instances share
    // one quota, otherwise per-process.
    let rate_limit_backend: Arc<dyn RateLimitBackend> = match &config.redis_url {
        Some(url) => Arc::new(
            RedisBackend::new(url)
                .await
                .expect("Failed to connect to Redis"),
        ),
        None => {
            tracing::warn!("REDIS_URL not set, rate limits are per-instance");
            Arc::new(MemoryBackend::new())
        }
    };

    let provider_client = Arc::new(
        HttpProviderClient::new(&config, clock.clone()).expect("Failed to build HTTP client"),
    );

    let state = AppState::build(
        config,
        Arc::new(db),
        kms,
        provider_client,
        rate_limit_backend,
        clock,
    );

    // App-level webhook subscriptions are created once; per-user ones on
    // OAuth connect.
    for provider in state.config.enabled_providers() {
        let per_app = provider
            .capabilities()
            .webhook
            .is_some_and(|w| w.cardinality == SubscriptionCardinality::PerApp);
        if !per_app {
            continue;
        }
        if let Err(e) = state
            .subscriptions
            .ensure_subscription(provider, SubscriptionOwner::App)
            .await
        {
            tracing::error!(provider = %provider, error = %e, "Failed to ensure webhook subscription");
        }
    }

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

    if state.config.scheduler.embedded {
        let scheduler = state.scheduler.clone();
        let interval = state.config.scheduler.tick_interval;
        tokio::spawn(scheduler.run(interval, async move {
            let _ = shutdown_rx.changed().await;
        }));
    } else {
        tracing::info!("Embedded scheduler disabled, expecting POST /tasks/tick");
    }

    // Build router
    let app = cloudbrain_sync::routes::create_router(state.clone());

    // Start server
    let addr = format!("0.0.0.0:{}", state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        })
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM (Cloud Run sends SIGTERM before stopping).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

/// Initialize structured JSON logging (GCP-compliant).
fn init_logging() {
    let format = tracing_subscriber::fmt::layer()
        .json()
        .with_target(false)
        .with_current_span(true)
        .flatten_event(true);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cloudbrain_sync=debug,info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(format)
        .init();
}
