// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! API authentication, CORS and integration endpoint tests.

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use cloudbrain_sync::db::{IntegrationStore, SubscriptionStore};
use cloudbrain_sync::middleware::auth::SESSION_COOKIE;
use cloudbrain_sync::models::{
    CredentialKey, IntegrationStatus, JobTrigger, Provider, SubscriptionOwner,
};
use cloudbrain_sync::services::rate_limit::APP_KEY;
use serde_json::Value;
use tower::ServiceExt;

mod common;

fn tile<'a>(body: &'a Value, provider: &str) -> &'a Value {
    body["integrations"]
        .as_array()
        .unwrap()
        .iter()
        .find(|t| t["provider"] == provider)
        .unwrap_or_else(|| panic!("no tile for {provider}"))
}

#[tokio::test]
async fn test_protected_route_without_token() {
    let h = common::create_test_app();

    let response = h
        .router()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/api/integrations")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_protected_route_with_invalid_token() {
    let h = common::create_test_app();

    let response = h
        .router()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/api/integrations")
                .header(header::AUTHORIZATION, "Bearer invalid.token.here")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_token_signed_with_other_key_rejected() {
    let h = common::create_test_app();
    let token =
        cloudbrain_sync::middleware::auth::create_jwt("u1", b"some_other_key_of_32_bytes_long!")
            .unwrap();

    let response = h
        .router()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/api/integrations")
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_session_cookie_accepted() {
    let h = common::create_test_app();
    let token = common::session_token(&h, "u1");

    let response = h
        .router()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/api/integrations")
                .header(header::COOKIE, format!("{}={}", SESSION_COOKIE, token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_cors_preflight() {
    let h = common::create_test_app();

    let response = h
        .router()
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri("/api/integrations")
                .header(header::ORIGIN, "http://localhost:5173")
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    assert!(response
        .headers()
        .contains_key(header::ACCESS_CONTROL_ALLOW_METHODS));
}

#[tokio::test]
async fn test_health_is_public() {
    let h = common::create_test_app();

    let response = h
        .router()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-content-type-options"], "nosniff");
    let body = common::body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["refreshes_in_flight"], 0);
}

#[tokio::test]
async fn test_integration_tiles() {
    let h = common::create_test_app();
    h.connect("u1", Provider::Oura, chrono::Duration::hours(6))
        .await;
    h.connect("u1", Provider::Fitbit, chrono::Duration::hours(6))
        .await;

    let mut broken = h
        .db
        .get_integration(&CredentialKey::new("u1", Provider::Fitbit))
        .await
        .unwrap()
        .unwrap();
    broken.status = IntegrationStatus::Error;
    broken.last_error = Some("invalid_grant: revoked".to_string());
    h.db.put_integration(&broken).await.unwrap();

    let response = h
        .router()
        .oneshot(common::authed(&h, "GET", "/api/integrations", "u1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = common::body_json(response).await;

    assert_eq!(body["integrations"].as_array().unwrap().len(), 3);

    let oura = tile(&body, "oura");
    assert_eq!(oura["status"], "connected");
    assert_eq!(oura["requires_action"], false);

    let fitbit = tile(&body, "fitbit");
    assert_eq!(fitbit["status"], "error");
    assert_eq!(fitbit["requires_action"], true);
    assert_eq!(fitbit["last_error"], "invalid_grant: revoked");

    let strava = tile(&body, "strava");
    assert_eq!(strava["status"], "disconnected");
    assert_eq!(strava["requires_action"], false);
}

#[tokio::test]
async fn test_tiles_are_per_user() {
    let h = common::create_test_app();
    h.connect("u1", Provider::Oura, chrono::Duration::hours(6))
        .await;

    let response = h
        .router()
        .oneshot(common::authed(&h, "GET", "/api/integrations", "u2"))
        .await
        .unwrap();
    let body = common::body_json(response).await;

    assert_eq!(tile(&body, "oura")["status"], "disconnected");
}

#[tokio::test]
async fn test_authorize_url_uses_pkce_where_supported() {
    let h = common::create_test_app();

    let response = h
        .router()
        .oneshot(common::authed(
            &h,
            "POST",
            "/api/integrations/fitbit/authorize",
            "u1",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = common::body_json(response).await;
    let url = body["authorization_url"].as_str().unwrap();

    assert!(url.starts_with("https://www.fitbit.com/oauth2/authorize?"));
    assert!(url.contains("client_id=test_fitbit_client_id"));
    assert!(url.contains("code_challenge="));
    assert!(url.contains("code_challenge_method=S256"));
    assert!(url.contains("state="));

    let response = h
        .router()
        .oneshot(common::authed(
            &h,
            "POST",
            "/api/integrations/strava/authorize",
            "u1",
        ))
        .await
        .unwrap();
    let body = common::body_json(response).await;
    let url = body["authorization_url"].as_str().unwrap();

    assert!(url.starts_with("https://www.strava.com/oauth/authorize?"));
    assert!(!url.contains("code_challenge"));
}

#[tokio::test]
async fn test_unknown_provider_is_not_found() {
    let h = common::create_test_app();

    let response = h
        .router()
        .oneshot(common::authed(
            &h,
            "POST",
            "/api/integrations/garmin/authorize",
            "u1",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_manual_sync_is_queued() {
    let h = common::create_test_app();
    h.connect("u1", Provider::Oura, chrono::Duration::hours(6))
        .await;

    let response = h
        .router()
        .oneshot(common::authed(
            &h,
            "POST",
            "/api/integrations/oura/sync",
            "u1",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = common::body_json(response).await;

    let jobs = h.db.jobs_for(&CredentialKey::new("u1", Provider::Oura));
    assert_eq!(jobs.len(), 1);
    assert_eq!(body["job_id"], jobs[0].id.as_str());
    assert_eq!(jobs[0].trigger, JobTrigger::Manual);
    assert_eq!(h.provider.fetch_calls(), 0);
}

#[tokio::test]
async fn test_manual_sync_needs_working_connection() {
    let h = common::create_test_app();

    let response = h
        .router()
        .oneshot(common::authed(
            &h,
            "POST",
            "/api/integrations/oura/sync",
            "u1",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    h.connect("u1", Provider::Oura, chrono::Duration::hours(6))
        .await;
    let key = CredentialKey::new("u1", Provider::Oura);
    let mut record = h.db.get_integration(&key).await.unwrap().unwrap();
    record.status = IntegrationStatus::Error;
    h.db.put_integration(&record).await.unwrap();

    let response = h
        .router()
        .oneshot(common::authed(
            &h,
            "POST",
            "/api/integrations/oura/sync",
            "u1",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = common::body_json(response).await;
    assert_eq!(body["error"], "reauth_required");
}

#[tokio::test]
async fn test_disconnect_removes_credential() {
    let h = common::create_test_app();
    h.connect("u1", Provider::Fitbit, chrono::Duration::hours(6))
        .await;
    h.state
        .subscriptions
        .ensure_subscription(Provider::Fitbit, SubscriptionOwner::User("u1".to_string()))
        .await
        .unwrap();

    let response = h
        .router()
        .oneshot(common::authed(
            &h,
            "DELETE",
            "/api/integrations/fitbit",
            "u1",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = common::body_json(response).await;
    assert_eq!(body["success"], true);

    let key = CredentialKey::new("u1", Provider::Fitbit);
    assert!(h.state.tokens.get(&key).await.unwrap().is_none());
    let record = h.db.get_integration(&key).await.unwrap().unwrap();
    assert_eq!(record.status, IntegrationStatus::Disconnected);
    assert!(h
        .db
        .get_subscription(Provider::Fitbit, &SubscriptionOwner::User("u1".to_string()))
        .await
        .unwrap()
        .is_none());

    // Nothing left to disconnect.
    let response = h
        .router()
        .oneshot(common::authed(
            &h,
            "DELETE",
            "/api/integrations/strava",
            "u1",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_provider_data_returns_records() {
    let h = common::create_test_app();
    h.connect("u1", Provider::Oura, chrono::Duration::hours(6))
        .await;

    let response = h
        .router()
        .oneshot(common::authed(
            &h,
            "GET",
            "/api/providers/oura/data",
            "u1",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = common::body_json(response).await;
    assert_eq!(body["provider"], "oura");
    assert_eq!(body["count"], 1);
    assert_eq!(body["records"][0]["id"], "rec-access-oura-u1");

    // Served fresh, not stored.
    assert!(h
        .db
        .records_for(&CredentialKey::new("u1", Provider::Oura))
        .is_empty());
}

#[tokio::test]
async fn test_provider_data_rejects_bad_since() {
    let h = common::create_test_app();
    h.connect("u1", Provider::Oura, chrono::Duration::hours(6))
        .await;

    for since in ["yesterday", "2999-01-01"] {
        let response = h
            .router()
            .oneshot(common::authed(
                &h,
                "GET",
                &format!("/api/providers/oura/data?since={}", since),
                "u1",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "since={since}");
    }
    assert_eq!(h.provider.fetch_calls(), 0);
}

#[tokio::test]
async fn test_provider_data_rate_limited() {
    let h = common::create_test_app();
    h.connect("u1", Provider::Strava, chrono::Duration::hours(6))
        .await;

    for _ in 0..100 {
        assert!(h
            .state
            .limiter
            .try_acquire(Provider::Strava, APP_KEY)
            .await
            .unwrap()
            .is_allowed());
    }

    let response = h
        .router()
        .oneshot(common::authed(
            &h,
            "GET",
            "/api/providers/strava/data",
            "u1",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()[header::RETRY_AFTER], "900");
    assert_eq!(h.provider.fetch_calls(), 0);
}

#[tokio::test]
async fn test_provider_data_without_connection() {
    let h = common::create_test_app();

    let response = h
        .router()
        .oneshot(common::authed(
            &h,
            "GET",
            "/api/providers/oura/data",
            "u1",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
}
