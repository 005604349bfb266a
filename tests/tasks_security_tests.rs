// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Security tests for the scheduler trigger.

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use cloudbrain_sync::models::Provider;
use tower::ServiceExt;

mod common;

fn tick_request(authorization: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("POST").uri("/tasks/tick");
    if let Some(value) = authorization {
        builder = builder.header("authorization", value);
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_tick_without_bearer_unauthorized() {
    let h = common::create_test_app();

    let response = h.router().oneshot(tick_request(None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_tick_with_wrong_secret_forbidden() {
    let h = common::create_test_app();
    h.connect("u1", Provider::Oura, chrono::Duration::hours(6))
        .await;

    let response = h
        .router()
        .oneshot(tick_request(Some("Bearer not-the-secret")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    // Nothing ran.
    assert_eq!(h.provider.fetch_calls(), 0);
}

#[tokio::test]
async fn test_tick_with_user_session_forbidden() {
    let h = common::create_test_app();
    let session = common::session_token(&h, "u1");

    let response = h
        .router()
        .oneshot(tick_request(Some(&format!("Bearer {session}"))))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_tick_with_secret_runs_pass() {
    let h = common::create_test_app();
    h.connect("u1", Provider::Oura, chrono::Duration::hours(6))
        .await;
    h.connect("u2", Provider::Strava, chrono::Duration::hours(6))
        .await;

    let response = h
        .router()
        .oneshot(tick_request(Some("Bearer test_tasks_secret")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = common::body_json(response).await;
    assert_eq!(body["enqueued"], 2);
    assert_eq!(body["executed"], 2);
    assert_eq!(body["succeeded"], 2);
    assert_eq!(body["reclaimed"], 0);
    assert_eq!(body["subscriptions"]["renewed"], 0);
    assert_eq!(h.provider.fetch_calls(), 2);
}

#[tokio::test]
async fn test_tick_with_empty_configured_secret_forbidden() {
    let mut config = cloudbrain_sync::config::Config::test_default();
    config.tasks_secret = String::new();
    let h = cloudbrain_sync::test_utils::TestHarness::with_config(config);

    let response = h.router().oneshot(tick_request(Some("Bearer "))).await.unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
