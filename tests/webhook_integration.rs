// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Integration tests for webhook handling.

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use cloudbrain_sync::models::{CredentialKey, JobStatus, JobTrigger, Provider};
use cloudbrain_sync::test_utils::TestHarness;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use tower::ServiceExt;

mod common;

const PATH_SECRET: &str = "test-webhook-path-secret";
const VERIFY_TOKEN: &str = "test_verify_token";

fn get(uri: String) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: String, body: String) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

fn oura_signature(body: &str, timestamp: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(b"test_oura_secret").unwrap();
    mac.update(timestamp.as_bytes());
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn signed_oura(body: String, timestamp: &str, signature: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/webhooks/oura/{}", PATH_SECRET))
        .header("Content-Type", "application/json")
        .header("x-oura-timestamp", timestamp)
        .header("x-oura-signature", signature)
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn test_strava_hub_challenge() {
    let h = common::create_test_app();

    let response = h
        .router()
        .oneshot(get(format!(
            "/webhooks/strava/{}?hub.mode=subscribe&hub.challenge=test_challenge_123&hub.verify_token={}",
            PATH_SECRET, VERIFY_TOKEN
        )))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = common::body_json(response).await;
    assert_eq!(body["hub.challenge"], "test_challenge_123");
}

#[tokio::test]
async fn test_strava_wrong_verify_token() {
    let h = common::create_test_app();

    let response = h
        .router()
        .oneshot(get(format!(
            "/webhooks/strava/{}?hub.mode=subscribe&hub.challenge=abc&hub.verify_token=wrong",
            PATH_SECRET
        )))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_oura_challenge_echo() {
    let h = common::create_test_app();

    let response = h
        .router()
        .oneshot(get(format!(
            "/webhooks/oura/{}?verification_token={}&challenge=oura-xyz",
            PATH_SECRET, VERIFY_TOKEN
        )))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = common::body_json(response).await;
    assert_eq!(body, json!({ "challenge": "oura-xyz" }));
}

#[tokio::test]
async fn test_fitbit_verify_code() {
    let h = common::create_test_app();

    let ok = h
        .router()
        .oneshot(get(format!(
            "/webhooks/fitbit/{}?verify={}",
            PATH_SECRET, VERIFY_TOKEN
        )))
        .await
        .unwrap();
    assert_eq!(ok.status(), StatusCode::NO_CONTENT);

    let bad = h
        .router()
        .oneshot(get(format!(
            "/webhooks/fitbit/{}?verify=incorrect",
            PATH_SECRET
        )))
        .await
        .unwrap();
    assert_eq!(bad.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_wrong_path_secret_is_not_found() {
    let h = common::create_test_app();

    let verify = h
        .router()
        .oneshot(get(format!(
            "/webhooks/strava/guess?hub.mode=subscribe&hub.challenge=abc&hub.verify_token={}",
            VERIFY_TOKEN
        )))
        .await
        .unwrap();
    assert_eq!(verify.status(), StatusCode::NOT_FOUND);

    let event = h
        .router()
        .oneshot(post_json(
            "/webhooks/strava/guess".to_string(),
            json!({"owner_id": "puid-u1"}).to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(event.status(), StatusCode::NOT_FOUND);

    let unknown = h
        .router()
        .oneshot(post_json(
            format!("/webhooks/garmin/{}", PATH_SECRET),
            "{}".to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_strava_event_enqueues_job() {
    let h = common::create_test_app();
    h.connect("u1", Provider::Strava, chrono::Duration::hours(6))
        .await;

    let event = json!({
        "object_type": "activity",
        "object_id": 1360128428,
        "aspect_type": "create",
        "owner_id": "puid-u1",
        "subscription_id": 120475,
        "event_time": 1516126040
    });

    let response = h
        .router()
        .oneshot(post_json(
            format!("/webhooks/strava/{}", PATH_SECRET),
            event.to_string(),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let jobs = h.db.jobs_for(&CredentialKey::new("u1", Provider::Strava));
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].trigger, JobTrigger::Webhook);
    assert_eq!(jobs[0].status, JobStatus::Pending);

    // Data is fetched by the scheduler, never inline.
    assert_eq!(h.provider.fetch_calls(), 0);
}

#[tokio::test]
async fn test_repeated_events_share_one_job() {
    let h = common::create_test_app();
    h.connect("u1", Provider::Strava, chrono::Duration::hours(6))
        .await;

    for _ in 0..3 {
        let response = h
            .router()
            .oneshot(post_json(
                format!("/webhooks/strava/{}", PATH_SECRET),
                json!({"owner_id": "puid-u1", "aspect_type": "update"}).to_string(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    assert_eq!(
        h.db.jobs_for(&CredentialKey::new("u1", Provider::Strava)).len(),
        1
    );
}

#[tokio::test]
async fn test_fitbit_batch_acknowledged_with_204() {
    let h = common::create_test_app();
    h.connect("u1", Provider::Fitbit, chrono::Duration::hours(6))
        .await;
    h.connect("u2", Provider::Fitbit, chrono::Duration::hours(6))
        .await;

    let batch = json!([
        {"collectionType": "activities", "date": "2026-10-01", "ownerId": "puid-u1", "ownerType": "user"},
        {"collectionType": "sleep", "date": "2026-10-01", "ownerId": "puid-u1", "ownerType": "user"},
        {"collectionType": "sleep", "date": "2026-10-01", "ownerId": "puid-u2", "ownerType": "user"}
    ]);

    let response = h
        .router()
        .oneshot(post_json(
            format!("/webhooks/fitbit/{}", PATH_SECRET),
            batch.to_string(),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        h.db.jobs_for(&CredentialKey::new("u1", Provider::Fitbit)).len(),
        1
    );
    assert_eq!(
        h.db.jobs_for(&CredentialKey::new("u2", Provider::Fitbit)).len(),
        1
    );
}

#[tokio::test]
async fn test_oura_valid_signature_accepted() {
    let h = common::create_test_app();
    h.connect("u1", Provider::Oura, chrono::Duration::hours(6))
        .await;

    let body = json!({"event_type": "create", "data_type": "sleep", "user_id": "puid-u1"}).to_string();
    let timestamp = h.now().timestamp().to_string();
    let signature = oura_signature(&body, &timestamp);

    let response = h
        .router()
        .oneshot(signed_oura(body, &timestamp, &signature))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        h.db.jobs_for(&CredentialKey::new("u1", Provider::Oura)).len(),
        1
    );
}

#[tokio::test]
async fn test_oura_bad_signature_rejected() {
    let h = common::create_test_app();
    h.connect("u1", Provider::Oura, chrono::Duration::hours(6))
        .await;

    let body = json!({"event_type": "create", "user_id": "puid-u1"}).to_string();
    let timestamp = h.now().timestamp().to_string();
    let forged = oura_signature("{\"user_id\":\"someone-else\"}", &timestamp);

    let response = h
        .router()
        .oneshot(signed_oura(body.clone(), &timestamp, &forged))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Missing headers are rejected too.
    let response = h
        .router()
        .oneshot(post_json(format!("/webhooks/oura/{}", PATH_SECRET), body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    assert!(h
        .db
        .jobs_for(&CredentialKey::new("u1", Provider::Oura))
        .is_empty());
}

#[tokio::test]
async fn test_oura_replayed_event_rejected() {
    let h = common::create_test_app();
    h.connect("u1", Provider::Oura, chrono::Duration::hours(6))
        .await;

    let body = json!({"event_type": "update", "user_id": "puid-u1"}).to_string();
    let sent = h.now().timestamp().to_string();
    let signature = oura_signature(&body, &sent);

    // A correctly signed event delivered again ten minutes later.
    h.clock.advance(chrono::Duration::minutes(10));
    let response = h
        .router()
        .oneshot(signed_oura(body.clone(), &sent, &signature))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Timestamps from the future are refused as well.
    let ahead = (h.now() + chrono::Duration::minutes(10)).timestamp().to_string();
    let signature = oura_signature(&body, &ahead);
    let response = h
        .router()
        .oneshot(signed_oura(body, &ahead, &signature))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    assert!(h
        .db
        .jobs_for(&CredentialKey::new("u1", Provider::Oura))
        .is_empty());
}

#[tokio::test]
async fn test_malformed_payload_is_acknowledged() {
    let h = common::create_test_app();

    let response = h
        .router()
        .oneshot(post_json(
            format!("/webhooks/strava/{}", PATH_SECRET),
            "not json {".to_string(),
        ))
        .await
        .unwrap();

    // Dropped, but acknowledged.
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_event_for_unknown_or_disconnected_user_is_ignored() {
    let h = common::create_test_app();
    h.connect("u1", Provider::Strava, chrono::Duration::hours(6))
        .await;
    let key = CredentialKey::new("u1", Provider::Strava);
    h.state.oauth.disconnect(&key).await.unwrap();

    for owner in ["puid-u1", "puid-nobody"] {
        let response = h
            .router()
            .oneshot(post_json(
                format!("/webhooks/strava/{}", PATH_SECRET),
                json!({"owner_id": owner}).to_string(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    assert!(h.db.jobs_for(&key).is_empty());
}

#[tokio::test]
async fn test_disabled_provider_has_no_webhook() {
    let mut config = cloudbrain_sync::config::Config::test_default();
    config.providers.remove(&Provider::Fitbit);
    let h = TestHarness::with_config(config);

    let response = h
        .router()
        .oneshot(get(format!(
            "/webhooks/fitbit/{}?verify={}",
            PATH_SECRET, VERIFY_TOKEN
        )))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
