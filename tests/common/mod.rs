// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

use axum::body::Body;
use axum::http::{Request, Response};
use cloudbrain_sync::db::FirestoreDb;
use cloudbrain_sync::middleware::auth::create_jwt;
use cloudbrain_sync::test_utils::TestHarness;

/// Check if emulator is available via environment variable.
#[allow(dead_code)]
pub fn emulator_available() -> bool {
    std::env::var("FIRESTORE_EMULATOR_HOST").is_ok()
}

/// Skip test with message if emulator not available.
#[macro_export]
macro_rules! require_emulator {
    () => {
        if !crate::common::emulator_available() {
            eprintln!("⚠️  Skipping: FIRESTORE_EMULATOR_HOST not set");
            return;
        }
    };
}

/// Redis URL for rate-limit backend tests, if one is configured.
#[allow(dead_code)]
pub fn redis_url() -> Option<String> {
    std::env::var("REDIS_URL").ok().filter(|v| !v.trim().is_empty())
}

/// Skip test with message if no Redis is configured.
#[macro_export]
macro_rules! require_redis {
    () => {
        match crate::common::redis_url() {
            Some(url) => url,
            None => {
                eprintln!("⚠️  Skipping: REDIS_URL not set");
                return;
            }
        }
    };
}

/// Create a test database connection.
#[allow(dead_code)]
pub async fn test_db() -> FirestoreDb {
    FirestoreDb::new("test-project")
        .await
        .expect("Failed to connect to Firestore emulator")
}

/// Create an offline app: memory storage, mock KMS, fake provider, manual clock.
#[allow(dead_code)]
pub fn create_test_app() -> TestHarness {
    TestHarness::new()
}

/// Session token for `user_id`, signed with the test key.
#[allow(dead_code)]
pub fn session_token(harness: &TestHarness, user_id: &str) -> String {
    create_jwt(user_id, &harness.state.config.jwt_signing_key).expect("Failed to create JWT")
}

/// Authenticated request with an empty body.
#[allow(dead_code)]
pub fn authed(harness: &TestHarness, method: &str, uri: &str, user_id: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(
            "Authorization",
            format!("Bearer {}", session_token(harness, user_id)),
        )
        .body(Body::empty())
        .unwrap()
}

/// Collect a response body as JSON.
#[allow(dead_code)]
pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("Failed to read body");
    serde_json::from_slice(&bytes).expect("Body is not JSON")
}
