// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! OAuth callback routes.
//!
//! Authorization is started from the authenticated API
//! (`POST /api/integrations/{provider}/authorize`); the provider then sends
//! the browser here, and we bounce it back to the frontend.

use crate::models::Provider;
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    response::Redirect,
    routing::get,
    Router,
};
use serde::Deserialize;
use std::sync::Arc;

/// OAuth routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/auth/{provider}/callback", get(auth_callback))
}

/// Query parameters on the provider redirect.
#[derive(Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// OAuth callback - exchange the code and redirect to the frontend.
///
/// Every outcome is a redirect; the frontend shows `status=error` to the
/// user.
async fn auth_callback(
    State(state): State<Arc<AppState>>,
    Path(provider_name): Path<String>,
    Query(params): Query<CallbackParams>,
) -> Redirect {
    let frontend_url = &state.config.frontend_url;

    let Ok(provider) = provider_name.parse::<Provider>() else {
        tracing::warn!(provider = %provider_name, "OAuth callback for unknown provider");
        return Redirect::temporary(&frontend_redirect(frontend_url, &provider_name, false));
    };

    if let Some(error) = params.error {
        tracing::warn!(provider = %provider, error = %error, "OAuth error from provider");
        return Redirect::temporary(&frontend_redirect(frontend_url, provider.as_str(), false));
    }

    let (Some(code), Some(oauth_state)) = (params.code, params.state) else {
        tracing::warn!(provider = %provider, "OAuth callback missing code or state");
        return Redirect::temporary(&frontend_redirect(frontend_url, provider.as_str(), false));
    };

    let connected = match state.oauth.complete(provider, &code, &oauth_state).await {
        Ok(key) => {
            tracing::info!(user_id = %key.user_id, provider = %provider, "OAuth successful");
            true
        }
        Err(e) => {
            tracing::warn!(provider = %provider, error = %e, "OAuth callback failed");
            false
        }
    };

    Redirect::temporary(&frontend_redirect(frontend_url, provider.as_str(), connected))
}

/// `{frontend}/integrations?provider=..&status=connected|error`
fn frontend_redirect(frontend_url: &str, provider: &str, connected: bool) -> String {
    format!(
        "{}/integrations?provider={}&status={}",
        frontend_url.trim_end_matches('/'),
        urlencoding::encode(provider),
        if connected { "connected" } else { "error" }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frontend_redirect() {
        assert_eq!(
            frontend_redirect("https://app.example.com/", "oura", true),
            "https://app.example.com/integrations?provider=oura&status=connected"
        );
        assert_eq!(
            frontend_redirect("https://app.example.com", "a b", false),
            "https://app.example.com/integrations?provider=a%20b&status=error"
        );
    }
}
