//! Setting and clearing the per-cluster auth cookie

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::debug;

use super::AppState;
use crate::auth::{auth_cookie, clear_auth_cookie, is_secure_request};

#[derive(Debug, Default, Deserialize)]
struct SetTokenRequest {
    #[serde(default)]
    cluster: String,
    #[serde(default)]
    token: String,
}

/// `POST /clusters/{cluster}/set-token`
pub(super) async fn set_token(
    State(state): State<Arc<AppState>>,
    Path(cluster): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match serde_json::from_slice::<SetTokenRequest>(&body) {
        Ok(request) => apply(&state, &headers, &cluster, &request.token),
        Err(_) => (StatusCode::BAD_REQUEST, "Invalid JSON").into_response(),
    }
}

/// `POST /auth/set-token`, with the cluster named in the body
pub(super) async fn set_token_from_body(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match serde_json::from_slice::<SetTokenRequest>(&body) {
        Ok(request) => apply(&state, &headers, &request.cluster, &request.token),
        Err(_) => (StatusCode::BAD_REQUEST, "Invalid JSON").into_response(),
    }
}

/// Set the cookie, or clear it when `token` is empty
fn apply(state: &AppState, headers: &HeaderMap, cluster: &str, token: &str) -> Response {
    if cluster.is_empty() {
        return (StatusCode::BAD_REQUEST, "Cluster name is required").into_response();
    }

    let secure = is_secure_request(headers, state.tls_enabled());
    let cookie = if token.is_empty() {
        debug!(cluster = %cluster, "Clearing auth cookie");
        clear_auth_cookie(cluster, state.base_url(), secure)
    } else {
        debug!(cluster = %cluster, "Setting auth cookie");
        auth_cookie(cluster, token, state.base_url(), secure)
    };

    match HeaderValue::from_str(&cookie) {
        Ok(value) => (StatusCode::OK, [(header::SET_COOKIE, value)]).into_response(),
        Err(_) => (StatusCode::BAD_REQUEST, "Invalid token").into_response(),
    }
}
