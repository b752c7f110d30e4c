//! `/oidc` and `/oidc-callback`

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{AppState, error_response};
use crate::auth::{auth_cookie, is_secure_request};

#[derive(Debug, Default, Deserialize)]
pub(super) struct LoginQuery {
    #[serde(default)]
    cluster: String,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct CallbackQuery {
    #[serde(default)]
    state: String,
    #[serde(default)]
    code: String,
}

/// `GET /oidc?cluster=`: redirect the browser to the identity provider
pub(super) async fn begin_login(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LoginQuery>,
    headers: HeaderMap,
) -> Response {
    if query.cluster.is_empty() {
        return StatusCode::NOT_FOUND.into_response();
    }
    let ctx = match state.store.get(&query.cluster) {
        Ok(ctx) => ctx,
        Err(e) => {
            debug!(cluster = %query.cluster, error = %e, "Login for unknown cluster");
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    let redirect_url = callback_url(&state, &headers);
    match state.flow.begin(&ctx, &redirect_url).await {
        Ok(auth_url) => found(&auth_url),
        Err(e) => error_response(&e),
    }
}

/// `GET /oidc-callback?state&code`: finish the login, set the auth cookie
/// and send the browser back to the UI
pub(super) async fn callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
    headers: HeaderMap,
) -> Response {
    let login = match state.flow.complete(&query.state, &query.code).await {
        Ok(login) => login,
        Err(e) => return error_response(&e),
    };

    let secure = is_secure_request(&headers, state.tls_enabled());
    let cookie = auth_cookie(&login.cluster, &login.token, state.base_url(), secure);
    let location = post_login_redirect(
        state.config.server.dev_mode,
        state.base_url(),
        &login.cluster,
    );

    let mut response = StatusCode::SEE_OTHER.into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&location) {
        headers.insert(header::LOCATION, value);
    }
    match HeaderValue::from_str(&cookie) {
        Ok(value) => {
            headers.insert(header::SET_COOKIE, value);
        }
        Err(e) => warn!(cluster = %login.cluster, error = %e, "Token is not a valid cookie value"),
    }
    response
}

fn found(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => (StatusCode::FOUND, [(header::LOCATION, value)]).into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Redirect URL registered with the identity provider
///
/// The configured callback URL wins. Otherwise it is derived from the
/// request: `X-Forwarded-Proto` if present, else `http` for `localhost:`
/// hosts or plain connections, else `https`.
pub(super) fn callback_url(state: &AppState, headers: &HeaderMap) -> String {
    if let Some(url) = state.config.oidc.callback_url.as_deref().filter(|u| !u.is_empty()) {
        return url.to_string();
    }

    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .trim_matches('/');
    let forwarded = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .filter(|p| !p.is_empty());
    let scheme = match forwarded {
        Some(proto) => proto,
        None if host.starts_with("localhost:") || !state.tls_enabled() => "http",
        None => "https",
    };

    let base = state.base_url();
    if base.is_empty() {
        format!("{scheme}://{host}/oidc-callback")
    } else {
        format!("{scheme}://{host}/{base}/oidc-callback")
    }
}

/// UI location after a successful login
fn post_login_redirect(dev_mode: bool, base_url: &str, cluster: &str) -> String {
    let mut url = if dev_mode { "http://localhost:3000/" } else { "/" }.to_string();
    if !base_url.is_empty() {
        url.push_str(base_url);
        url.push('/');
    }
    let cluster: String = url::form_urlencoded::byte_serialize(cluster.as_bytes()).collect();
    url.push_str("auth?cluster=");
    url.push_str(&cluster);
    url
}
