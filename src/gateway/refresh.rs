//! Token refresh middleware for cluster requests
//!
//! Best effort: a failed refresh is logged and the request goes through
//! with the old token, leaving the API server to reject it.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Request, State},
    http::{HeaderValue, header},
    middleware::Next,
    response::Response,
};
use tracing::{debug, warn};

use super::AppState;
use super::proxy::{RefreshedToken, resolve_context};
use crate::auth::{auth_cookie, is_about_to_expire, is_secure_request, request_token};
use crate::oidc::EXPIRY_MARGIN;
use crate::Error;

/// Refresh a near-expiry OIDC token before the request is proxied
pub(super) async fn refresh_middleware(
    State(state): State<Arc<AppState>>,
    Path(params): Path<HashMap<String, String>>,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(cluster) = params.get("cluster").filter(|c| !c.is_empty()) else {
        return next.run(req).await;
    };
    let Some(token) = request_token(req.headers(), cluster) else {
        return next.run(req).await;
    };
    if !is_about_to_expire(&token, EXPIRY_MARGIN) {
        return next.run(req).await;
    }
    let Ok(ctx) = resolve_context(&state, cluster, req.headers()) else {
        return next.run(req).await;
    };
    if ctx.oidc.is_none() {
        return next.run(req).await;
    }

    let new_token = match state.refresher.refresh(&ctx, &token).await {
        Ok(new_token) => new_token,
        Err(Error::RefreshUnavailable) => {
            debug!(cluster = %cluster, "Token near expiry but no refresh token cached");
            return next.run(req).await;
        }
        Err(e) => {
            warn!(cluster = %cluster, error = %e, "Token refresh failed");
            return next.run(req).await;
        }
    };

    let secure = is_secure_request(req.headers(), state.tls_enabled());
    let cookie = auth_cookie(cluster, &new_token, state.base_url(), secure);
    req.extensions_mut().insert(RefreshedToken(new_token));

    let mut response = next.run(req).await;
    match HeaderValue::from_str(&cookie) {
        Ok(value) => {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
        Err(e) => warn!(cluster = %cluster, error = %e, "Refreshed token is not a valid cookie value"),
    }
    response
}
