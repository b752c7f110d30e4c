//! Request-side authentication helpers
//!
//! - Per-cluster auth cookies carrying the user's bearer token
//! - Bearer header parsing and unverified JWT expiry checks
//! - The shared-secret check guarding dynamic-cluster mutations
//! - OIDC mismatch diagnostics ([`mismatch`])

pub mod mismatch;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::http::{HeaderMap, header};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use subtle::ConstantTimeEq;

use crate::{Error, Result};

/// Header carrying the backend shared secret
pub const BACKEND_TOKEN_HEADER: &str = "x-headlamp_backend-token";

/// Lifetime of the auth cookie
pub const COOKIE_MAX_AGE: Duration = Duration::from_secs(24 * 3600);

// =============================================================================
// Cookies
// =============================================================================

/// Cookie name for `cluster`; characters outside `[A-Za-z0-9-_]` become `-`
#[must_use]
pub fn cookie_name(cluster: &str) -> String {
    let sanitized: String = cluster
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("headlamp-auth-{sanitized}")
}

/// Cookie path for the configured base URL
#[must_use]
pub fn cookie_path(base_url: &str) -> String {
    let base = base_url.trim_matches('/');
    if base.is_empty() {
        "/".to_string()
    } else {
        format!("/{base}/")
    }
}

/// `Set-Cookie` value storing `token` for `cluster`
#[must_use]
pub fn auth_cookie(cluster: &str, token: &str, base_url: &str, secure: bool) -> String {
    format!(
        "{}={}; Path={}; Max-Age={}; HttpOnly; SameSite=Strict{}",
        cookie_name(cluster),
        token,
        cookie_path(base_url),
        COOKIE_MAX_AGE.as_secs(),
        if secure { "; Secure" } else { "" }
    )
}

/// `Set-Cookie` value clearing the auth cookie of `cluster`
#[must_use]
pub fn clear_auth_cookie(cluster: &str, base_url: &str, secure: bool) -> String {
    format!(
        "{}=; Path={}; Max-Age=0; HttpOnly; SameSite=Strict{}",
        cookie_name(cluster),
        cookie_path(base_url),
        if secure { "; Secure" } else { "" }
    )
}

/// Read a cookie value; every `Cookie` header is searched
#[must_use]
pub fn extract_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let prefix = format!("{name}=");
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .map(str::trim)
        .find_map(|c| c.strip_prefix(&prefix))
        .filter(|v| !v.is_empty())
        .map(String::from)
}

/// Token stored in the auth cookie of `cluster`
#[must_use]
pub fn token_from_cookie(headers: &HeaderMap, cluster: &str) -> Option<String> {
    extract_cookie(headers, &cookie_name(cluster))
}

/// Whether the request reached us over HTTPS
#[must_use]
pub fn is_secure_request(headers: &HeaderMap, tls_enabled: bool) -> bool {
    tls_enabled
        || headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|p| p.eq_ignore_ascii_case("https"))
}

// =============================================================================
// Bearer tokens
// =============================================================================

/// Token of an `Authorization: Bearer <token>` header
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    if !mismatch::has_bearer_token(value) {
        return None;
    }
    let token = value[7..].trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// Token for a cluster request: the cookie wins over the header
#[must_use]
pub fn request_token(headers: &HeaderMap, cluster: &str) -> Option<String> {
    token_from_cookie(headers, cluster).or_else(|| bearer_token(headers))
}

/// `exp` claim of a JWT, read without verifying the signature
#[must_use]
pub fn unverified_expiry(token: &str) -> Option<u64> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("exp").and_then(|exp| {
        exp.as_u64()
            .or_else(|| exp.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
    })
}

/// Whether `token` expires within `margin`
///
/// Tokens without a readable `exp` are never considered expiring.
#[must_use]
pub fn is_about_to_expire(token: &str, margin: Duration) -> bool {
    let Some(exp) = unverified_expiry(token) else {
        return false;
    };
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    exp <= now.saturating_add(margin.as_secs())
}

// =============================================================================
// Backend token
// =============================================================================

/// Check the shared secret guarding dynamic-cluster mutations
///
/// Skipped in in-cluster mode. A missing server-side secret denies everything.
pub fn check_backend_token(
    headers: &HeaderMap,
    expected: Option<&str>,
    in_cluster: bool,
) -> Result<()> {
    if in_cluster {
        return Ok(());
    }

    let Some(expected) = expected.filter(|e| !e.is_empty()) else {
        return Err(Error::BackendTokenMismatch);
    };
    let presented = headers
        .get(BACKEND_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(Error::BackendTokenMismatch)
    }
}
