//! OIDC configuration mismatch diagnostics
//!
//! When the gateway authenticates a cluster through OIDC, sends the user's
//! bearer token and the API server still answers 401/403, the most likely
//! cause is an API server that does not trust the same identity provider.
//! The helpers here classify that case and render a Kubernetes-style
//! `Status` body describing it.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Response header flagging a suspected mismatch
pub const MISMATCH_HEADER: &str = "x-headlamp-error";

/// Value of [`MISMATCH_HEADER`]
pub const MISMATCH_HEADER_VALUE: &str = "OIDC_CONFIG_MISMATCH";

const MISMATCH_MESSAGE: &str = "Kubernetes API server may not be configured for OIDC authentication";
const SUGGESTED_ACTION: &str = "Verify that the Kubernetes API server is configured with the same OIDC provider and settings as Headlamp.";

/// Kubernetes `Status` object describing the mismatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MismatchStatus {
    /// Always `Status`
    pub kind: &'static str,
    /// Always `v1`
    pub api_version: &'static str,
    /// Empty object metadata
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Always `Failure`
    pub status: &'static str,
    /// Human-readable explanation
    pub message: &'static str,
    /// Always `OIDCConfigMismatch`
    pub reason: &'static str,
    /// Remediation hints
    pub details: MismatchDetails,
    /// Upstream status code
    pub code: u16,
}

/// Diagnostic details of a [`MismatchStatus`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MismatchDetails {
    /// Always `oidc-mismatch`
    pub error_type: &'static str,
    /// What the operator should check
    pub suggested_action: &'static str,
    /// Upstream status code
    pub original_status: u16,
}

impl MismatchStatus {
    /// Status body for an upstream answer of `original`
    #[must_use]
    pub fn new(original: StatusCode) -> Self {
        Self {
            kind: "Status",
            api_version: "v1",
            metadata: serde_json::Map::new(),
            status: "Failure",
            message: MISMATCH_MESSAGE,
            reason: "OIDCConfigMismatch",
            details: MismatchDetails {
                error_type: "oidc-mismatch",
                suggested_action: SUGGESTED_ACTION,
                original_status: original.as_u16(),
            },
            code: original.as_u16(),
        }
    }
}

/// Per-cluster detector
#[derive(Debug, Clone)]
pub struct MismatchDetector {
    is_oidc_configured: bool,
    cluster: String,
}

impl MismatchDetector {
    /// Detector for `cluster`; `is_oidc_configured` when the gateway uses OIDC for it
    #[must_use]
    pub fn new(is_oidc_configured: bool, cluster: impl Into<String>) -> Self {
        Self {
            is_oidc_configured,
            cluster: cluster.into(),
        }
    }

    /// Whether a response with `status` to a request that did (or did not)
    /// carry a bearer token points to a mismatch
    #[must_use]
    pub fn detect(&self, status: StatusCode, had_bearer_token: bool) -> bool {
        detect_mismatch(self.is_oidc_configured, had_bearer_token, status)
    }

    /// Cluster this detector belongs to
    #[must_use]
    pub fn cluster(&self) -> &str {
        &self.cluster
    }
}

/// True iff OIDC is configured, a bearer token was sent and the upstream
/// answered 401 or 403
#[must_use]
pub fn detect_mismatch(is_oidc_configured: bool, had_bearer_token: bool, status: StatusCode) -> bool {
    is_oidc_configured
        && had_bearer_token
        && (status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN)
}

/// Whether an `Authorization` value is a `Bearer <token>` credential
///
/// Case-insensitive, leading/trailing whitespace ignored.
#[must_use]
pub fn has_bearer_token(auth_header: &str) -> bool {
    auth_header.trim().to_lowercase().starts_with("bearer ")
}

/// JSON mismatch response carrying `original` as HTTP status and body code
#[must_use]
pub fn mismatch_response(original: StatusCode) -> Response {
    let body = serde_json::to_vec(&MismatchStatus::new(original)).unwrap_or_default();
    let mut response = (original, body).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response.headers_mut().insert(
        MISMATCH_HEADER,
        HeaderValue::from_static(MISMATCH_HEADER_VALUE),
    );
    response
}
