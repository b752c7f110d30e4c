//! Error types for the cluster gateway

use std::io;

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias for the cluster gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Cluster gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// No context with this name is registered
    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    /// The context exists but failed during setup
    #[error("{0}")]
    ClusterSetup(String),

    /// The context has no OIDC auth configured
    #[error("cluster {0} is not configured for OIDC authentication")]
    OidcNotConfigured(String),

    /// Unknown, expired or already-consumed OAuth state
    #[error("invalid request")]
    InvalidOAuthState,

    /// Authorization code or refresh grant failed at the identity provider
    #[error("{0}")]
    TokenExchange(String),

    /// Identity token signature/claims did not verify
    #[error("{0}")]
    TokenVerification(String),

    /// ID token failed verification
    #[error("{0}")]
    Verify(#[from] crate::oidc::VerifyError),

    /// TTL cache lookup failed
    #[error("{0}")]
    Cache(#[from] crate::cache::CacheError),

    /// No cached refresh token for the presented token
    #[error("no refresh token cached for this token")]
    RefreshUnavailable,

    /// Upstream API server unreachable or the request could not be built
    #[error("failed to proxy request: {0}")]
    ProxyForwarding(String),

    /// Add or rename collides with an existing name
    #[error("{0}")]
    NameCollision(String),

    /// Missing or wrong `X-HEADLAMP_BACKEND-TOKEN`
    #[error("access denied")]
    BackendTokenMismatch,

    /// Kubeconfig could not be read, parsed or written
    #[error("kubeconfig: {0}")]
    Kubeconfig(String),

    /// Bad request payload
    #[error("{0}")]
    BadRequest(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Kubernetes API call failed
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status a handler should answer with for this error
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ClusterNotFound(_) | Self::Cache(_) => StatusCode::NOT_FOUND,
            Self::ClusterSetup(_)
            | Self::InvalidOAuthState
            | Self::NameCollision(_)
            | Self::BadRequest(_)
            | Self::Json(_) => StatusCode::BAD_REQUEST,
            Self::BackendTokenMismatch => StatusCode::FORBIDDEN,
            Self::ProxyForwarding(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(
            Error::ClusterNotFound("a".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::ClusterSetup("bad ca".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(Error::InvalidOAuthState.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            Error::NameCollision("taken".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::BackendTokenMismatch.status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            Error::TokenExchange("boom".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn invalid_state_message_reveals_nothing() {
        assert_eq!(Error::InvalidOAuthState.to_string(), "invalid request");
    }

    #[test]
    fn backend_token_message_is_access_denied() {
        assert_eq!(Error::BackendTokenMismatch.to_string(), "access denied");
    }
}
