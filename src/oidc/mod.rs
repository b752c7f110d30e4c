//! OpenID Connect login and token refresh
//!
//! - [`OidcFlow`]: `/oidc` redirect and `/oidc-callback` completion
//! - [`TokenRefresher`]: refresh-token grants for near-expiry cookies
//! - [`FlowStateStore`]: correlation of redirects with callbacks
//! - [`IdTokenVerifier`]: JWKS-backed ID-token verification

pub mod flow;
pub mod provider;
pub mod refresh;
pub mod state;
pub mod verifier;

pub use flow::{CompletedLogin, OidcFlow};
pub use provider::{Provider, ProviderMetadata, TokenResponse};
pub use refresh::{EXPIRY_MARGIN, TokenRefresher};
pub use state::{FlowState, FlowStateStore, InMemoryFlowStateStore, spawn_reaper};
pub use verifier::{IdTokenClaims, IdTokenVerifier, JwksCache, VerifyError};

/// Cache key under which the refresh token of `token` is stored
#[must_use]
pub fn refresh_cache_key(token: &str) -> String {
    format!("oidc-token-{token}")
}
