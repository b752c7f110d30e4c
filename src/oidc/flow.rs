//! Authorization-code login: the `/oidc` redirect and the `/oidc-callback`
//! completion

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::provider::{Provider, idp_client};
use super::refresh_cache_key;
use super::state::{FlowState, FlowStateStore, generate_state};
use super::verifier::{IdTokenClaims, IdTokenVerifier, JwksCache};
use crate::cache::TtlCache;
use crate::config::OidcSettings;
use crate::context::ClusterContext;
use crate::{Error, Result};

/// Outcome of a successful callback
#[derive(Debug, Clone)]
pub struct CompletedLogin {
    /// Cluster the login was for
    pub cluster: String,
    /// Raw token to store in the auth cookie
    pub token: String,
    /// Verified claims
    pub claims: IdTokenClaims,
}

/// Drives logins for every OIDC cluster
pub struct OidcFlow {
    settings: OidcSettings,
    timeout: Duration,
    states: Arc<dyn FlowStateStore>,
    tokens: Arc<TtlCache<String>>,
}

impl OidcFlow {
    /// Flow using `states` for correlation and `tokens` for refresh tokens
    #[must_use]
    pub fn new(
        settings: OidcSettings,
        timeout: Duration,
        states: Arc<dyn FlowStateStore>,
        tokens: Arc<TtlCache<String>>,
    ) -> Self {
        Self {
            settings,
            timeout,
            states,
            tokens,
        }
    }

    /// Gateway-level OIDC settings
    #[must_use]
    pub fn settings(&self) -> &OidcSettings {
        &self.settings
    }

    /// Start a login for `ctx` and return the authorization URL to redirect to
    pub async fn begin(&self, ctx: &ClusterContext, redirect_url: &str) -> Result<String> {
        let cfg = ctx.oidc_config()?;
        let http = idp_client(cfg, self.settings.insecure_idp, self.timeout)?;

        let issuer_override = non_empty(self.settings.validator_issuer_url.as_deref());
        let provider = Provider::discover(
            http.clone(),
            &cfg.issuer_url,
            &cfg.client_id,
            &cfg.client_secret,
            issuer_override.is_some(),
        )
        .await?;

        let issuer = issuer_override
            .map_or_else(|| provider.metadata().issuer.clone(), String::from);
        let audience = non_empty(self.settings.validator_client_id.as_deref())
            .unwrap_or(&cfg.client_id)
            .to_string();
        let verifier = IdTokenVerifier::new(
            issuer,
            audience,
            provider.metadata().jwks_uri.clone(),
            Arc::new(JwksCache::new(http)),
        );

        let scopes = with_openid_scope(&cfg.scopes);
        let state = generate_state();
        let pkce = (cfg.use_pkce || self.settings.use_pkce).then(generate_pkce);

        let auth_url = provider.authorization_url(
            redirect_url,
            &scopes,
            &state,
            pkce.as_ref().map(|(_, challenge)| challenge.as_str()),
        )?;

        self.states
            .put(
                state,
                FlowState {
                    cluster: ctx.name.clone(),
                    provider: Arc::new(provider),
                    verifier,
                    redirect_url: redirect_url.to_string(),
                    code_verifier: pkce.map(|(verifier, _)| verifier),
                    created_at: Instant::now(),
                },
            )
            .await;

        info!(cluster = %ctx.name, "Redirecting to identity provider");
        Ok(auth_url)
    }

    /// Finish the login identified by `state`
    ///
    /// The flow entry is consumed before anything else can fail, so a state
    /// value is never usable twice.
    pub async fn complete(&self, state: &str, code: &str) -> Result<CompletedLogin> {
        if state.is_empty() {
            return Err(Error::BadRequest("invalid request state is empty".to_string()));
        }

        let Some(flow) = self.states.take(state).await else {
            warn!("Callback with unknown OAuth state");
            return Err(Error::InvalidOAuthState);
        };

        let response = flow
            .provider
            .exchange_code(code, &flow.redirect_url, flow.code_verifier.as_deref())
            .await
            .map_err(|e| Error::TokenExchange(format!("Failed to exchange token: {e}")))?;

        let token_type = self.settings.token_type();
        let raw = response
            .select(token_type)
            .ok_or_else(|| Error::TokenExchange(format!("No {token_type} field in oauth2 token.")))?
            .to_string();

        if let Some(refresh_token) = response.refresh_token.filter(|t| !t.is_empty()) {
            self.tokens.set(refresh_cache_key(&raw), refresh_token);
        } else {
            debug!(cluster = %flow.cluster, "Provider issued no refresh token");
        }

        let claims = flow
            .verifier
            .verify(&raw)
            .await
            .map_err(|e| Error::TokenVerification(format!("Failed to verify ID Token: {e}")))?;

        info!(cluster = %flow.cluster, subject = %claims.sub, "OIDC login completed");
        Ok(CompletedLogin {
            cluster: flow.cluster,
            token: raw,
            claims,
        })
    }
}

/// `openid` followed by the configured scopes
fn with_openid_scope(scopes: &[String]) -> Vec<String> {
    std::iter::once("openid".to_string())
        .chain(scopes.iter().filter(|s| *s != "openid").cloned())
        .collect()
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// PKCE code verifier and its S256 challenge
fn generate_pkce() -> (String, String) {
    let verifier_bytes: [u8; 32] = rand::rng().random();
    let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);

    let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
    (verifier, challenge)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextSource, OidcConfig};
    use crate::oidc::state::InMemoryFlowStateStore;

    fn flow() -> OidcFlow {
        OidcFlow::new(
            OidcSettings::default(),
            Duration::from_secs(5),
            Arc::new(InMemoryFlowStateStore::new(Duration::from_secs(60))),
            Arc::new(TtlCache::default()),
        )
    }

    #[test]
    fn openid_scope_comes_first_once() {
        assert_eq!(with_openid_scope(&[]), vec!["openid"]);
        assert_eq!(
            with_openid_scope(&["groups".into(), "openid".into(), "email".into()]),
            vec!["openid", "groups", "email"]
        );
    }

    #[test]
    fn pkce_challenge_is_sha256_of_verifier() {
        let (verifier, challenge) = generate_pkce();
        assert_eq!(verifier.len(), 43);
        assert_eq!(
            challenge,
            URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
        );
    }

    #[tokio::test]
    async fn empty_state_is_bad_request() {
        let err = flow().complete("", "code").await.unwrap_err();
        assert_eq!(err.to_string(), "invalid request state is empty");
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_state_is_invalid_request() {
        let err = flow().complete("forged", "code").await.unwrap_err();
        assert!(matches!(err, Error::InvalidOAuthState));
        assert_eq!(err.to_string(), "invalid request");
    }

    #[tokio::test]
    async fn begin_requires_oidc_config() {
        let ctx = ClusterContext::new("plain", "https://k8s", ContextSource::KubeConfig);
        let err = flow().begin(&ctx, "http://localhost/oidc-callback").await.unwrap_err();
        assert!(matches!(err, Error::OidcNotConfigured(_)));
    }

    #[tokio::test]
    async fn begin_fails_when_discovery_is_unreachable() {
        let mut ctx = ClusterContext::new("corp", "https://k8s", ContextSource::KubeConfig);
        ctx.oidc = Some(OidcConfig {
            issuer_url: "http://127.0.0.1:1/realms/x".into(),
            client_id: "cid".into(),
            ..OidcConfig::default()
        });

        assert!(flow().begin(&ctx, "http://localhost/oidc-callback").await.is_err());
    }
}
