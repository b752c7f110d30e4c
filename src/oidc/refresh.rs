//! Refresh-token grants for near-expiry tokens
//!
//! Refreshes for the same `(cluster, token)` pair are serialized. The new
//! token's refresh token is cached before the new token is handed back, so
//! whoever sees the new cookie can refresh it in turn. A refresh that
//! completed moments ago is reused instead of hitting the provider again.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::provider::{Provider, idp_client};
use super::refresh_cache_key;
use crate::cache::TtlCache;
use crate::config::OidcSettings;
use crate::context::ClusterContext;
use crate::{Error, Result};

/// Tokens expiring within this margin are refreshed
pub const EXPIRY_MARGIN: Duration = Duration::from_secs(10);

/// How long a completed refresh is reused for concurrent callers
const RECENT_REFRESH_TTL: Duration = Duration::from_secs(30);

/// Serialized refresh-token grants
pub struct TokenRefresher {
    settings: OidcSettings,
    timeout: Duration,
    tokens: Arc<TtlCache<String>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    recent: TtlCache<String>,
}

impl TokenRefresher {
    /// Refresher reading and writing refresh tokens in `tokens`
    #[must_use]
    pub fn new(settings: OidcSettings, timeout: Duration, tokens: Arc<TtlCache<String>>) -> Self {
        Self {
            settings,
            timeout,
            tokens,
            locks: DashMap::new(),
            recent: TtlCache::new(Some(RECENT_REFRESH_TTL)),
        }
    }

    /// Exchange the cached refresh token of `token` for a new raw token
    ///
    /// Fails with [`Error::RefreshUnavailable`] when nothing is cached for
    /// `token`.
    pub async fn refresh(&self, ctx: &ClusterContext, token: &str) -> Result<String> {
        let evicted = self.recent.evict_expired();
        if evicted > 0 {
            debug!(count = evicted, "Dropped stale refresh results");
        }

        let key = format!("{}/{token}", ctx.name);
        let lock = Arc::clone(self.locks.entry(key.clone()).or_default().value());

        let result = {
            let _guard = lock.lock().await;
            self.refresh_locked(ctx, token, &key).await
        };

        drop(lock);
        self.locks.remove_if(&key, |_, l| Arc::strong_count(l) == 1);
        result
    }

    async fn refresh_locked(&self, ctx: &ClusterContext, token: &str, key: &str) -> Result<String> {
        if let Ok(new_token) = self.recent.get(key) {
            debug!(cluster = %ctx.name, "Reusing token from concurrent refresh");
            return Ok(new_token);
        }

        let refresh_token = self
            .tokens
            .get(&refresh_cache_key(token))
            .map_err(|_| Error::RefreshUnavailable)?;

        let cfg = ctx.oidc_config()?;
        let issuer = self
            .settings
            .issuer_url
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&cfg.issuer_url);
        let http = idp_client(cfg, self.settings.insecure_idp, self.timeout)?;
        let allow_mismatch = self
            .settings
            .validator_issuer_url
            .as_deref()
            .is_some_and(|s| !s.is_empty());

        let provider =
            Provider::discover(http, issuer, &cfg.client_id, &cfg.client_secret, allow_mismatch)
                .await?;
        let response = provider.refresh(&refresh_token).await?;

        let token_type = self.settings.token_type();
        let new_token = response
            .select(token_type)
            .ok_or_else(|| Error::TokenExchange(format!("No {token_type} field in oauth2 token.")))?
            .to_string();

        // Providers that do not rotate refresh tokens omit them from the response
        let next_refresh = response
            .refresh_token
            .filter(|t| !t.is_empty())
            .unwrap_or(refresh_token);
        self.tokens.set(refresh_cache_key(&new_token), next_refresh);
        self.recent.set(key, new_token.clone());

        info!(cluster = %ctx.name, "Refreshed OIDC token");
        Ok(new_token)
    }

    /// Number of refreshes currently holding or waiting on a lock
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.locks.len()
    }
}
