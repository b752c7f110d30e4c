//! Flow state: one entry per in-flight authorization-code exchange.
//!
//! The [`FlowStateStore`] trait abstracts over storage backends. The only
//! current implementation is [`InMemoryFlowStateStore`], backed by a
//! `DashMap` and swept by a background reaper. Entries are consumed exactly
//! once: [`FlowStateStore::take`] removes atomically, so of several callbacks
//! racing on the same state only one can win.

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use dashmap::DashMap;
use rand::RngExt;
use tracing::debug;

use super::provider::Provider;
use super::verifier::IdTokenVerifier;

/// Everything the callback needs to finish a login
#[derive(Debug, Clone)]
pub struct FlowState {
    /// Cluster the login belongs to
    pub cluster: String,
    /// Provider bound to the cluster's OAuth client
    pub provider: Arc<Provider>,
    /// Verifier captured when the redirect was issued
    pub verifier: IdTokenVerifier,
    /// Redirect URL sent in the authorization request
    pub redirect_url: String,
    /// PKCE code verifier, when PKCE is used
    pub code_verifier: Option<String>,
    /// Creation time
    pub created_at: Instant,
}

/// Storage for [`FlowState`] entries keyed by state token
#[async_trait::async_trait]
pub trait FlowStateStore: Send + Sync + 'static {
    /// Store `entry` under `state`
    async fn put(&self, state: String, entry: FlowState);

    /// Remove and return the live entry for `state`
    ///
    /// Returns `None` for unknown, expired or already-consumed states.
    async fn take(&self, state: &str) -> Option<FlowState>;

    /// Remove all expired entries. Called periodically by the reaper.
    async fn reap_expired(&self) -> usize;
}

/// In-memory flow-state store with a fixed entry lifetime
pub struct InMemoryFlowStateStore {
    entries: DashMap<String, FlowState>,
    ttl: Duration,
}

impl InMemoryFlowStateStore {
    /// Create an empty store whose entries live for `ttl`
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Number of stored entries, expired ones included until reaped
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_expired(&self, entry: &FlowState) -> bool {
        entry.created_at.elapsed() > self.ttl
    }
}

#[async_trait::async_trait]
impl FlowStateStore for InMemoryFlowStateStore {
    async fn put(&self, state: String, entry: FlowState) {
        self.entries.insert(state, entry);
    }

    async fn take(&self, state: &str) -> Option<FlowState> {
        let (_, entry) = self.entries.remove(state)?;
        if self.is_expired(&entry) {
            debug!(cluster = %entry.cluster, "Discarded expired OAuth state");
            return None;
        }
        Some(entry)
    }

    async fn reap_expired(&self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, e| e.created_at.elapsed() <= ttl);
        before.saturating_sub(self.entries.len())
    }
}

/// Generate a state token: 32 random bytes, URL-safe base64 without padding
#[must_use]
pub fn generate_state() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Spawn a background task that reaps abandoned flows every `interval`
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_reaper(
    store: Arc<dyn FlowStateStore>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = store.reap_expired().await;
                    if reaped > 0 {
                        debug!(count = reaped, "Reaped abandoned OAuth flows");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("OAuth state reaper shutting down");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::oidc::provider::ProviderMetadata;
    use crate::oidc::verifier::JwksCache;

    pub(crate) fn flow_state(cluster: &str) -> FlowState {
        let http = reqwest::Client::new();
        let metadata = ProviderMetadata {
            issuer: "https://idp".into(),
            authorization_endpoint: "https://idp/auth".into(),
            token_endpoint: "https://idp/token".into(),
            jwks_uri: "https://idp/jwks".into(),
            code_challenge_methods_supported: vec![],
        };
        FlowState {
            cluster: cluster.to_string(),
            provider: Arc::new(Provider::from_metadata(http.clone(), metadata, "cid", "")),
            verifier: IdTokenVerifier::new(
                "https://idp",
                "cid",
                "https://idp/jwks",
                Arc::new(JwksCache::new(http)),
            ),
            redirect_url: "http://localhost/oidc-callback".into(),
            code_verifier: None,
            created_at: Instant::now(),
        }
    }

    #[test]
    fn state_token_is_url_safe_and_unique() {
        let a = generate_state();
        let b = generate_state();
        assert_eq!(a.len(), 43);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn take_consumes_entry_once() {
        // GIVEN: a stored flow
        let store = InMemoryFlowStateStore::new(Duration::from_secs(60));
        store.put("s1".into(), flow_state("prod")).await;

        // WHEN: taken twice
        let first = store.take("s1").await;
        let second = store.take("s1").await;

        // THEN: only the first succeeds
        assert_eq!(first.unwrap().cluster, "prod");
        assert!(second.is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn unknown_state_is_none() {
        let store = InMemoryFlowStateStore::new(Duration::from_secs(60));
        assert!(store.take("never-issued").await.is_none());
    }

    #[tokio::test]
    async fn expired_entry_is_never_returned() {
        let store = InMemoryFlowStateStore::new(Duration::from_millis(10));
        store.put("s1".into(), flow_state("prod")).await;
        tokio::time::sleep(Duration::from_millis(25)).await;

        assert!(store.take("s1").await.is_none());
    }

    #[tokio::test]
    async fn reaper_pass_drops_abandoned_flows() {
        let store = InMemoryFlowStateStore::new(Duration::from_millis(10));
        store.put("old".into(), flow_state("a")).await;
        tokio::time::sleep(Duration::from_millis(25)).await;
        store.put("fresh".into(), flow_state("b")).await;

        assert_eq!(store.reap_expired().await, 1);
        assert_eq!(store.len(), 1);
        assert!(store.take("fresh").await.is_some());
    }

    #[tokio::test]
    async fn concurrent_takes_have_one_winner() {
        // GIVEN: one stored flow and many racing callbacks
        let store = Arc::new(InMemoryFlowStateStore::new(Duration::from_secs(60)));
        store.put("race".into(), flow_state("prod")).await;

        // WHEN: all take concurrently
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.take("race").await.is_some() })
            })
            .collect();
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }

        // THEN: exactly one succeeds
        assert_eq!(winners, 1);
    }
}
