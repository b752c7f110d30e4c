//! Cluster contexts: the registry of known clusters and how to reach each one.

mod store;
mod transport;

pub use store::ContextStore;
pub use transport::{ClusterTransport, kube_client};

use std::path::PathBuf;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Where a context came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextSource {
    /// Boot-time kubeconfig file
    #[serde(rename = "kubeconfig")]
    KubeConfig,
    /// Added at runtime through the cluster API or request headers
    DynamicCluster,
    /// The cluster this process runs in
    #[serde(rename = "incluster")]
    InCluster,
}

impl ContextSource {
    /// Wire name used in `/config` metadata and rename requests
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::KubeConfig => "kubeconfig",
            Self::DynamicCluster => "dynamic_cluster",
            Self::InCluster => "incluster",
        }
    }
}

/// How requests to a cluster authenticate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthType {
    /// Anonymous, or credentials supplied entirely by the caller
    None,
    /// Static bearer token from the kubeconfig
    BearerToken,
    /// TLS client certificate
    ClientCert,
    /// OpenID Connect through the gateway's login flow
    Oidc,
}

impl std::fmt::Display for AuthType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::BearerToken => "bearer-token",
            Self::ClientCert => "client-cert",
            Self::Oidc => "oidc",
        })
    }
}

/// Per-cluster OIDC settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OidcConfig {
    /// Identity provider issuer URL
    pub issuer_url: String,
    /// OAuth client ID
    pub client_id: String,
    /// OAuth client secret (may be empty for public clients)
    pub client_secret: String,
    /// Scopes requested in addition to `openid`
    pub scopes: Vec<String>,
    /// Skip TLS verification towards the IdP
    pub skip_tls_verify: bool,
    /// CA certificate (PEM) for the IdP
    pub ca_cert: Option<String>,
    /// Use PKCE for this cluster
    pub use_pkce: bool,
}

/// Static credentials taken from a kubeconfig user entry
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Bearer token, used when the caller sends none
    pub token: Option<String>,
    /// Client certificate (PEM)
    pub client_cert: Option<Vec<u8>>,
    /// Client key (PEM)
    pub client_key: Option<Vec<u8>>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("client_cert", &self.client_cert.is_some())
            .field("client_key", &self.client_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// One known cluster
#[derive(Debug, Clone)]
pub struct ClusterContext {
    /// Display name; unique among non-internal contexts
    pub name: String,
    /// Context name inside the kubeconfig it was loaded from
    pub original_name: String,
    /// API server base URL
    pub server: String,
    /// Origin of the context
    pub source: ContextSource,
    /// OIDC settings when the cluster authenticates through OIDC
    pub oidc: Option<OidcConfig>,
    /// Static credentials
    pub credentials: Credentials,
    /// API server CA (PEM)
    pub ca_data: Option<Vec<u8>>,
    /// Skip TLS verification towards the API server
    pub insecure_skip_tls_verify: bool,
    /// Default namespace of the kubeconfig context
    pub namespace: Option<String>,
    /// Raw context extensions, echoed in `/config`
    pub extensions: serde_json::Map<String, serde_json::Value>,
    /// File the context was loaded from
    pub kubeconfig_path: Option<PathBuf>,
    /// Stable identifier: `{kubeconfig path}+{context name}`
    pub cluster_id: String,
    /// Private to one user session; never listed
    pub internal: bool,
    /// Setup failure; such contexts are listed but not usable
    pub error: Option<String>,
    /// Expiry for internal contexts
    pub expires_at: Option<Instant>,
}

impl ClusterContext {
    /// Minimal usable context
    #[must_use]
    pub fn new(name: impl Into<String>, server: impl Into<String>, source: ContextSource) -> Self {
        let name = name.into();
        Self {
            original_name: name.clone(),
            cluster_id: name.clone(),
            name,
            server: server.into(),
            source,
            oidc: None,
            credentials: Credentials::default(),
            ca_data: None,
            insecure_skip_tls_verify: false,
            namespace: None,
            extensions: serde_json::Map::new(),
            kubeconfig_path: None,
            internal: false,
            error: None,
            expires_at: None,
        }
    }

    /// Context that failed setup; kept so listings can show the failure
    #[must_use]
    pub fn failed(name: impl Into<String>, source: ContextSource, error: impl Into<String>) -> Self {
        let mut ctx = Self::new(name, String::new(), source);
        ctx.error = Some(error.into());
        ctx
    }

    /// Authentication strategy derived from the configured credentials
    #[must_use]
    pub fn auth_type(&self) -> AuthType {
        if self.oidc.is_some() {
            AuthType::Oidc
        } else if self.credentials.token.is_some() {
            AuthType::BearerToken
        } else if self.credentials.client_cert.is_some() {
            AuthType::ClientCert
        } else {
            AuthType::None
        }
    }

    /// OIDC settings, or `OidcNotConfigured`
    pub fn oidc_config(&self) -> Result<&OidcConfig> {
        self.oidc
            .as_ref()
            .filter(|o| !o.issuer_url.is_empty())
            .ok_or_else(|| Error::OidcNotConfigured(self.name.clone()))
    }

    /// Whether an internal context has outlived its expiry
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|t| Instant::now() >= t)
    }
}
