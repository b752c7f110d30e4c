//! Configuration management

use std::{env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable holding the shared secret for dynamic-cluster mutations
pub const BACKEND_TOKEN_ENV: &str = "HEADLAMP_BACKEND_TOKEN";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before secrets are resolved.
    /// Paths support ~ expansion; later files override earlier ones.
    pub env_files: Vec<String>,
    /// HTTP listener configuration
    pub server: ServerConfig,
    /// Kubeconfig sources
    pub kubeconfig: KubeconfigConfig,
    /// In-cluster mode
    pub in_cluster: InClusterConfig,
    /// OIDC settings shared by all clusters
    pub oidc: OidcSettings,
    /// TTL cache settings
    pub cache: CacheConfig,
    /// Shared secret for dynamic-cluster mutations.
    /// Supports a literal value or `env:VAR_NAME`; defaults to `env:HEADLAMP_BACKEND_TOKEN`.
    pub backend_token: Option<String>,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Path prefix all routes are served under (e.g. `/headlamp`)
    pub base_url: String,
    /// Timeout for non-streaming requests to identity providers
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body size for gateway-handled JSON endpoints (bytes)
    pub max_body_size: usize,
    /// Development mode: permissive CORS and frontend dev-server redirects
    pub dev_mode: bool,
    /// TLS certificate (PEM) to serve HTTPS with
    pub tls_cert: Option<PathBuf>,
    /// TLS private key (PEM) matching `tls_cert`
    pub tls_key: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4466,
            base_url: String::new(),
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024, // 10MB
            dev_mode: false,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl ServerConfig {
    /// Base URL without surrounding slashes (`""` when unset)
    #[must_use]
    pub fn trimmed_base_url(&self) -> &str {
        self.base_url.trim_matches('/')
    }
}

/// Kubeconfig sources
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KubeconfigConfig {
    /// Boot-time kubeconfig (defaults to `$KUBECONFIG` or `~/.kube/config`)
    pub path: Option<PathBuf>,
    /// File dynamic clusters and custom names are persisted into
    pub dynamic_path: Option<PathBuf>,
    /// Comma separated context names to ignore
    pub skipped_contexts: String,
    /// Enable the dynamic-cluster API
    pub enable_dynamic_clusters: bool,
}

impl Default for KubeconfigConfig {
    fn default() -> Self {
        Self {
            path: None,
            dynamic_path: None,
            skipped_contexts: String::new(),
            enable_dynamic_clusters: true,
        }
    }
}

impl KubeconfigConfig {
    /// Resolve the boot-time kubeconfig path
    #[must_use]
    pub fn resolved_path(&self) -> Option<PathBuf> {
        if let Some(ref p) = self.path {
            return Some(p.clone());
        }
        if let Ok(from_env) = env::var("KUBECONFIG") {
            if let Some(first) = env::split_paths(&from_env).next() {
                return Some(first);
            }
        }
        dirs::home_dir().map(|h| h.join(".kube").join("config"))
    }

    /// Resolve the dynamic-cluster persistence file
    #[must_use]
    pub fn resolved_dynamic_path(&self) -> Option<PathBuf> {
        if let Some(ref p) = self.dynamic_path {
            return Some(p.clone());
        }
        dirs::config_dir().map(|d| d.join("Headlamp").join("kubeconfigs").join("config"))
    }

    /// Context names listed in `skipped_contexts`
    #[must_use]
    pub fn skipped(&self) -> Vec<String> {
        self.skipped_contexts
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }
}

/// In-cluster mode
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InClusterConfig {
    /// Register the cluster this process runs in
    pub enabled: bool,
    /// Name of the in-cluster context
    pub context_name: String,
}

impl Default for InClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            context_name: "main".to_string(),
        }
    }
}

/// OIDC settings shared by all clusters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OidcSettings {
    /// Issuer for the in-cluster context; also overrides the issuer used for refresh grants
    pub issuer_url: Option<String>,
    /// Client ID for the in-cluster context
    pub client_id: Option<String>,
    /// Client secret for the in-cluster context (supports `env:VAR`)
    pub client_secret: Option<String>,
    /// Extra scopes for the in-cluster context
    pub scopes: Vec<String>,
    /// Skip TLS verification towards the in-cluster context's IdP
    pub skip_tls_verify: bool,
    /// CA certificate (PEM) for the in-cluster context's IdP
    pub ca_cert: Option<String>,
    /// Fixed OAuth redirect URL; derived from the request when unset
    pub callback_url: Option<String>,
    /// Audience the ID token verifier expects instead of the client ID
    pub validator_client_id: Option<String>,
    /// Issuer the ID token verifier expects instead of the discovery URL
    pub validator_issuer_url: Option<String>,
    /// Trust the access token instead of the ID token
    pub use_access_token: bool,
    /// Use PKCE (S256) for the authorization code flow
    pub use_pkce: bool,
    /// Disable TLS verification towards every IdP
    pub insecure_idp: bool,
    /// How long an unanswered authorization redirect stays valid
    #[serde(with = "humantime_serde")]
    pub state_ttl: Duration,
    /// Replace 401/403 bodies with a structured mismatch diagnostic
    pub mismatch_diagnostic_body: bool,
}

impl Default for OidcSettings {
    fn default() -> Self {
        Self {
            issuer_url: None,
            client_id: None,
            client_secret: None,
            scopes: Vec::new(),
            skip_tls_verify: false,
            ca_cert: None,
            callback_url: None,
            validator_client_id: None,
            validator_issuer_url: None,
            use_access_token: false,
            use_pkce: false,
            insecure_idp: false,
            state_ttl: Duration::from_secs(600),
            mismatch_diagnostic_body: false,
        }
    }
}

impl OidcSettings {
    /// Name of the token field trusted from token responses
    #[must_use]
    pub fn token_type(&self) -> &'static str {
        if self.use_access_token {
            "access_token"
        } else {
            "id_token"
        }
    }
}

/// TTL cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL for cached refresh tokens
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
    /// How often expired cache entries, flow states and internal contexts are swept
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(24 * 3600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Load configuration from an optional YAML file plus environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("CLUSTER_GATEWAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars()?;
        config.validate()?;

        Ok(config)
    }

    /// Resolve the backend token secret (`None` means every mutation is denied)
    #[must_use]
    pub fn resolve_backend_token(&self) -> Option<String> {
        let raw = self
            .backend_token
            .clone()
            .unwrap_or_else(|| format!("env:{BACKEND_TOKEN_ENV}"));
        resolve_secret(&raw).filter(|t| !t.is_empty())
    }

    fn validate(&self) -> Result<()> {
        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            return Err(Error::Config(
                "server.tls_cert and server.tls_key must be set together".to_string(),
            ));
        }
        Ok(())
    }

    /// Load env files into the process environment.
    /// Files that don't exist are skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand `${VAR}` and `${VAR:-default}` in secret-bearing values
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        for value in [
            self.oidc.client_secret.as_mut(),
            self.oidc.client_id.as_mut(),
            self.oidc.issuer_url.as_mut(),
            self.oidc.callback_url.as_mut(),
            self.backend_token.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            *value = expand_string(&re, value);
        }
        Ok(())
    }
}

/// Resolve `env:VAR` indirection; literal values pass through
#[must_use]
pub fn resolve_secret(raw: &str) -> Option<String> {
    match raw.strip_prefix("env:") {
        Some(var_name) => env::var(var_name).ok(),
        None => Some(raw.to_string()),
    }
}

fn expand_string(re: &Regex, input: &str) -> String {
    re.replace_all(input, |caps: &regex::Captures<'_>| {
        let var = &caps[1];
        env::var(var)
            .ok()
            .or_else(|| caps.get(2).map(|m| m.as_str().to_string()))
            .unwrap_or_default()
    })
    .into_owned()
}
