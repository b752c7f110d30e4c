//! Identity provider client
//!
//! Discovery (`/.well-known/openid-configuration`), the authorization-code
//! exchange and the refresh-token grant against one provider.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::context::OidcConfig;
use crate::{Error, Result};

/// The subset of OpenID provider metadata the gateway uses
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderMetadata {
    /// Issuer the provider advertises
    pub issuer: String,
    /// Authorization endpoint URL
    pub authorization_endpoint: String,
    /// Token endpoint URL
    pub token_endpoint: String,
    /// JWKS endpoint URL
    pub jwks_uri: String,
    /// Supported PKCE code challenge methods
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
}

/// Token endpoint response
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    /// OAuth access token
    pub access_token: String,
    /// Token type (usually `Bearer`)
    #[serde(default)]
    pub token_type: Option<String>,
    /// Lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Refresh token, when the provider issues one
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// OpenID identity token
    #[serde(default)]
    pub id_token: Option<String>,
}

impl TokenResponse {
    /// The raw token to trust: `id_token` or `access_token`
    #[must_use]
    pub fn select(&self, token_type: &str) -> Option<&str> {
        match token_type {
            "access_token" => Some(self.access_token.as_str()).filter(|t| !t.is_empty()),
            _ => self.id_token.as_deref().filter(|t| !t.is_empty()),
        }
    }
}

/// A discovered provider bound to one OAuth client
#[derive(Debug, Clone)]
pub struct Provider {
    http: Client,
    metadata: ProviderMetadata,
    client_id: String,
    client_secret: String,
}

impl Provider {
    /// Discover `issuer_url`
    ///
    /// Unless `allow_issuer_mismatch` is set, the advertised issuer must equal
    /// the URL discovery was performed against.
    pub async fn discover(
        http: Client,
        issuer_url: &str,
        client_id: &str,
        client_secret: &str,
        allow_issuer_mismatch: bool,
    ) -> Result<Self> {
        let url = discovery_url(issuer_url);
        debug!(url = %url, "Discovering OpenID provider");

        let response = http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("Provider discovery failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Internal(format!(
                "Provider discovery failed: HTTP {}",
                response.status()
            )));
        }

        let metadata: ProviderMetadata = response
            .json()
            .await
            .map_err(|e| Error::Internal(format!("Invalid provider metadata: {e}")))?;

        if !allow_issuer_mismatch
            && metadata.issuer.trim_end_matches('/') != issuer_url.trim_end_matches('/')
        {
            return Err(Error::Internal(format!(
                "oidc: issuer did not match the issuer returned by provider, expected {issuer_url:?} got {:?}",
                metadata.issuer
            )));
        }

        Ok(Self::from_metadata(http, metadata, client_id, client_secret))
    }

    /// Provider from already-known metadata
    #[must_use]
    pub fn from_metadata(
        http: Client,
        metadata: ProviderMetadata,
        client_id: &str,
        client_secret: &str,
    ) -> Self {
        Self {
            http,
            metadata,
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        }
    }

    /// Discovered metadata
    #[must_use]
    pub fn metadata(&self) -> &ProviderMetadata {
        &self.metadata
    }

    /// HTTP client used for this provider
    #[must_use]
    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Authorization redirect URL
    pub fn authorization_url(
        &self,
        redirect_url: &str,
        scopes: &[String],
        state: &str,
        code_challenge: Option<&str>,
    ) -> Result<String> {
        let mut url = Url::parse(&self.metadata.authorization_endpoint)
            .map_err(|e| Error::Internal(format!("Invalid auth endpoint: {e}")))?;

        {
            let mut params = url.query_pairs_mut();
            params.append_pair("client_id", &self.client_id);
            params.append_pair("redirect_uri", redirect_url);
            params.append_pair("response_type", "code");
            params.append_pair("scope", &scopes.join(" "));
            params.append_pair("state", state);
            if let Some(challenge) = code_challenge {
                params.append_pair("code_challenge", challenge);
                params.append_pair("code_challenge_method", "S256");
            }
        }

        Ok(url.to_string())
    }

    /// Exchange an authorization code for tokens
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_url: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenResponse> {
        let mut params = HashMap::new();
        params.insert("grant_type", "authorization_code");
        params.insert("code", code);
        params.insert("redirect_uri", redirect_url);
        if let Some(verifier) = code_verifier {
            params.insert("code_verifier", verifier);
        }
        self.token_request(params).await
    }

    /// Redeem a refresh token
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        let mut params = HashMap::new();
        params.insert("grant_type", "refresh_token");
        params.insert("refresh_token", refresh_token);
        self.token_request(params).await
    }

    async fn token_request(&self, mut params: HashMap<&str, &str>) -> Result<TokenResponse> {
        let mut request = self.http.post(&self.metadata.token_endpoint);
        if self.client_secret.is_empty() {
            params.insert("client_id", &self.client_id);
        } else {
            request = request.basic_auth(
                url::form_urlencoded::byte_serialize(self.client_id.as_bytes()).collect::<String>(),
                Some(
                    url::form_urlencoded::byte_serialize(self.client_secret.as_bytes())
                        .collect::<String>(),
                ),
            );
        }

        let response = request
            .form(&params)
            .send()
            .await
            .map_err(|e| Error::TokenExchange(format!("token request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::TokenExchange(format!(
                "oauth2: cannot fetch token: {status}\nResponse: {body}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| Error::TokenExchange(format!("invalid token response: {e}")))
    }
}

/// Discovery document URL for `issuer`
#[must_use]
pub fn discovery_url(issuer: &str) -> String {
    format!(
        "{}/.well-known/openid-configuration",
        issuer.trim_end_matches('/')
    )
}

/// HTTP client for talking to the IdP of `cfg`
pub fn idp_client(cfg: &OidcConfig, insecure_idp: bool, timeout: Duration) -> Result<Client> {
    let mut builder = Client::builder()
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::limited(5));

    if let Some(ca) = cfg.ca_cert.as_deref().filter(|c| !c.is_empty()) {
        let cert = reqwest::Certificate::from_pem(ca.as_bytes())
            .map_err(|e| Error::Config(format!("invalid IdP CA certificate: {e}")))?;
        builder = builder.add_root_certificate(cert);
    }
    if cfg.skip_tls_verify || insecure_idp {
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder
        .build()
        .map_err(|e| Error::Internal(format!("failed to build IdP client: {e}")))
}
