//! ID-token verification: JWT signature validation against the provider JWKS.
//!
//! # Verification flow
//!
//! 1. Decode the JWT header (no verification) to extract `kid` and `alg`.
//! 2. Fetch the provider's JWKS (cached for 1 hour; refreshed on unknown `kid`).
//! 3. Verify the signature and `exp`/`nbf` with a 60 second leeway.
//! 4. Check `iss` against the expected issuer and `aud` against the client ID.
//! 5. Return the full claim set.
//!
//! A verifier is bound to one issuer and one audience when the `/oidc`
//! redirect is issued and travels with the flow state to the callback.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use jsonwebtoken::{
    Algorithm, DecodingKey, Header, TokenData, Validation,
    jwk::{AlgorithmParameters, JwkSet},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// ID-token verification failures
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// JWT decode / signature verification failed
    #[error("JWT verification failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// The JWT header contains no `kid` field and the JWKS has several keys
    #[error("JWT missing 'kid' field in header")]
    MissingKeyId,

    /// The `kid` in the JWT header is not in the provider's JWKS
    #[error("Unknown key ID: {0}")]
    UnknownKeyId(String),

    /// Network or HTTP error while fetching JWKS
    #[error("JWKS fetch error: {0}")]
    Fetch(#[from] reqwest::Error),

    /// `iss` does not match the expected issuer
    #[error("Issuer mismatch: expected {expected}, got {actual}")]
    IssuerMismatch {
        /// Expected issuer URL
        expected: String,
        /// Issuer found in the token
        actual: String,
    },

    /// `aud` does not contain the expected client ID
    #[error("expected audience {0:?} not found in token")]
    AudienceMismatch(String),
}

/// Claims of a verified ID token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdTokenClaims {
    /// Issuer
    pub iss: String,
    /// Subject
    #[serde(default)]
    pub sub: String,
    /// Audience (single string or array)
    #[serde(default)]
    pub aud: serde_json::Value,
    /// Expiry (Unix timestamp)
    #[serde(default)]
    pub exp: u64,
    /// Issued-at (Unix timestamp)
    #[serde(default)]
    pub iat: u64,
    /// Email
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Groups (custom claim)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<String>>,
    /// Every other claim
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// ── JWKS cache ──────────────────────────────────────────────────────────────

struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
}

/// JWKS cache, one entry per JWKS URI
pub struct JwksCache {
    inner: DashMap<String, CachedJwks>,
    http: reqwest::Client,
    ttl: Duration,
}

impl JwksCache {
    /// Cache fetching through `http` with a 1 hour TTL
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            inner: DashMap::new(),
            http,
            ttl: Duration::from_secs(3600),
        }
    }

    /// Cached JWKS for `jwks_uri`, fetched when stale or when `force_refresh`
    pub async fn get_or_fetch(
        &self,
        jwks_uri: &str,
        force_refresh: bool,
    ) -> Result<JwkSet, VerifyError> {
        if !force_refresh {
            if let Some(cached) = self.inner.get(jwks_uri) {
                if cached.fetched_at.elapsed() < self.ttl {
                    return Ok(cached.keys.clone());
                }
            }
        }

        debug!(jwks_uri = %jwks_uri, "Fetching JWKS");
        let jwks: JwkSet = self
            .http
            .get(jwks_uri)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        self.inner.insert(
            jwks_uri.to_string(),
            CachedJwks {
                keys: jwks.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(jwks)
    }
}

// ── Verifier ────────────────────────────────────────────────────────────────

/// Verifier bound to one issuer, audience and JWKS endpoint
#[derive(Clone)]
pub struct IdTokenVerifier {
    issuer: String,
    audience: String,
    jwks_uri: String,
    jwks: Arc<JwksCache>,
}

impl std::fmt::Debug for IdTokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdTokenVerifier")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("jwks_uri", &self.jwks_uri)
            .finish_non_exhaustive()
    }
}

impl IdTokenVerifier {
    /// Verifier expecting `iss == issuer` and `audience` in `aud`
    #[must_use]
    pub fn new(
        issuer: impl Into<String>,
        audience: impl Into<String>,
        jwks_uri: impl Into<String>,
        jwks: Arc<JwksCache>,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
            jwks_uri: jwks_uri.into(),
            jwks,
        }
    }

    /// Expected issuer
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Expected audience
    #[must_use]
    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Verify `token` and return its claims
    pub async fn verify(&self, token: &str) -> Result<IdTokenClaims, VerifyError> {
        let header = jsonwebtoken::decode_header(token)?;
        let decoding_key = self.find_decoding_key(header.kid.as_deref()).await?;

        let mut validation = build_validation(&header);
        // iss and aud are checked below to accept both aud forms and trailing-slash issuers
        validation.validate_aud = false;
        validation.required_spec_claims.clear();
        validation.required_spec_claims.insert("exp".to_string());

        let data: TokenData<IdTokenClaims> =
            jsonwebtoken::decode(token, &decoding_key, &validation)?;
        let claims = data.claims;

        if claims.iss.trim_end_matches('/') != self.issuer.trim_end_matches('/') {
            return Err(VerifyError::IssuerMismatch {
                expected: self.issuer.clone(),
                actual: claims.iss,
            });
        }
        check_audience(&claims.aud, &self.audience)?;

        Ok(claims)
    }

    /// Find a decoding key by `kid`, refreshing the JWKS once if it is unknown
    async fn find_decoding_key(&self, kid: Option<&str>) -> Result<DecodingKey, VerifyError> {
        let jwks = self.jwks.get_or_fetch(&self.jwks_uri, false).await?;
        if let Some(key) = find_key_in_jwks(&jwks, kid)? {
            return Ok(key);
        }

        debug!(kid = ?kid, "Key not found in cached JWKS, refreshing");
        let jwks = self.jwks.get_or_fetch(&self.jwks_uri, true).await?;
        find_key_in_jwks(&jwks, kid)?
            .ok_or_else(|| VerifyError::UnknownKeyId(kid.unwrap_or_default().to_string()))
    }
}

/// Find a JWK by `kid` and convert it to a [`DecodingKey`]
///
/// Without a `kid` the set must hold exactly one usable key.
fn find_key_in_jwks(jwks: &JwkSet, kid: Option<&str>) -> Result<Option<DecodingKey>, VerifyError> {
    let to_key = |jwk: &jsonwebtoken::jwk::Jwk| match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
        AlgorithmParameters::EllipticCurve(ec) => {
            DecodingKey::from_ec_components(&ec.x, &ec.y).ok()
        }
        AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => None,
    };

    match kid {
        Some(kid) => Ok(jwks
            .keys
            .iter()
            .find(|jwk| jwk.common.key_id.as_deref() == Some(kid))
            .and_then(to_key)),
        None => {
            let mut usable = jwks.keys.iter().filter_map(to_key);
            match (usable.next(), usable.next()) {
                (Some(key), None) => Ok(Some(key)),
                (None, _) => Ok(None),
                (Some(_), Some(_)) => Err(VerifyError::MissingKeyId),
            }
        }
    }
}

/// [`Validation`] for the header's algorithm
fn build_validation(header: &Header) -> Validation {
    let alg = match header.alg {
        Algorithm::RS256 => Algorithm::RS256,
        Algorithm::RS384 => Algorithm::RS384,
        Algorithm::RS512 => Algorithm::RS512,
        Algorithm::ES256 => Algorithm::ES256,
        Algorithm::ES384 => Algorithm::ES384,
        Algorithm::PS256 => Algorithm::PS256,
        Algorithm::PS384 => Algorithm::PS384,
        Algorithm::PS512 => Algorithm::PS512,
        other => {
            warn!(alg = ?other, "Unsupported ID token algorithm, defaulting to RS256");
            Algorithm::RS256
        }
    };

    let mut v = Validation::new(alg);
    v.leeway = 60;
    v
}

/// `aud` must equal `expected` or contain it
fn check_audience(aud_claim: &serde_json::Value, expected: &str) -> Result<(), VerifyError> {
    let matches = match aud_claim {
        serde_json::Value::String(s) => s == expected,
        serde_json::Value::Array(arr) => arr.iter().any(|v| v.as_str() == Some(expected)),
        _ => false,
    };

    if matches {
        Ok(())
    } else {
        Err(VerifyError::AudienceMismatch(expected.to_string()))
    }
}
