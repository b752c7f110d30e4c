//! Per-cluster transports
//!
//! Each context gets one HTTP client carrying its CA, client identity and
//! TLS verification policy, plus a matching rustls config for WebSocket
//! upgrades. Transports are built lazily and pooled by [`super::ContextStore`].
//! Typed Kubernetes calls go through [`kube_client`] instead.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use kube::config::KubeConfigOptions;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::debug;

use super::ClusterContext;
use crate::kubeconfig::{self, Kubeconfig, NamedCluster, NamedContext, NamedUser};
use crate::{Error, Result};

/// Connect timeout towards API servers
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Ready-to-use connection material for one cluster
#[derive(Clone)]
pub struct ClusterTransport {
    /// HTTP client for plain API requests
    pub http: reqwest::Client,
    /// TLS config for WebSocket upgrades; `None` for `http://` servers
    pub websocket_tls: Option<Arc<rustls::ClientConfig>>,
}

impl std::fmt::Debug for ClusterTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterTransport")
            .field("websocket_tls", &self.websocket_tls.is_some())
            .finish_non_exhaustive()
    }
}

impl ClusterTransport {
    /// Build the transport for `ctx`
    pub fn build(ctx: &ClusterContext) -> Result<Self> {
        let http = build_http_client(ctx)?;
        let websocket_tls = if ctx.server.starts_with("https://") {
            Some(Arc::new(build_rustls_config(ctx)?))
        } else {
            None
        };

        debug!(
            cluster = %ctx.name,
            insecure = ctx.insecure_skip_tls_verify,
            client_cert = ctx.credentials.client_cert.is_some(),
            "Cluster transport built"
        );

        Ok(Self {
            http,
            websocket_tls,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP client
// ─────────────────────────────────────────────────────────────────────────────

fn build_http_client(ctx: &ClusterContext) -> Result<reqwest::Client> {
    // Bodies are relayed verbatim, so decompression stays off.
    let mut builder = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .tcp_nodelay(true)
        .pool_idle_timeout(Duration::from_secs(90))
        .redirect(reqwest::redirect::Policy::none())
        .no_gzip()
        .no_brotli()
        .no_deflate();

    if let Some(ca) = &ctx.ca_data {
        let cert = reqwest::Certificate::from_pem(ca)
            .map_err(|e| Error::ClusterSetup(format!("invalid certificate-authority-data: {e}")))?;
        builder = builder.add_root_certificate(cert);
    }

    if let (Some(cert), Some(key)) = (&ctx.credentials.client_cert, &ctx.credentials.client_key) {
        let mut pem = key.clone();
        pem.push(b'\n');
        pem.extend_from_slice(cert);
        let identity = reqwest::Identity::from_pem(&pem)
            .map_err(|e| Error::ClusterSetup(format!("invalid client certificate: {e}")))?;
        builder = builder.identity(identity);
    }

    if ctx.insecure_skip_tls_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder
        .build()
        .map_err(|e| Error::ClusterSetup(format!("failed to build client: {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Kubernetes client
// ─────────────────────────────────────────────────────────────────────────────

/// Kubernetes API client for `ctx`, presenting `token` when given
pub async fn kube_client(ctx: &ClusterContext, token: Option<&str>) -> Result<kube::Client> {
    // kube builds its TLS config from the process-wide provider
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let yaml = serde_yaml::to_string(&single_context_kubeconfig(ctx, token))?;
    let kubeconfig = kube::config::Kubeconfig::from_yaml(&yaml)
        .map_err(|e| Error::ClusterSetup(format!("kubeconfig for {}: {e}", ctx.name)))?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::ClusterSetup(format!("kubeconfig for {}: {e}", ctx.name)))?;

    kube::Client::try_from(config)
        .map_err(|e| Error::ClusterSetup(format!("failed to build client: {e}")))
}

/// Kubeconfig holding only `ctx`, as its current context
fn single_context_kubeconfig(ctx: &ClusterContext, token: Option<&str>) -> Kubeconfig {
    let name = ctx.original_name.clone();
    Kubeconfig {
        api_version: Some("v1".to_string()),
        kind: Some("Config".to_string()),
        clusters: vec![NamedCluster {
            name: name.clone(),
            cluster: kubeconfig::Cluster {
                server: ctx.server.clone(),
                certificate_authority_data: ctx.ca_data.as_ref().map(|pem| STANDARD.encode(pem)),
                insecure_skip_tls_verify: ctx.insecure_skip_tls_verify,
                ..Default::default()
            },
        }],
        users: vec![NamedUser {
            name: name.clone(),
            user: kubeconfig::AuthInfo {
                token: token.map(str::to_string),
                client_certificate_data: ctx.credentials.client_cert.as_ref().map(|pem| STANDARD.encode(pem)),
                client_key_data: ctx.credentials.client_key.as_ref().map(|pem| STANDARD.encode(pem)),
                ..Default::default()
            },
        }],
        contexts: vec![NamedContext {
            name: name.clone(),
            context: kubeconfig::Context {
                cluster: name.clone(),
                user: name.clone(),
                namespace: ctx.namespace.clone(),
                ..Default::default()
            },
        }],
        current_context: name,
        ..Default::default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// rustls config (WebSocket)
// ─────────────────────────────────────────────────────────────────────────────

fn build_rustls_config(ctx: &ClusterContext) -> Result<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::ClusterSetup(format!("TLS config error: {e}")))?;

    let builder = if ctx.insecure_skip_tls_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
    } else {
        builder.with_root_certificates(root_store(ctx.ca_data.as_deref())?)
    };

    let mut config = match (&ctx.credentials.client_cert, &ctx.credentials.client_key) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(parse_certs(cert)?, parse_key(key)?)
            .map_err(|e| Error::ClusterSetup(format!("invalid client certificate: {e}")))?,
        _ => builder.with_no_client_auth(),
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(config)
}

fn root_store(ca: Option<&[u8]>) -> Result<RootCertStore> {
    let Some(ca) = ca else {
        return Ok(RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        });
    };

    let mut store = RootCertStore::empty();
    for cert in parse_certs(ca)? {
        store
            .add(cert)
            .map_err(|e| Error::ClusterSetup(format!("Failed to add CA cert to trust store: {e}")))?;
    }
    Ok(store)
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::ClusterSetup(format!("Failed to parse certificates: {e}")))?;
    if certs.is_empty() {
        return Err(Error::ClusterSetup("No certificates found".to_string()));
    }
    Ok(certs)
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| Error::ClusterSetup(format!("Failed to parse private key: {e}")))?
        .ok_or_else(|| Error::ClusterSetup("No private key found".to_string()))
}

/// Verifier for `insecure-skip-tls-verify` clusters: any chain is accepted,
/// handshake signatures are still checked.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextSource;

    #[test]
    fn plain_http_server_has_no_websocket_tls() {
        let ctx = ClusterContext::new("dev", "http://127.0.0.1:8001", ContextSource::KubeConfig);
        let transport = ClusterTransport::build(&ctx).unwrap();
        assert!(transport.websocket_tls.is_none());
    }

    #[test]
    fn https_server_gets_websocket_tls() {
        let ctx = ClusterContext::new("prod", "https://k8s.example.com", ContextSource::KubeConfig);
        let transport = ClusterTransport::build(&ctx).unwrap();
        let tls = transport.websocket_tls.unwrap();
        assert_eq!(tls.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn single_context_kubeconfig_carries_credentials() {
        let mut ctx = ClusterContext::new("prod", "https://k8s.example.com", ContextSource::KubeConfig);
        ctx.ca_data = Some(b"-----BEGIN CERTIFICATE-----".to_vec());
        ctx.namespace = Some("apps".into());

        let config = single_context_kubeconfig(&ctx, Some("tok"));

        assert_eq!(config.current_context, "prod");
        assert_eq!(config.clusters[0].cluster.server, "https://k8s.example.com");
        assert_eq!(
            config.clusters[0].cluster.certificate_authority_data.as_deref(),
            Some(STANDARD.encode("-----BEGIN CERTIFICATE-----").as_str())
        );
        assert_eq!(config.users[0].user.token.as_deref(), Some("tok"));
        assert_eq!(config.contexts[0].context.namespace.as_deref(), Some("apps"));
    }

    #[tokio::test]
    async fn kube_client_builds_for_plain_http_server() {
        let ctx = ClusterContext::new("dev", "http://127.0.0.1:8001", ContextSource::KubeConfig);
        let client = kube_client(&ctx, None).await.unwrap();
        assert_eq!(client.default_namespace(), "default");
    }

    #[test]
    fn insecure_cluster_builds_without_ca() {
        let mut ctx = ClusterContext::new("lab", "https://10.0.0.1:6443", ContextSource::KubeConfig);
        ctx.insecure_skip_tls_verify = true;
        assert!(ClusterTransport::build(&ctx).is_ok());
    }

    #[test]
    fn garbage_ca_is_a_setup_error() {
        let mut ctx = ClusterContext::new("bad", "https://10.0.0.1:6443", ContextSource::KubeConfig);
        ctx.ca_data = Some(b"not a certificate".to_vec());
        let err = ClusterTransport::build(&ctx).unwrap_err();
        assert!(matches!(err, Error::ClusterSetup(_)));
    }
}
