//! Context for the cluster this process runs in

use std::path::Path;

use tracing::info;

use crate::config::{InClusterConfig, OidcSettings, resolve_secret};
use crate::context::{ClusterContext, ContextSource, OidcConfig};
use crate::{Error, Result};

/// Where Kubernetes mounts the pod's service-account credentials
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Build the in-cluster context from the pod environment
pub fn in_cluster_context(config: &InClusterConfig, oidc: &OidcSettings) -> Result<ClusterContext> {
    let host = std::env::var("KUBERNETES_SERVICE_HOST")
        .map_err(|_| Error::Config("KUBERNETES_SERVICE_HOST is not set".to_string()))?;
    let port = std::env::var("KUBERNETES_SERVICE_PORT")
        .map_err(|_| Error::Config("KUBERNETES_SERVICE_PORT is not set".to_string()))?;
    in_cluster_context_from(&host, &port, Path::new(SERVICE_ACCOUNT_DIR), config, oidc)
}

/// Build the in-cluster context from explicit service coordinates
pub fn in_cluster_context_from(
    host: &str,
    port: &str,
    sa_dir: &Path,
    config: &InClusterConfig,
    oidc: &OidcSettings,
) -> Result<ClusterContext> {
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    };
    let server = format!("https://{host}:{port}");

    let token = std::fs::read_to_string(sa_dir.join("token"))
        .map_err(|e| Error::Config(format!("reading service account token: {e}")))?;
    let ca = std::fs::read(sa_dir.join("ca.crt"))
        .map_err(|e| Error::Config(format!("reading service account CA: {e}")))?;

    let mut ctx = ClusterContext::new(config.context_name.clone(), server, ContextSource::InCluster);
    ctx.credentials.token = Some(token.trim().to_string());
    ctx.ca_data = Some(ca);
    ctx.oidc = settings_oidc(oidc);

    info!(
        cluster = %ctx.name,
        server = %ctx.server,
        oidc = ctx.oidc.is_some(),
        "In-cluster context created"
    );
    Ok(ctx)
}

/// Gateway-level OIDC settings, when both issuer and client ID are set
fn settings_oidc(oidc: &OidcSettings) -> Option<OidcConfig> {
    let issuer_url = oidc.issuer_url.clone().filter(|s| !s.is_empty())?;
    let client_id = oidc.client_id.clone().filter(|s| !s.is_empty())?;
    Some(OidcConfig {
        issuer_url,
        client_id,
        client_secret: oidc
            .client_secret
            .as_deref()
            .and_then(resolve_secret)
            .unwrap_or_default(),
        scopes: oidc.scopes.clone(),
        skip_tls_verify: oidc.skip_tls_verify,
        ca_cert: oidc.ca_cert.clone(),
        use_pkce: oidc.use_pkce,
    })
}
