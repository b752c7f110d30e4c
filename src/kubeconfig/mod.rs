//! Kubeconfig files
//!
//! A serde model of the kubeconfig YAML format, conversion into
//! [`ClusterContext`] values, and the persistence helpers used by the
//! dynamic-cluster API. Fields the gateway does not interpret are carried
//! through `other` so rewriting a file never loses data.

mod in_cluster;
pub(crate) mod persist;

pub use in_cluster::{SERVICE_ACCOUNT_DIR, in_cluster_context, in_cluster_context_from};
pub use persist::{
    check_unique_name, find_matching_context_name, remove_context, save, set_custom_name,
    write_merged,
};

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::context::{ClusterContext, ContextSource, Credentials, OidcConfig};
use crate::{Error, Result};

/// Name of the context extension carrying gateway metadata
pub const HEADLAMP_INFO_EXTENSION: &str = "headlamp_info";

/// Unmodelled keys, kept verbatim
type Extra = BTreeMap<String, serde_yaml::Value>;

/// A kubeconfig document
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Kubeconfig {
    #[serde(rename = "apiVersion", default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub clusters: Vec<NamedCluster>,
    #[serde(default)]
    pub users: Vec<NamedUser>,
    #[serde(default)]
    pub contexts: Vec<NamedContext>,
    #[serde(rename = "current-context", default, skip_serializing_if = "String::is_empty")]
    pub current_context: String,
    #[serde(flatten)]
    pub other: Extra,
}

/// Named `clusters` entry
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    #[serde(default)]
    pub cluster: Cluster,
}

/// Cluster connection settings
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Cluster {
    #[serde(default)]
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_authority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_authority_data: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub insecure_skip_tls_verify: bool,
    #[serde(flatten)]
    pub other: Extra,
}

/// Named `users` entry
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedUser {
    pub name: String,
    #[serde(default)]
    pub user: AuthInfo,
}

/// User credentials
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AuthInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(rename = "tokenFile", default, skip_serializing_if = "Option::is_none")]
    pub token_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_certificate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_certificate_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_provider: Option<AuthProvider>,
    #[serde(flatten)]
    pub other: Extra,
}

/// Legacy `auth-provider` block, used for OIDC
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthProvider {
    pub name: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

/// Named `contexts` entry
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedContext {
    pub name: String,
    #[serde(default)]
    pub context: Context,
}

/// Cluster/user pairing
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    #[serde(default)]
    pub cluster: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<NamedExtension>,
    #[serde(flatten)]
    pub other: Extra,
}

/// Named context extension
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedExtension {
    pub name: String,
    pub extension: serde_json::Value,
}

/// Payload of the `headlamp_info` extension
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomObject {
    #[serde(default)]
    pub custom_name: String,
}

impl Context {
    /// Custom display name stored in the `headlamp_info` extension
    #[must_use]
    pub fn custom_name(&self) -> Option<String> {
        self.extensions
            .iter()
            .find(|e| e.name == HEADLAMP_INFO_EXTENSION)
            .and_then(|e| serde_json::from_value::<CustomObject>(e.extension.clone()).ok())
            .map(|o| o.custom_name)
            .filter(|n| !n.is_empty())
    }
}

/// A context that could not be turned into a usable [`ClusterContext`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextLoadError {
    /// Context name inside the kubeconfig
    pub context: String,
    /// What went wrong
    pub error: String,
}

impl fmt::Display for ContextLoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "context {}: {}", self.context, self.error)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loading
// ─────────────────────────────────────────────────────────────────────────────

/// Parse a kubeconfig file
pub fn load_file(path: &Path) -> Result<Kubeconfig> {
    let bytes = std::fs::read(path)
        .map_err(|e| Error::Kubeconfig(format!("reading {}: {e}", path.display())))?;
    load_bytes(&bytes)
}

/// Parse kubeconfig YAML
pub fn load_bytes(bytes: &[u8]) -> Result<Kubeconfig> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Kubeconfig::default());
    }
    serde_yaml::from_slice(bytes).map_err(|e| Error::Kubeconfig(format!("loading kubeconfig: {e}")))
}

/// Parse a standard-base64 encoded kubeconfig
pub fn load_base64(encoded: &str) -> Result<Kubeconfig> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::Kubeconfig(format!("decoding kubeconfig: {e}")))?;
    load_bytes(&bytes)
}

/// Convert every context in `config` into a [`ClusterContext`]
///
/// `path` is the file the config came from; relative certificate and token
/// file references resolve against its directory. Contexts named in `skip`
/// are ignored.
pub fn to_contexts(
    config: &Kubeconfig,
    source: ContextSource,
    path: Option<&Path>,
    skip: &[String],
) -> (Vec<ClusterContext>, Vec<ContextLoadError>) {
    let mut contexts = Vec::new();
    let mut errors = Vec::new();

    for named in &config.contexts {
        if skip.iter().any(|s| s == &named.name) {
            continue;
        }
        match build_context(config, named, source, path) {
            Ok(ctx) => contexts.push(ctx),
            Err(error) => {
                warn!(context = %named.name, error = %error, "Skipping kubeconfig context");
                errors.push(ContextLoadError {
                    context: named.name.clone(),
                    error,
                });
            }
        }
    }

    (contexts, errors)
}

/// Load a kubeconfig file straight into contexts
pub fn load_contexts_from_file(
    path: &Path,
    source: ContextSource,
    skip: &[String],
) -> Result<(Vec<ClusterContext>, Vec<ContextLoadError>)> {
    let config = load_file(path)?;
    Ok(to_contexts(&config, source, Some(path), skip))
}

fn build_context(
    config: &Kubeconfig,
    named: &NamedContext,
    source: ContextSource,
    path: Option<&Path>,
) -> std::result::Result<ClusterContext, String> {
    let base_dir = path.and_then(Path::parent);

    let cluster = config
        .clusters
        .iter()
        .find(|c| c.name == named.context.cluster)
        .map(|c| &c.cluster)
        .ok_or_else(|| format!("cluster {:?} not found", named.context.cluster))?;

    let user = if named.context.user.is_empty() {
        None
    } else {
        Some(
            config
                .users
                .iter()
                .find(|u| u.name == named.context.user)
                .map(|u| &u.user)
                .ok_or_else(|| format!("user {:?} not found", named.context.user))?,
        )
    };

    if cluster.server.is_empty() {
        return Err("cluster has no server".to_string());
    }

    let ca_data = read_data_or_file(
        cluster.certificate_authority_data.as_deref(),
        cluster.certificate_authority.as_deref(),
        base_dir,
        "certificate-authority",
    )?;

    let mut ctx = ClusterContext::new(
        named.context.custom_name().unwrap_or_else(|| named.name.clone()),
        cluster.server.clone(),
        source,
    );
    ctx.original_name.clone_from(&named.name);
    ctx.ca_data = ca_data;
    ctx.insecure_skip_tls_verify = cluster.insecure_skip_tls_verify;
    ctx.namespace.clone_from(&named.context.namespace);
    ctx.extensions = named
        .context
        .extensions
        .iter()
        .map(|e| (e.name.clone(), e.extension.clone()))
        .collect();
    ctx.kubeconfig_path = path.map(Path::to_path_buf);
    ctx.cluster_id = match path {
        Some(p) => format!("{}+{}", p.display(), named.name),
        None => named.name.clone(),
    };

    if let Some(user) = user {
        ctx.credentials = credentials(user, base_dir)?;
        ctx.oidc = user
            .auth_provider
            .as_ref()
            .filter(|p| p.name == "oidc")
            .map(|p| oidc_from_provider(p, cluster.insecure_skip_tls_verify))
            .transpose()?;
    }

    Ok(ctx)
}

fn credentials(user: &AuthInfo, base_dir: Option<&Path>) -> std::result::Result<Credentials, String> {
    let token = match (&user.token, &user.token_file) {
        (Some(t), _) if !t.is_empty() => Some(t.clone()),
        (_, Some(file)) => {
            let p = resolve_path(file, base_dir);
            let raw = std::fs::read_to_string(&p)
                .map_err(|e| format!("reading tokenFile {}: {e}", p.display()))?;
            Some(raw.trim().to_string())
        }
        _ => None,
    };

    Ok(Credentials {
        token,
        client_cert: read_data_or_file(
            user.client_certificate_data.as_deref(),
            user.client_certificate.as_deref(),
            base_dir,
            "client-certificate",
        )?,
        client_key: read_data_or_file(
            user.client_key_data.as_deref(),
            user.client_key.as_deref(),
            base_dir,
            "client-key",
        )?,
    })
}

fn oidc_from_provider(
    provider: &AuthProvider,
    cluster_insecure: bool,
) -> std::result::Result<OidcConfig, String> {
    let get = |key: &str| provider.config.get(key).cloned().unwrap_or_default();

    let ca_cert = match provider.config.get("idp-certificate-authority-data") {
        Some(data) if !data.is_empty() => {
            let pem = STANDARD
                .decode(data.trim())
                .map_err(|e| format!("decoding idp-certificate-authority-data: {e}"))?;
            Some(String::from_utf8_lossy(&pem).into_owned())
        }
        _ => None,
    };

    Ok(OidcConfig {
        issuer_url: get("idp-issuer-url"),
        client_id: get("client-id"),
        client_secret: get("client-secret"),
        scopes: get("extra-scopes")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        skip_tls_verify: cluster_insecure,
        ca_cert,
        use_pkce: get("use-pkce") == "true",
    })
}

fn read_data_or_file(
    data: Option<&str>,
    file: Option<&str>,
    base_dir: Option<&Path>,
    field: &str,
) -> std::result::Result<Option<Vec<u8>>, String> {
    if let Some(data) = data.filter(|d| !d.is_empty()) {
        return STANDARD
            .decode(data.trim())
            .map(Some)
            .map_err(|e| format!("decoding {field}-data: {e}"));
    }
    if let Some(file) = file.filter(|f| !f.is_empty()) {
        let p = resolve_path(file, base_dir);
        return std::fs::read(&p)
            .map(Some)
            .map_err(|e| format!("reading {field} {}: {e}", p.display()));
    }
    Ok(None)
}

fn resolve_path(file: &str, base_dir: Option<&Path>) -> PathBuf {
    let p = PathBuf::from(file);
    match base_dir {
        Some(dir) if p.is_relative() => dir.join(p),
        _ => p,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::context::AuthType;

    pub(crate) const SAMPLE: &str = r"
apiVersion: v1
kind: Config
current-context: dev
clusters:
- name: dev-cluster
  cluster:
    server: https://dev.example.com:6443
    insecure-skip-tls-verify: true
- name: oidc-cluster
  cluster:
    server: https://oidc.example.com
users:
- name: dev-user
  user:
    token: static-token
- name: oidc-user
  user:
    auth-provider:
      name: oidc
      config:
        idp-issuer-url: https://idp.example.com
        client-id: headlamp
        client-secret: shh
        extra-scopes: groups, email
contexts:
- name: dev
  context:
    cluster: dev-cluster
    user: dev-user
    namespace: team-a
- name: oidc
  context:
    cluster: oidc-cluster
    user: oidc-user
    extensions:
    - name: headlamp_info
      extension:
        customName: corp
- name: broken
  context:
    cluster: missing
";

    #[test]
    fn parses_contexts_and_reports_broken_ones() {
        let config = load_bytes(SAMPLE.as_bytes()).unwrap();
        let (contexts, errors) = to_contexts(&config, ContextSource::KubeConfig, None, &[]);

        assert_eq!(contexts.len(), 2);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].context, "broken");
    }

    #[test]
    fn static_token_context() {
        let config = load_bytes(SAMPLE.as_bytes()).unwrap();
        let (contexts, _) = to_contexts(&config, ContextSource::KubeConfig, None, &[]);
        let dev = contexts.iter().find(|c| c.name == "dev").unwrap();

        assert_eq!(dev.auth_type(), AuthType::BearerToken);
        assert_eq!(dev.credentials.token.as_deref(), Some("static-token"));
        assert!(dev.insecure_skip_tls_verify);
        assert_eq!(dev.namespace.as_deref(), Some("team-a"));
    }

    #[test]
    fn oidc_context_uses_custom_name() {
        let config = load_bytes(SAMPLE.as_bytes()).unwrap();
        let (contexts, _) = to_contexts(&config, ContextSource::KubeConfig, None, &[]);
        let corp = contexts.iter().find(|c| c.name == "corp").unwrap();

        assert_eq!(corp.original_name, "oidc");
        assert_eq!(corp.auth_type(), AuthType::Oidc);
        let oidc = corp.oidc_config().unwrap();
        assert_eq!(oidc.issuer_url, "https://idp.example.com");
        assert_eq!(oidc.client_id, "headlamp");
        assert_eq!(oidc.scopes, vec!["groups", "email"]);
        assert!(corp.extensions.contains_key(HEADLAMP_INFO_EXTENSION));
    }

    #[test]
    fn skipped_contexts_are_ignored() {
        let config = load_bytes(SAMPLE.as_bytes()).unwrap();
        let (contexts, errors) =
            to_contexts(&config, ContextSource::KubeConfig, None, &["dev".to_string(), "broken".to_string()]);
        assert_eq!(contexts.len(), 1);
        assert!(errors.is_empty());
    }

    #[test]
    fn cluster_id_includes_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, SAMPLE).unwrap();

        let (contexts, _) = load_contexts_from_file(&path, ContextSource::KubeConfig, &[]).unwrap();
        let dev = contexts.iter().find(|c| c.name == "dev").unwrap();
        assert_eq!(dev.cluster_id, format!("{}+dev", path.display()));
        assert_eq!(dev.kubeconfig_path.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn base64_kubeconfig_round_trips_through_loader() {
        let encoded = STANDARD.encode(SAMPLE);
        let config = load_base64(&encoded).unwrap();
        assert_eq!(config.contexts.len(), 3);
        assert!(load_base64("%%% not base64").is_err());
    }

    #[test]
    fn bad_ca_data_is_a_context_error() {
        let yaml = r"
clusters:
- name: c
  cluster:
    server: https://c
    certificate-authority-data: '***'
contexts:
- name: c
  context:
    cluster: c
";
        let config = load_bytes(yaml.as_bytes()).unwrap();
        let (contexts, errors) = to_contexts(&config, ContextSource::DynamicCluster, None, &[]);
        assert!(contexts.is_empty());
        assert!(errors[0].error.contains("certificate-authority-data"));
    }

    #[test]
    fn token_file_resolves_relative_to_kubeconfig() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("token"), "from-file\n").unwrap();
        let path = dir.path().join("config");
        std::fs::write(
            &path,
            r"
clusters:
- name: c
  cluster:
    server: https://c
users:
- name: u
  user:
    tokenFile: token
contexts:
- name: c
  context:
    cluster: c
    user: u
",
        )
        .unwrap();

        let (contexts, _) = load_contexts_from_file(&path, ContextSource::KubeConfig, &[]).unwrap();
        assert_eq!(contexts[0].credentials.token.as_deref(), Some("from-file"));
    }

    #[test]
    fn unknown_fields_survive_a_rewrite() {
        let yaml = "preferences:\n  colors: true\nclusters: []\ncontexts: []\nusers: []\n";
        let config = load_bytes(yaml.as_bytes()).unwrap();
        let rendered = serde_yaml::to_string(&config).unwrap();
        assert!(rendered.contains("colors"));
    }

    #[test]
    fn empty_file_is_empty_config() {
        assert_eq!(load_bytes(b"  \n").unwrap(), Kubeconfig::default());
    }
}
