//! Cluster listing and dynamic-cluster management

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use super::{AppState, error_response};
use crate::auth::check_backend_token;
use crate::context::{AuthType, ClusterContext, ContextSource};
use crate::kubeconfig::{self, Kubeconfig, NamedCluster, NamedContext, persist};
use crate::{Error, Result};

/// Body of `GET /config`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// Every known cluster, failed ones included
    pub clusters: Vec<ClusterInfo>,
    /// Whether `/cluster` mutations are routed
    pub is_dynamic_cluster_enabled: bool,
}

/// One cluster as shown to the UI
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInfo {
    /// Display name
    pub name: String,
    /// API server URL
    #[serde(skip_serializing_if = "String::is_empty")]
    pub server: String,
    /// How the gateway authenticates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_type: Option<AuthType>,
    /// Source, namespace and kubeconfig origin
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Setup error of a failed context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ClusterInfo {
    fn listed(ctx: &ClusterContext) -> Self {
        let kubeconfig = ctx
            .kubeconfig_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        Self {
            name: ctx.name.clone(),
            server: ctx.server.clone(),
            auth_type: Some(ctx.auth_type()),
            metadata: Some(json!({
                "source": ctx.source.as_str(),
                "namespace": ctx.namespace.clone().unwrap_or_default(),
                "extensions": ctx.extensions,
                "origin": { "kubeconfig": kubeconfig },
                "originalName": ctx.original_name,
                "clusterID": ctx.cluster_id,
            })),
            error: None,
        }
    }

    fn parsed(ctx: &ClusterContext) -> Self {
        Self {
            name: ctx.name.clone(),
            server: ctx.server.clone(),
            auth_type: Some(ctx.auth_type()),
            metadata: Some(json!({ "source": ContextSource::DynamicCluster.as_str() })),
            error: None,
        }
    }
}

/// Every listable cluster; failed contexts carry only name and error
fn client_config(state: &AppState) -> ClientConfig {
    let mut contexts = state.store.list();
    contexts.sort_by(|a, b| a.name.cmp(&b.name));

    let clusters = contexts
        .iter()
        .filter_map(|ctx| match &ctx.error {
            Some(error) => Some(ClusterInfo {
                name: ctx.name.clone(),
                server: String::new(),
                auth_type: None,
                metadata: None,
                error: Some(error.clone()),
            }),
            None if ctx.internal => None,
            None => Some(ClusterInfo::listed(ctx)),
        })
        .collect();

    ClientConfig {
        clusters,
        is_dynamic_cluster_enabled: state.config.kubeconfig.enable_dynamic_clusters,
    }
}

fn config_response(state: &AppState, status: StatusCode) -> Response {
    (status, Json(client_config(state))).into_response()
}

/// `GET /config`
pub(super) async fn get_config(State(state): State<Arc<AppState>>) -> Response {
    config_response(&state, StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct ParseRequest {
    #[serde(default)]
    kubeconfigs: Vec<String>,
}

/// `POST /parseKubeConfig`: list the clusters of base64 kubeconfigs without
/// registering them
pub(super) async fn parse_kubeconfig(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request: ParseRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return error_response(&Error::BadRequest(format!("decoding request: {e}"))),
    };

    let mut clusters = Vec::new();
    let mut errors = Vec::new();
    for encoded in &request.kubeconfigs {
        match kubeconfig::load_base64(encoded) {
            Ok(config) => {
                let (contexts, load_errors) =
                    kubeconfig::to_contexts(&config, ContextSource::DynamicCluster, None, &[]);
                clusters.extend(contexts.iter().map(ClusterInfo::parsed));
                errors.extend(load_errors.iter().map(ToString::to_string));
            }
            Err(e) => errors.push(e.to_string()),
        }
    }

    if !errors.is_empty() {
        warn!(errors = ?errors, "Setting up contexts from kubeconfig failed");
        return (StatusCode::BAD_REQUEST, errors.join("; ")).into_response();
    }

    Json(ClientConfig {
        clusters,
        is_dynamic_cluster_enabled: state.config.kubeconfig.enable_dynamic_clusters,
    })
    .into_response()
}

/// Body of `POST /cluster`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterRequest {
    /// Cluster name for a manual registration
    pub name: Option<String>,
    /// API server URL for a manual registration
    pub server: Option<String>,
    /// Skip verification of the server certificate
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
    /// Base64 PEM bundle of the cluster CA
    pub certificate_authority_data: Option<String>,
    /// Base64 kubeconfig; when present the other fields are ignored
    pub kubeconfig: Option<String>,
}

impl ClusterRequest {
    fn decode(body: &[u8]) -> Result<Self> {
        let request: Self = serde_json::from_slice(body)
            .map_err(|e| Error::BadRequest(format!("decoding cluster info: {e}")))?;
        if request.kubeconfig.is_none() && (request.name.is_none() || request.server.is_none()) {
            return Err(Error::BadRequest(
                "please provide a 'name' and 'server' fields at least".to_string(),
            ));
        }
        Ok(request)
    }

    /// Kubeconfig holding one cluster and a context of the same name
    fn manual_config(&self) -> Kubeconfig {
        let name = self.name.clone().unwrap_or_default();
        let mut config = Kubeconfig::default();
        config.clusters.push(NamedCluster {
            name: name.clone(),
            cluster: kubeconfig::Cluster {
                server: self.server.clone().unwrap_or_default(),
                certificate_authority_data: self.certificate_authority_data.clone(),
                insecure_skip_tls_verify: self.insecure_skip_tls_verify,
                ..Default::default()
            },
        });
        config.contexts.push(NamedContext {
            name: name.clone(),
            context: kubeconfig::Context {
                cluster: name,
                ..Default::default()
            },
        });
        config
    }
}

fn dynamic_path(state: &AppState) -> Result<PathBuf> {
    state
        .config
        .kubeconfig
        .resolved_dynamic_path()
        .ok_or_else(|| Error::Kubeconfig("no dynamic kubeconfig path configured".to_string()))
}

/// `POST /cluster`
pub(super) async fn add_cluster(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(e) =
        check_backend_token(&headers, state.backend_token.as_deref(), state.in_cluster())
    {
        return error_response(&e);
    }
    let request = match ClusterRequest::decode(&body) {
        Ok(request) => request,
        Err(e) => return error_response(&e),
    };

    let task_state = Arc::clone(&state);
    match blocking(move || register_dynamic(&task_state, &request)).await {
        Ok(added) => {
            info!(contexts = added, "Dynamic cluster added");
            config_response(&state, StatusCode::CREATED)
        }
        Err(e) => error_response(&e),
    }
}

/// Register the clusters of a `POST /cluster` request
///
/// Uploaded kubeconfigs are merged into the dynamic kubeconfig file, but
/// only after every context name has cleared the store's collision check.
fn register_dynamic(state: &AppState, request: &ClusterRequest) -> Result<usize> {
    let (config, path) = match &request.kubeconfig {
        Some(encoded) => match kubeconfig::load_base64(encoded) {
            Ok(config) => (config, dynamic_path(state).ok()),
            Err(e) => {
                warn!(error = %e, "No contexts found in kubeconfig");
                return Err(Error::BadRequest("getting contexts from kubeconfig".to_string()));
            }
        },
        None => (request.manual_config(), None),
    };

    let (contexts, load_errors) =
        kubeconfig::to_contexts(&config, ContextSource::DynamicCluster, path.as_deref(), &[]);
    if contexts.is_empty() {
        warn!(errors = ?load_errors, "No contexts found in kubeconfig");
        return Err(Error::BadRequest("getting contexts from kubeconfig".to_string()));
    }

    let persisted = request.kubeconfig.is_some() && load_errors.is_empty();
    let added = contexts.len();
    let result = state.store.add_all(contexts, |_| {
        if persisted {
            persist::write_merged(&config, &dynamic_path(state)?)?;
        }
        Ok(())
    });

    match result {
        Err(e @ Error::NameCollision(_)) => {
            warn!(error = %e, "Dynamic cluster name already in use");
            Err(e)
        }
        Err(e) => {
            warn!(error = %e, "Saving dynamic cluster failed");
            Err(setup_failed())
        }
        Ok(()) if !load_errors.is_empty() => {
            warn!(errors = ?load_errors, "Setting up contexts from kubeconfig failed");
            Err(setup_failed())
        }
        Ok(()) => Ok(added),
    }
}

fn setup_failed() -> Error {
    Error::BadRequest("setting up contexts from kubeconfig".to_string())
}

/// Run kubeconfig file work on the blocking pool
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Internal(format!("kubeconfig task failed: {e}")))?
}

/// Query of `DELETE /cluster/{name}`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteQuery {
    #[serde(default)]
    pub remove_kube_config: Option<String>,
    #[serde(default)]
    pub config_path: Option<String>,
    #[serde(default)]
    pub original_name: Option<String>,
    #[serde(rename = "clusterID", default)]
    pub cluster_id: Option<String>,
}

impl DeleteQuery {
    /// Context name to drop from the kubeconfig file
    fn config_name<'a>(&'a self, name: &'a str) -> &'a str {
        match (non_empty(&self.original_name), non_empty(&self.cluster_id)) {
            (Some(original), Some(_)) => original,
            _ => name,
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// `DELETE /cluster/{name}`
pub(super) async fn delete_cluster(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<DeleteQuery>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) =
        check_backend_token(&headers, state.backend_token.as_deref(), state.in_cluster())
    {
        return error_response(&e);
    }

    let removed = match state.store.remove(&name) {
        Ok(removed) => removed,
        Err(e) => return error_response(&e),
    };

    if query.remove_kube_config.as_deref() == Some("true") {
        let path = non_empty(&query.config_path)
            .map(PathBuf::from)
            .or_else(|| removed.kubeconfig_path.clone())
            .or_else(|| state.config.kubeconfig.resolved_dynamic_path());
        let config_name = query.config_name(&name);

        let result = path
            .ok_or_else(|| Error::Kubeconfig("no kubeconfig path to remove from".to_string()))
            .and_then(|p| persist::remove_context(config_name, &p));
        if let Err(e) = result {
            warn!(cluster = %name, error = %e, "Removing cluster from kubeconfig failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to remove cluster from kubeconfig: {e}"),
            )
                .into_response();
        }
    }

    info!(cluster = %name, "Cluster removed");
    config_response(&state, StatusCode::OK)
}

/// Body of `PUT /cluster/{name}`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameRequest {
    #[serde(default)]
    pub new_cluster_name: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub stateless: bool,
}

/// `PUT /cluster/{name}`
///
/// Stateless clusters are simply dropped so the UI re-registers them. For
/// persisted clusters the new name is written into the kubeconfig the
/// cluster came from before the store is updated.
pub(super) async fn rename_cluster(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(e) =
        check_backend_token(&headers, state.backend_token.as_deref(), state.in_cluster())
    {
        return error_response(&e);
    }
    let request: RenameRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return error_response(&Error::BadRequest(format!(
                "failed to decode request body: {e}"
            )));
        }
    };

    if request.stateless {
        return match state.store.remove(&name) {
            Ok(_) => config_response(&state, StatusCode::CREATED),
            Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        };
    }

    if request.new_cluster_name.is_empty() {
        return error_response(&Error::BadRequest("newClusterName is required".to_string()));
    }

    let task_state = Arc::clone(&state);
    match blocking(move || rename_persisted(&task_state, &name, &request)).await {
        Ok(()) => config_response(&state, StatusCode::CREATED),
        Err(e) => error_response(&e),
    }
}

fn rename_persisted(state: &AppState, name: &str, request: &RenameRequest) -> Result<()> {
    let paths = &state.config.kubeconfig;
    let path = if request.source == ContextSource::KubeConfig.as_str() {
        paths.resolved_path()
    } else {
        paths.resolved_dynamic_path()
    }
    .ok_or_else(|| Error::Kubeconfig("failed to get kubeconfig file".to_string()))?;

    let new_name = request.new_cluster_name.as_str();
    state.store.rename(name, new_name, |_| {
        let mut config = kubeconfig::load_file(&path)?;
        if !persist::check_unique_name(&config, new_name) {
            return Err(Error::NameCollision("custom name already in use".to_string()));
        }
        let context_name = persist::find_matching_context_name(&config, name);
        persist::set_custom_name(&mut config, &context_name, new_name, &path)
    })
}
