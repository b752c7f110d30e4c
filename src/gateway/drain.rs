//! Node drain jobs
//!
//! `POST /drain-node` answers immediately and runs the drain in the
//! background: cordon the node, then delete every pod on it except those
//! owned by a daemonset. The outcome is kept in the shared TTL cache under a
//! name-based job ID that `GET /drain-node-status` reads back.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::Api;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{AppState, error_response};
use crate::auth::request_token;
use crate::cache::TtlCache;
use crate::context::kube_client;
use crate::{Error, Result};

/// How long a drain outcome stays readable
pub const DRAIN_STATUS_TTL: Duration = Duration::from_secs(20 * 60);

const DAEMONSET_LABEL: &str = "kubernetes.io/created-by";
const DAEMONSET_CONTROLLER: &str = "daemonset-controller";

/// Job ID of the drain of `node` in `cluster`
#[must_use]
pub fn drain_job_id(node: &str, cluster: &str) -> String {
    Uuid::new_v5(&Uuid::nil(), format!("{node}{cluster}").as_bytes()).to_string()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct DrainRequest {
    #[serde(default)]
    cluster: String,
    #[serde(default)]
    node_name: String,
}

impl DrainRequest {
    fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            return Err(Error::BadRequest("nodeName not found".to_string()));
        }
        if self.cluster.is_empty() {
            return Err(Error::BadRequest("clusterName not found".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct Submitted<'a> {
    message: &'static str,
    cluster: &'a str,
}

/// `POST /drain-node`
pub(super) async fn drain_node(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: DrainRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return error_response(&Error::BadRequest(format!("decoding payload: {e}"))),
    };
    if let Err(e) = request.validate() {
        return error_response(&e);
    }

    let ctx = match state.store.get(&request.cluster) {
        Ok(ctx) => ctx,
        Err(e) => return error_response(&e),
    };
    let token = request_token(&headers, &request.cluster).or_else(|| ctx.credentials.token.clone());
    let client = match kube_client(&ctx, token.as_deref()).await {
        Ok(client) => client,
        Err(e) => return error_response(&e),
    };

    let job = DrainJob {
        client,
        node: request.node_name.clone(),
        cluster: request.cluster.clone(),
    };
    tokio::spawn(job.run(Arc::clone(&state.cache)));

    info!(cluster = %request.cluster, node = %request.node_name, "Drain node request submitted");
    Json(Submitted {
        message: "Drain node request submitted successfully",
        cluster: &request.cluster,
    })
    .into_response()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct StatusQuery {
    #[serde(default)]
    cluster: String,
    #[serde(default)]
    node_name: String,
}

/// `GET /drain-node-status?cluster&nodeName`
pub(super) async fn drain_node_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
) -> Response {
    if query.node_name.is_empty() {
        return (StatusCode::BAD_REQUEST, "nodeName is required").into_response();
    }
    if query.cluster.is_empty() {
        return (StatusCode::BAD_REQUEST, "clusterName is required").into_response();
    }

    match state.cache.get(&drain_job_id(&query.node_name, &query.cluster)) {
        Ok(status) => Json(json!({ "id": status, "cluster": query.cluster })).into_response(),
        Err(e) => {
            debug!(cluster = %query.cluster, node = %query.node_name, "No drain status recorded");
            error_response(&Error::from(e))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Job
// ─────────────────────────────────────────────────────────────────────────────

fn is_daemonset_pod(pod: &Pod) -> bool {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(DAEMONSET_LABEL))
        .is_some_and(|v| v == DAEMONSET_CONTROLLER)
}

struct DrainJob {
    client: kube::Client,
    node: String,
    cluster: String,
}

impl DrainJob {
    async fn run(self, statuses: Arc<TtlCache<String>>) {
        let key = drain_job_id(&self.node, &self.cluster);
        let status = match self.drain().await {
            Ok(evicted) => {
                info!(cluster = %self.cluster, node = %self.node, pods = evicted, "Node drained");
                "success".to_string()
            }
            Err(e) => {
                warn!(cluster = %self.cluster, node = %self.node, error = %e, "Node drain failed");
                format!("error: {e}")
            }
        };
        statuses.set_with_ttl(key, status, DRAIN_STATUS_TTL);
    }

    /// Cordon the node and delete its pods; returns the number of pods deleted
    async fn drain(&self) -> Result<usize> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        nodes
            .patch(
                &self.node,
                &PatchParams::default(),
                &Patch::Merge(json!({ "spec": { "unschedulable": true } })),
            )
            .await?;

        let pods: Api<Pod> = Api::all(self.client.clone());
        let on_node = pods
            .list(&ListParams::default().fields(&format!("spec.nodeName={}", self.node)))
            .await?;

        let delete = DeleteParams {
            grace_period_seconds: Some(0),
            ..DeleteParams::default()
        };
        let mut deleted = 0;
        for pod in on_node.items.iter().filter(|p| !is_daemonset_pod(p)) {
            let (Some(name), Some(namespace)) = (&pod.metadata.name, &pod.metadata.namespace) else {
                continue;
            };
            let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
            match api.delete(name, &delete).await {
                Ok(_) => deleted += 1,
                Err(e) => debug!(pod = %name, error = %e, "Pod delete failed"),
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_is_stable_per_node_and_cluster() {
        assert_eq!(drain_job_id("node-1", "dev"), drain_job_id("node-1", "dev"));
        assert_ne!(drain_job_id("node-1", "dev"), drain_job_id("node-1", "prod"));
        assert_eq!(
            drain_job_id("node-1", "dev"),
            Uuid::new_v5(&Uuid::nil(), b"node-1dev").to_string()
        );
    }

    #[test]
    fn validation_names_the_missing_field() {
        let request = DrainRequest {
            cluster: "dev".into(),
            ..DrainRequest::default()
        };
        assert_eq!(request.validate().unwrap_err().to_string(), "nodeName not found");

        let request = DrainRequest {
            node_name: "n".into(),
            ..DrainRequest::default()
        };
        assert_eq!(request.validate().unwrap_err().to_string(), "clusterName not found");
    }

    #[test]
    fn daemonset_pods_are_spared() {
        let pods: Vec<Pod> = serde_json::from_value(json!([
            {"apiVersion": "v1", "kind": "Pod",
                "metadata": {"name": "ds", "namespace": "kube-system",
                    "labels": {"kubernetes.io/created-by": "daemonset-controller"}}},
            {"apiVersion": "v1", "kind": "Pod",
                "metadata": {"name": "web", "namespace": "default"}}
        ]))
        .unwrap();

        let evicted: Vec<_> = pods
            .iter()
            .filter(|p| !is_daemonset_pod(p))
            .filter_map(|p| p.metadata.name.as_deref())
            .collect();
        assert_eq!(evicted, vec!["web"]);
    }
}
