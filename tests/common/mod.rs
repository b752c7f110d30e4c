//! Shared fixtures: a fake identity provider, a fake API server and a
//! gateway router wired over an in-memory store.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{
    Form, Json, Router,
    body::Body,
    extract::{Request, State, WebSocketUpgrade, ws::Message},
    http::{HeaderMap, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{self, post},
};
use futures::{SinkExt, StreamExt};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use cluster_gateway::cache::TtlCache;
use cluster_gateway::config::Config;
use cluster_gateway::context::{ClusterContext, ContextSource, ContextStore, OidcConfig};
use cluster_gateway::gateway::{AppState, create_router};
use cluster_gateway::oidc::{FlowStateStore, InMemoryFlowStateStore};

pub const CLIENT_ID: &str = "headlamp";
const KEY_ID: &str = "test-key";
const SIGNING_KEY: &[u8] = include_bytes!("../fixtures/idp_key.pem");
const MODULUS: &str = "j_dtk-2EltKJ37_VSapaM9R7BLpLErgrNFwDBH3sS6uXv0AQ3ucpeXAR3BN8Ep5w8Dl3IFe8TC8_svl0yi6mDlrQbR0LBHj2b9W3CknAzISXTs3FvNq3vq_O5Px-ogkG4kmXIgEhGiCvY_A68sr4vhfDXKNXoschXRb9xjhImUvmfEVdS0d5TxYg7WSP-jCYlkA6zEDob1esM0padGxBjZTBHLzbcjJ4pOUmRXeaUEvolNAmaDLz-1O6HhpnDZxeIYcV7Z3XBrqYsklJO9_2ayrHNvskcVtC8AlAtBhjf9geQpxE2kr-kXaAncKOFp_bTV-yblEtuISV384UOYbZYQ";

pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// Serve `app` on an ephemeral port and return its base URL
pub async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

// ─────────────────────────────────────────────────────────────────────────────
// Identity provider
// ─────────────────────────────────────────────────────────────────────────────

/// RS256 ID token signed with the fixture key
pub fn sign_id_token(issuer: &str, audience: &str, subject: &str, exp: u64, serial: usize) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(KEY_ID.to_string());
    let claims = json!({
        "iss": issuer,
        "aud": audience,
        "sub": subject,
        "exp": exp,
        "iat": now(),
        "email": format!("{subject}@example.com"),
        "serial": serial,
    });
    let key = EncodingKey::from_rsa_pem(SIGNING_KEY).unwrap();
    jsonwebtoken::encode(&header, &claims, &key).unwrap()
}

#[derive(Clone)]
struct IdpState {
    issuer: String,
    forms: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

/// Fake OpenID provider
pub struct FakeIdp {
    pub issuer: String,
    /// Every form posted to the token endpoint, in order
    pub token_forms: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

impl FakeIdp {
    pub fn token_requests(&self) -> usize {
        self.token_forms.lock().len()
    }

    pub fn last_form(&self) -> HashMap<String, String> {
        self.token_forms.lock().last().cloned().unwrap()
    }

    /// OIDC context for `name` pointing at this provider
    pub fn context(&self, name: &str, server: &str) -> ClusterContext {
        let mut ctx = ClusterContext::new(name, server, ContextSource::KubeConfig);
        ctx.oidc = Some(OidcConfig {
            issuer_url: self.issuer.clone(),
            client_id: CLIENT_ID.to_string(),
            scopes: vec!["email".to_string()],
            ..OidcConfig::default()
        });
        ctx
    }
}

/// Start a provider issuing `refresh-1` on login and not rotating it on
/// refresh; the code `bad-code` is rejected
pub async fn spawn_idp() -> FakeIdp {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let issuer = format!("http://{}", listener.local_addr().unwrap());
    let forms = Arc::new(Mutex::new(Vec::new()));

    let app = Router::new()
        .route("/.well-known/openid-configuration", routing::get(discovery))
        .route("/token", post(token))
        .route("/jwks", routing::get(jwks))
        .with_state(IdpState {
            issuer: issuer.clone(),
            forms: Arc::clone(&forms),
        });
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    FakeIdp {
        issuer,
        token_forms: forms,
    }
}

async fn discovery(State(idp): State<IdpState>) -> Json<Value> {
    Json(json!({
        "issuer": idp.issuer,
        "authorization_endpoint": format!("{}/auth", idp.issuer),
        "token_endpoint": format!("{}/token", idp.issuer),
        "jwks_uri": format!("{}/jwks", idp.issuer),
        "code_challenge_methods_supported": ["S256"],
    }))
}

async fn token(
    State(idp): State<IdpState>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let serial = {
        let mut forms = idp.forms.lock();
        forms.push(form.clone());
        forms.len()
    };

    match form.get("grant_type").map(String::as_str) {
        Some("authorization_code") if form.get("code").is_some_and(|c| c == "bad-code") => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid_grant" })),
        )
            .into_response(),
        Some("authorization_code") => Json(json!({
            "access_token": format!("access-{serial}"),
            "token_type": "Bearer",
            "expires_in": 3600,
            "refresh_token": "refresh-1",
            "id_token": sign_id_token(&idp.issuer, CLIENT_ID, "alice", now() + 3600, serial),
        }))
        .into_response(),
        Some("refresh_token") => Json(json!({
            "access_token": format!("access-{serial}"),
            "token_type": "Bearer",
            "expires_in": 3600,
            "id_token": sign_id_token(&idp.issuer, CLIENT_ID, "alice", now() + 7200, serial),
        }))
        .into_response(),
        _ => StatusCode::BAD_REQUEST.into_response(),
    }
}

async fn jwks() -> Json<Value> {
    Json(json!({
        "keys": [{
            "kty": "RSA",
            "kid": KEY_ID,
            "alg": "RS256",
            "use": "sig",
            "n": MODULUS,
            "e": "AQAB",
        }]
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// API server
// ─────────────────────────────────────────────────────────────────────────────

/// One request seen by the fake API server
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: String,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Request path without the query string
    pub fn path(&self) -> &str {
        self.uri.split('?').next().unwrap_or_default()
    }
}

type Log = Arc<Mutex<Vec<Recorded>>>;

/// Fake Kubernetes API server
pub struct FakeApiServer {
    pub url: String,
    pub requests: Log,
}

impl FakeApiServer {
    pub fn last(&self) -> Recorded {
        self.requests.lock().last().cloned().unwrap()
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().clone()
    }
}

/// Start an API server that records every request
///
/// Paths ending in `/forbidden` or `/unauthorized` answer 403 and 401.
/// `/api/v1/pods` lists one regular and one daemonset pod; node patches and
/// pod deletes echo the object back, and node `missing` answers a NotFound
/// status. `/ws` accepts
/// WebSocket upgrades, selects `v4.channel.k8s.io` and echoes text frames
/// prefixed with `echo:`. Everything else answers 200 with the path.
pub async fn spawn_api_server() -> FakeApiServer {
    let requests: Log = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/ws", routing::get(websocket))
        .fallback(api)
        .with_state(Arc::clone(&requests));
    let url = serve(app).await;
    FakeApiServer { url, requests }
}

async fn api(State(log): State<Log>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    let path = parts.uri.path().to_string();
    log.lock().push(Recorded {
        method: parts.method.to_string(),
        uri: parts.uri.to_string(),
        headers: parts.headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    });

    if path.ends_with("/forbidden") {
        return (StatusCode::FORBIDDEN, "forbidden").into_response();
    }
    if path.ends_with("/unauthorized") {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    if path == "/api/v1/pods" {
        return Json(json!({
            "apiVersion": "v1",
            "kind": "PodList",
            "metadata": {},
            "items": [
                {"apiVersion": "v1", "kind": "Pod",
                    "metadata": {"name": "web", "namespace": "default"}},
                {"apiVersion": "v1", "kind": "Pod",
                    "metadata": {"name": "node-agent", "namespace": "kube-system",
                        "labels": {"kubernetes.io/created-by": "daemonset-controller"}}}
            ]
        }))
        .into_response();
    }
    if path == "/api/v1/nodes/missing" {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({
                "kind": "Status",
                "apiVersion": "v1",
                "metadata": {},
                "status": "Failure",
                "message": "nodes \"missing\" not found",
                "reason": "NotFound",
                "code": 404
            })),
        )
            .into_response();
    }
    if let Some(node) = path.strip_prefix("/api/v1/nodes/").filter(|_| parts.method == Method::PATCH) {
        return Json(json!({
            "apiVersion": "v1",
            "kind": "Node",
            "metadata": {"name": node},
            "spec": {"unschedulable": true}
        }))
        .into_response();
    }
    if parts.method == Method::DELETE && path.contains("/pods/") {
        let (namespace, name) = path
            .trim_start_matches("/api/v1/namespaces/")
            .split_once("/pods/")
            .unwrap_or_default();
        return Json(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": name, "namespace": namespace}
        }))
        .into_response();
    }

    (
        [(header::CONTENT_TYPE, "application/json"), (header::ETAG, "\"v1\"")],
        Json(json!({ "path": path })).to_string(),
    )
        .into_response()
}

async fn websocket(State(log): State<Log>, ws: WebSocketUpgrade, req_headers: HeaderMap) -> Response {
    log.lock().push(Recorded {
        method: "GET".to_string(),
        uri: "/ws".to_string(),
        headers: req_headers,
        body: String::new(),
    });
    ws.protocols(["v4.channel.k8s.io"])
        .on_upgrade(|socket| async move {
            let (mut tx, mut rx) = socket.split();
            while let Some(Ok(msg)) = rx.next().await {
                if let Message::Text(text) = msg {
                    let reply = format!("echo:{}", text.as_str());
                    if tx.send(Message::Text(reply.into())).await.is_err() {
                        break;
                    }
                }
            }
        })
}

// ─────────────────────────────────────────────────────────────────────────────
// Gateway
// ─────────────────────────────────────────────────────────────────────────────

/// Router over a fresh store holding `contexts`
pub fn gateway(config: Config, contexts: Vec<ClusterContext>) -> (Router, Arc<AppState>) {
    let store = Arc::new(ContextStore::new());
    for ctx in contexts {
        store.add(ctx).unwrap();
    }
    let cache = Arc::new(TtlCache::new(Some(Duration::from_secs(3600))));
    let states: Arc<dyn FlowStateStore> =
        Arc::new(InMemoryFlowStateStore::new(Duration::from_secs(60)));
    let state = Arc::new(AppState::new(config, store, cache, states));
    (create_router(Arc::clone(&state)), state)
}

/// Config whose dynamic clusters persist below `dir`
pub fn config_in(dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.kubeconfig.path = Some(dir.join("kubeconfig"));
    config.kubeconfig.dynamic_path = Some(dir.join("dynamic").join("config"));
    config.backend_token = Some("backend-secret".to_string());
    config
}

pub async fn body_string(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(response: Response) -> Value {
    serde_json::from_str(&body_string(response).await).unwrap()
}

pub fn get(uri: &str) -> axum::http::Request<Body> {
    axum::http::Request::get(uri).body(Body::empty()).unwrap()
}
