//! HTTP router and shared state

use std::sync::Arc;

use axum::{
    Router,
    http::{HeaderName, Method, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{any, get, post},
};
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{AllowOrigin, CorsLayer},
    limit::RequestBodyLimitLayer,
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use super::{clusters, drain, oidc, proxy, refresh, tokens};
use crate::auth::BACKEND_TOKEN_HEADER;
use crate::cache::TtlCache;
use crate::config::Config;
use crate::context::ContextStore;
use crate::oidc::{FlowStateStore, OidcFlow, TokenRefresher};

/// Shared application state
pub struct AppState {
    /// Configuration
    pub config: Config,
    /// Known clusters
    pub store: Arc<ContextStore>,
    /// Refresh tokens and drain job statuses
    pub cache: Arc<TtlCache<String>>,
    /// OIDC login flow
    pub flow: OidcFlow,
    /// OIDC token refresh
    pub refresher: TokenRefresher,
    /// Resolved shared secret for dynamic-cluster mutations
    pub backend_token: Option<String>,
}

impl AppState {
    /// Wire the OIDC components over `store`, `cache` and `states`
    #[must_use]
    pub fn new(
        config: Config,
        store: Arc<ContextStore>,
        cache: Arc<TtlCache<String>>,
        states: Arc<dyn FlowStateStore>,
    ) -> Self {
        let timeout = config.server.request_timeout;
        let flow = OidcFlow::new(config.oidc.clone(), timeout, states, Arc::clone(&cache));
        let refresher = TokenRefresher::new(config.oidc.clone(), timeout, Arc::clone(&cache));
        let backend_token = config.resolve_backend_token();

        Self {
            config,
            store,
            cache,
            flow,
            refresher,
            backend_token,
        }
    }

    /// Base URL without surrounding slashes
    #[must_use]
    pub fn base_url(&self) -> &str {
        self.config.server.trimmed_base_url()
    }

    /// Whether the server terminates TLS itself
    #[must_use]
    pub fn tls_enabled(&self) -> bool {
        self.config.server.tls_cert.is_some() && self.config.server.tls_key.is_some()
    }

    /// Whether this process serves its own cluster
    #[must_use]
    pub fn in_cluster(&self) -> bool {
        self.config.in_cluster.enabled
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let server = &state.config.server;

    let mut management = Router::new()
        .route("/config", get(clusters::get_config))
        .route("/oidc", get(oidc::begin_login))
        .route("/oidc-callback", get(oidc::callback))
        .route("/auth/set-token", post(tokens::set_token_from_body))
        .route("/clusters/{cluster}/set-token", post(tokens::set_token))
        .route("/drain-node", post(drain::drain_node))
        .route("/drain-node-status", get(drain::drain_node_status));

    if state.config.kubeconfig.enable_dynamic_clusters {
        management = management
            .route("/parseKubeConfig", post(clusters::parse_kubeconfig))
            .route("/cluster", post(clusters::add_cluster))
            .route(
                "/cluster/{name}",
                axum::routing::delete(clusters::delete_cluster).put(clusters::rename_cluster),
            );
    }

    let management = management
        .layer(RequestBodyLimitLayer::new(server.max_body_size))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            server.request_timeout,
        ));

    // Watches and exec sessions are long-lived, so no timeout or body limit here
    let cluster_proxy = Router::new()
        .route("/clusters/{cluster}/{*api}", any(proxy::cluster_request))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            refresh::refresh_middleware,
        ));

    let api = Router::new()
        .route("/healthz", get(healthz))
        .merge(management)
        .merge(cluster_proxy);

    let base = state.base_url();
    let mut app = if base.is_empty() {
        api
    } else {
        Router::new().nest(&format!("/{base}"), api)
    };

    if server.dev_mode {
        app = app.layer(dev_cors());
    }

    app.layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Liveness probe
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Permissive CORS for the UI dev server
fn dev_cors() -> CorsLayer {
    let headers = [
        BACKEND_TOKEN_HEADER,
        "x-requested-with",
        "content-type",
        "authorization",
        "forward-to",
        "kubeconfig",
        "x-headlamp-user-id",
    ]
    .map(HeaderName::from_static);

    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::HEAD,
            Method::DELETE,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers(headers)
        .expose_headers([HeaderName::from_static(crate::auth::mismatch::MISMATCH_HEADER)])
}
