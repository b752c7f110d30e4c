//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::router::{AppState, create_router};
use crate::cache::{TtlCache, spawn_sweeper};
use crate::config::Config;
use crate::context::{ClusterContext, ContextSource, ContextStore};
use crate::kubeconfig::{in_cluster_context, load_contexts_from_file};
use crate::oidc::{FlowStateStore, InMemoryFlowStateStore, spawn_reaper};
use crate::{Error, Result};

/// Cluster gateway server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Known clusters
    store: Arc<ContextStore>,
}

impl Gateway {
    /// Create the gateway and load every configured context
    pub fn new(config: Config) -> Result<Self> {
        let store = Arc::new(ContextStore::new());
        load_contexts(&config, &store);
        Ok(Self { config, store })
    }

    /// The context store
    #[must_use]
    pub fn store(&self) -> &Arc<ContextStore> {
        &self.store
    }

    /// Run the gateway until a shutdown signal arrives
    pub async fn run(self) -> Result<()> {
        let server = &self.config.server;
        let addr = SocketAddr::new(
            server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            server.port,
        );

        let (shutdown_tx, _) = broadcast::channel(1);

        let cache = Arc::new(TtlCache::new(Some(self.config.cache.default_ttl)));
        let states: Arc<dyn FlowStateStore> =
            Arc::new(InMemoryFlowStateStore::new(self.config.oidc.state_ttl));
        let sweep = self.config.cache.sweep_interval;

        spawn_sweeper(Arc::clone(&cache), sweep, shutdown_tx.subscribe());
        spawn_reaper(Arc::clone(&states), sweep, shutdown_tx.subscribe());
        spawn_context_sweeper(Arc::clone(&self.store), sweep, shutdown_tx.subscribe());

        let state = Arc::new(AppState::new(
            self.config.clone(),
            Arc::clone(&self.store),
            cache,
            states,
        ));
        let tls = state.tls_enabled();
        let app = create_router(state);

        self.banner(tls);

        let shutdown_timeout = server.shutdown_timeout;
        match (&server.tls_cert, &server.tls_key) {
            (Some(cert), Some(key)) => {
                // Several crates link rustls; pick the provider explicitly.
                let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
                let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
                    .await
                    .map_err(|e| Error::Config(format!("loading TLS certificate: {e}")))?;

                let handle = axum_server::Handle::new();
                let graceful = handle.clone();
                let mut shutdown_rx = shutdown_tx.subscribe();
                tokio::spawn(async move {
                    let _ = shutdown_rx.recv().await;
                    graceful.graceful_shutdown(Some(shutdown_timeout));
                });
                tokio::spawn(shutdown_signal(shutdown_tx));

                axum_server::bind_rustls(addr, tls_config)
                    .handle(handle)
                    .serve(app.into_make_service())
                    .await?;
            }
            _ => {
                let listener = TcpListener::bind(addr).await?;
                let mut shutdown_rx = shutdown_tx.subscribe();
                let graceful = axum::serve(listener, app)
                    .with_graceful_shutdown(shutdown_signal(shutdown_tx));
                let mut serving = tokio::spawn(async move { graceful.await });

                tokio::select! {
                    result = &mut serving => {
                        return result.map_err(|e| Error::Internal(e.to_string()))?.map_err(Error::from);
                    }
                    _ = shutdown_rx.recv() => {}
                }

                match tokio::time::timeout(shutdown_timeout, serving).await {
                    Ok(result) => result.map_err(|e| Error::Internal(e.to_string()))??,
                    Err(_) => warn!(
                        timeout = ?shutdown_timeout,
                        "Open connections did not drain in time; closing them"
                    ),
                }
            }
        }

        info!("Gateway stopped");
        Ok(())
    }

    fn banner(&self, tls: bool) {
        let server = &self.config.server;
        let kubeconfig = &self.config.kubeconfig;
        let scheme = if tls { "https" } else { "http" };
        let base = server.trimmed_base_url();

        info!("============================================================");
        info!("CLUSTER GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %server.host, port = %server.port, "Listening on {scheme}://{}:{}/{base}", server.host, server.port);
        match kubeconfig.resolved_path() {
            Some(path) => info!(path = %path.display(), "Kubeconfig"),
            None => info!("No kubeconfig configured"),
        }
        if kubeconfig.enable_dynamic_clusters {
            info!("DYNAMIC CLUSTERS enabled");
            if self.config.resolve_backend_token().is_none() && !self.config.in_cluster.enabled {
                warn!("No backend token configured - every dynamic-cluster mutation will be denied");
            }
        }
        if self.config.in_cluster.enabled {
            info!(context = %self.config.in_cluster.context_name, "IN-CLUSTER mode");
        }
        if server.dev_mode {
            warn!("DEV MODE - CORS open to any origin");
        }
        info!(contexts = self.store.len(), "Contexts loaded");
        for ctx in self.store.list() {
            match &ctx.error {
                Some(err) => warn!("  {} (error: {err})", ctx.name),
                None => info!("  {} -> {}", ctx.name, ctx.server),
            }
        }
        info!("============================================================");
    }
}

/// Load the kubeconfig, the dynamic-cluster file and the in-cluster context
/// into `store`; returns the number of contexts added
///
/// Contexts that fail to load are registered as failed so `/config` lists
/// them with their error.
pub fn load_contexts(config: &Config, store: &ContextStore) -> usize {
    let before = store.len();
    let skipped = config.kubeconfig.skipped();

    let mut sources = Vec::new();
    if let Some(path) = config.kubeconfig.resolved_path() {
        sources.push((path, ContextSource::KubeConfig));
    }
    if config.kubeconfig.enable_dynamic_clusters {
        if let Some(path) = config.kubeconfig.resolved_dynamic_path() {
            sources.push((path, ContextSource::DynamicCluster));
        }
    }

    for (path, source) in sources {
        if !path.exists() {
            debug!(path = %path.display(), "Kubeconfig file not found, skipping");
            continue;
        }
        let (contexts, errors) = match load_contexts_from_file(&path, source, &skipped) {
            Ok(loaded) => loaded,
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to load kubeconfig");
                continue;
            }
        };
        for ctx in contexts {
            add_logged(store, ctx);
        }
        for failure in errors {
            add_logged(
                store,
                ClusterContext::failed(failure.context, source, failure.error),
            );
        }
    }

    if config.in_cluster.enabled {
        match in_cluster_context(&config.in_cluster, &config.oidc) {
            Ok(ctx) => add_logged(store, ctx),
            Err(e) => error!(error = %e, "Failed to set up in-cluster context"),
        }
    }

    store.len() - before
}

fn add_logged(store: &ContextStore, ctx: ClusterContext) {
    let name = ctx.name.clone();
    if let Err(e) = store.add(ctx) {
        warn!(cluster = %name, error = %e, "Skipping context");
    }
}

/// Drop expired header-supplied contexts every `interval` until shutdown
fn spawn_context_sweeper(
    store: Arc<ContextStore>,
    interval: std::time::Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    store.remove_expired();
                }
                _ = shutdown.recv() => break,
            }
        }
    });
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    const KUBECONFIG: &str = r"
apiVersion: v1
kind: Config
clusters:
- name: c1
  cluster:
    server: https://c1:6443
contexts:
- name: one
  context:
    cluster: c1
- name: skipped
  context:
    cluster: c1
- name: dangling
  context:
    cluster: nowhere
";

    #[test]
    fn load_contexts_registers_good_and_failed_contexts() {
        // GIVEN: a kubeconfig with a good, a skipped and a dangling context
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, KUBECONFIG).unwrap();

        let mut config = Config::default();
        config.kubeconfig.path = Some(path);
        config.kubeconfig.dynamic_path = Some(dir.path().join("dynamic"));
        config.kubeconfig.skipped_contexts = "skipped".to_string();

        // WHEN: contexts are loaded
        let store = ContextStore::new();
        let added = load_contexts(&config, &store);

        // THEN: the good one is usable, the dangling one is listed with its error
        assert_eq!(added, 2);
        assert!(store.get("one").unwrap().error.is_none());
        assert!(store.get("dangling").unwrap().error.is_some());
        assert!(store.get("skipped").is_err());
    }

    #[test]
    fn missing_kubeconfig_loads_nothing() {
        let mut config = Config::default();
        config.kubeconfig.path = Some("/nonexistent/kubeconfig".into());
        config.kubeconfig.dynamic_path = Some("/nonexistent/dynamic".into());
        let store = ContextStore::new();
        assert_eq!(load_contexts(&config, &store), 0);
    }
}
