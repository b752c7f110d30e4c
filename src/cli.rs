//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Config;

/// Kubernetes cluster gateway - per-cluster proxy with OIDC login
#[derive(Parser, Debug)]
#[command(name = "cluster-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "CLUSTER_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "CLUSTER_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "CLUSTER_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Base URL path the gateway is served under
    #[arg(long, env = "CLUSTER_GATEWAY_BASE_URL")]
    pub base_url: Option<String>,

    /// Kubeconfig file to load at startup
    #[arg(long, env = "CLUSTER_GATEWAY_KUBECONFIG", global = true)]
    pub kubeconfig: Option<PathBuf>,

    /// Run inside a cluster using the pod's service account
    #[arg(long)]
    pub in_cluster: bool,

    /// Development mode (open CORS, redirect logins to localhost:3000)
    #[arg(long)]
    pub dev: bool,

    /// Disable adding, renaming and deleting clusters at runtime
    #[arg(long)]
    pub no_dynamic_clusters: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "CLUSTER_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "CLUSTER_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Load the configured kubeconfigs and list the resulting contexts
    Contexts {
        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },
}

impl Cli {
    /// Apply command-line overrides on top of the loaded configuration
    pub fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(ref host) = self.host {
            config.server.host.clone_from(host);
        }
        if let Some(ref base_url) = self.base_url {
            config.server.base_url.clone_from(base_url);
        }
        if let Some(ref path) = self.kubeconfig {
            config.kubeconfig.path = Some(path.clone());
        }
        if self.in_cluster {
            config.in_cluster.enabled = true;
        }
        if self.dev {
            config.server.dev_mode = true;
        }
        if self.no_dynamic_clusters {
            config.kubeconfig.enable_dynamic_clusters = false;
        }
    }
}
