//! Cluster Gateway Library
//!
//! Authenticating reverse proxy in front of one or more Kubernetes API
//! servers.
//!
//! # Features
//!
//! - **Context Store**: clusters from kubeconfig files, runtime additions and
//!   the in-cluster service account, addressable by name
//! - **Cluster Proxy**: `/clusters/{name}/...` forwarded to the API server with
//!   the right credential, including WebSocket upgrades
//! - **OIDC Login**: authorization-code flow per cluster, with optional PKCE
//! - **Token Refresh**: near-expiry cookies refreshed before forwarding
//! - **Mismatch Detection**: flags clusters that reject the gateway's OIDC
//!   tokens
//! - **Dynamic Clusters**: add, rename and delete clusters at runtime

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cache;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod kubeconfig;
pub mod oidc;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string()))?,
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string()))?,
    }

    Ok(())
}
