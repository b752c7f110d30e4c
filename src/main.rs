//! Cluster Gateway - authenticating reverse proxy for Kubernetes API servers

use std::process::ExitCode;

use clap::Parser;
use serde::Serialize;
use tracing::{error, info};

use cluster_gateway::{
    cli::{Cli, Command},
    config::Config,
    context::ContextStore,
    gateway::{Gateway, load_contexts},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            cli.apply(&mut config);
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::Contexts { ref format }) => list_contexts(&config, format),
        Some(Command::Serve) | None => run_server(config).await,
    }
}

#[derive(Serialize)]
struct ContextRow<'a> {
    name: &'a str,
    server: &'a str,
    source: &'static str,
    auth_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

/// Print the contexts the gateway would serve
fn list_contexts(config: &Config, format: &str) -> ExitCode {
    let store = ContextStore::new();
    load_contexts(config, &store);

    let mut contexts = store.list();
    contexts.sort_by(|a, b| a.name.cmp(&b.name));
    let rows: Vec<_> = contexts
        .iter()
        .map(|ctx| ContextRow {
            name: &ctx.name,
            server: &ctx.server,
            source: ctx.source.as_str(),
            auth_type: ctx.auth_type().to_string(),
            error: ctx.error.as_deref(),
        })
        .collect();

    if format == "json" {
        return match serde_json::to_string_pretty(&rows) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Failed to serialize to JSON: {e}");
                ExitCode::FAILURE
            }
        };
    }

    if rows.is_empty() {
        println!("No contexts found.");
        return ExitCode::SUCCESS;
    }
    println!("{:<30} {:<16} {:<14} SERVER", "NAME", "SOURCE", "AUTH");
    for row in &rows {
        match row.error {
            Some(err) => println!("{:<30} {:<16} {:<14} error: {err}", row.name, row.source, "-"),
            None => println!(
                "{:<30} {:<16} {:<14} {}",
                row.name, row.source, row.auth_type, row.server
            ),
        }
    }
    ExitCode::SUCCESS
}

/// Run the gateway server
async fn run_server(config: Config) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        dynamic_clusters = config.kubeconfig.enable_dynamic_clusters,
        in_cluster = config.in_cluster.enabled,
        "Starting Cluster Gateway"
    );

    let gateway = match Gateway::new(config) {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
