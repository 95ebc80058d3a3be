mod cache;
mod cluster;
mod config;
mod git;
mod health;
mod pool;
mod probe;
mod provision;
mod workspace;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::cache::registry::HttpImageRegistry;
use crate::cache::BuildCache;
use crate::cluster::api::RestClusterClient;
use crate::config::Config;
use crate::pool::PoolManager;
use crate::probe::ProcessProbe;
use crate::provision::ClusterWorkspaceProvisioner;

#[derive(Parser)]
#[command(
    name = "warmpool",
    about = "Warm workspace pool controller for cluster-hosted dev environments"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller daemon: hydrate pools and keep them reconciled.
    Serve {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Validate a configuration file without starting the daemon.
    Check {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Inspect or clear the image build cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// List cached build entries.
    List,
    /// Drop every cached build entry.
    Clear,
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load(&path),
        None => Ok(Config::default()),
    }
}

fn cluster_client(config: &Config) -> Result<Arc<RestClusterClient>> {
    Ok(Arc::new(
        RestClusterClient::from_config(&config.cluster)
            .context("building cluster client (is cluster.api_url set?)")?,
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config: config_path } => {
            let config = load_config(config_path)?;
            if config.cluster.api_url.is_some() {
                cluster_client(&config)?;
            } else {
                eprintln!("note: cluster.api_url is unset; 'serve' will refuse to start");
            }
            println!("configuration OK");
        }
        Commands::Cache { action, config: config_path } => {
            let config = load_config(config_path)?;
            let cluster = cluster_client(&config)?;
            let cache = BuildCache::new(
                cluster,
                Arc::new(HttpImageRegistry::new()?),
                config.cluster.system_namespace.clone(),
                &config.cache,
            );
            match action {
                CacheAction::List => {
                    let entries = cache.list().await;
                    if entries.is_empty() {
                        println!("image cache is empty");
                    } else {
                        println!("{:<18} {:<28} {}", "KEY", "CREATED", "IMAGE");
                        let mut entries: Vec<_> = entries.into_iter().collect();
                        entries.sort_by(|a, b| b.1.created.cmp(&a.1.created));
                        for (key, entry) in entries {
                            println!(
                                "{:<18} {:<28} {}",
                                key,
                                entry.created.format("%Y-%m-%d %H:%M:%S UTC"),
                                entry.image
                            );
                        }
                    }
                }
                CacheAction::Clear => {
                    cache.clear().await;
                    println!("image cache cleared");
                }
            }
        }
        Commands::Serve { config: config_path } => {
            let config = load_config(config_path)?;
            let cluster = cluster_client(&config)?;

            let provisioner = Arc::new(ClusterWorkspaceProvisioner::new(
                cluster.clone(),
                config.cluster.clone(),
            ));
            let probe = Arc::new(ProcessProbe::new(&config.probe)?);
            let manager = PoolManager::new(config.clone(), cluster, provisioner, probe);

            let loaded = manager
                .hydrate()
                .await
                .context("reloading persisted pools")?;
            tracing::info!(pools = loaded, "warmpool ready, monitoring pools");

            // Run until SIGINT or SIGTERM, then stop the monitors so no pass
            // is cut off mid-provisioning.
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .context("registering SIGTERM handler")?;
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received SIGINT, initiating shutdown");
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, initiating shutdown");
                }
            }

            manager.shutdown().await;
            tracing::info!("warmpool shut down");
        }
    }

    Ok(())
}
