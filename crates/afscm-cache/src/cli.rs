use crate::config::DaemonConfig;
use crate::dirlist::NoListing;
use crate::fcache::FileCache;
use crate::health::HealthReport;
use crate::notify::NullNotifier;
use crate::offline::{OfflineConnector, OfflineLocator};
use afscm_rpc::ConnectionCache;
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "afscmd")]
#[command(about = "AFS cache manager file-cache daemon", long_about = None)]
pub struct Cli {
    /// Log as JSON lines.
    #[arg(long)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the cache engine and run until interrupted.
    Run {
        #[arg(short, long, default_value = "/etc/afscm/afscmd.toml")]
        config: PathBuf,
    },
    /// Print what the persisted cache state holds.
    Status {
        #[arg(short, long, default_value = "/etc/afscm/afscmd.toml")]
        config: PathBuf,
    },
    /// Parse and validate a config file.
    CheckConfig {
        #[arg(short, long)]
        config: PathBuf,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Run { ref config } => run_daemon(config).await,
            Command::Status { ref config } => status(config, self.json),
            Command::CheckConfig { ref config } => {
                let config = DaemonConfig::from_file(config)?;
                println!("{}", serde_json::to_string_pretty(&config)?);
                Ok(())
            }
        }
    }
}

fn load(path: &Path) -> Result<DaemonConfig> {
    if path.exists() {
        DaemonConfig::from_file(path)
    } else {
        tracing::warn!("Config file not found, using defaults: {}", path.display());
        Ok(DaemonConfig::default())
    }
}

fn offline_cache(config: &DaemonConfig) -> Result<Arc<FileCache>> {
    let conns = ConnectionCache::new(config.rpc.clone(), Arc::new(OfflineConnector));
    let cache = FileCache::new(
        config.cache.clone(),
        conns,
        Arc::new(OfflineLocator),
        Arc::new(NoListing),
        Arc::new(NullNotifier),
    )?;
    cache.set_disconnected(true);
    Ok(cache)
}

async fn run_daemon(path: &Path) -> Result<()> {
    let config = load(path)?;
    let cache = offline_cache(&config)?;
    let recovered = cache.recover_state()?;
    tracing::info!(
        "afscmd running for cell {} with {} recovered entries",
        config.this_cell,
        recovered
    );

    let mut tasks = cache.start();
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            tracing::info!("interrupted, shutting down");
        }
        res = tasks.cleaner_exit() => {
            if let Err(e) = res {
                tracing::error!("fatal cache error: {}", e);
                std::process::abort();
            }
        }
    }
    tasks.stop().await?;
    cache.store_state()?;
    Ok(())
}

fn status(path: &Path, json: bool) -> Result<()> {
    let config = load(path)?;
    let cache = offline_cache(&config)?;
    cache.recover_state()?;
    let status = cache.status();
    let health = HealthReport::from_status(&status, &cache.connections().status());
    if json {
        let out = serde_json::json!({ "cache": status, "health": health });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        print!("{}", status);
        println!("health: {:?}", health.overall);
    }
    Ok(())
}
