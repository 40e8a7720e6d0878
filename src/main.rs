use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use nimbus::archive::R2LogArchive;
use nimbus::cleanup::Sweeper;
use nimbus::cloudflare::CloudflareWorkerApi;
use nimbus::config::Config;
use nimbus::db::{DbHandle, JobStore};
use nimbus::server::{ServerConfig, start_server};

#[derive(Parser)]
#[command(name = "nimbus")]
#[command(version, about = "Build-and-deploy orchestrator for AI-generated web applications")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the orchestrator HTTP server
    Serve {
        /// Port to serve on
        #[arg(short, long, default_value = "8787")]
        port: u16,

        /// Job database path
        #[arg(long, default_value = ".nimbus/jobs.db")]
        db_path: PathBuf,

        /// Dev mode: bind 0.0.0.0 instead of localhost
        #[arg(long)]
        dev: bool,

        /// Background sweep cadence in seconds (0 disables it)
        #[arg(long, default_value = "3600")]
        sweep_interval_secs: u64,
    },
    /// Run one cleanup sweep over expired jobs and exit
    Sweep {
        /// Job database path
        #[arg(long, default_value = ".nimbus/jobs.db")]
        db_path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            port,
            db_path,
            dev,
            sweep_interval_secs,
        } => {
            let config = Config::from_env()?;
            start_server(
                ServerConfig {
                    port,
                    db_path,
                    dev_mode: dev,
                    sweep_interval_secs,
                },
                config,
            )
            .await?;
        }
        Commands::Sweep { db_path } => {
            let config = Config::from_env()?;
            let store =
                DbHandle::new(JobStore::new(&db_path).context("Failed to open job store")?);
            let archive = Arc::new(R2LogArchive::new(
                config.cloudflare_account_id.clone(),
                config.cloudflare_api_token.clone(),
                config.r2_bucket.clone(),
            ));
            let workers = Arc::new(CloudflareWorkerApi::new(
                config.cloudflare_account_id,
                config.cloudflare_api_token,
            ));
            let stats = Sweeper::new(store, archive, workers).sweep().await?;
            println!(
                "Swept {} due jobs: {} expired, {} skipped",
                stats.scanned, stats.expired, stats.skipped
            );
        }
    }

    Ok(())
}
