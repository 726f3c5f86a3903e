//! nvdsync Ingest - NVD feed synchronization service

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nvdsync_common::logging::{init_logging, LogConfig, LogLevel};
use nvdsync_ingest::config::EngineConfig;
use nvdsync_ingest::store::open_store;
use nvdsync_ingest::{CycleOutcome, SyncEngine};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "nvdsync-ingest")]
#[command(author, version, about = "Incremental NVD feed synchronization")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Configuration file (TOML, JSON or YAML)
    #[arg(short, long, env = "NVDSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll every feed until interrupted
    Run,

    /// Check every feed once, import what changed, then exit
    Once,

    /// Print the resolved configuration
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("nvdsync-ingest")
        .build();

    // Environment variables take precedence
    let log_config = LogConfig::from_env_with(log_config)?;
    let _guard = init_logging(&log_config)?;

    let config = EngineConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    if let Command::Validate = cli.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let store = open_store(&config.store, config.request_timeout)
        .await
        .context("Failed to open document store")?;
    let engine = SyncEngine::new(config, store)?;

    match cli.command {
        Command::Run => {
            engine.start().await.context("Failed to start sync engine")?;
            tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
            engine.stop().await;
        },
        Command::Once => {
            let reports = engine.run_once().await?;
            let mut failed = 0usize;

            for report in reports {
                match report.outcome {
                    Ok(CycleOutcome::Unchanged { last_modified }) => {
                        info!(feed = %report.feed, last_modified = %last_modified, "Feed unchanged");
                    },
                    Ok(CycleOutcome::Synced { records, last_modified, .. }) => {
                        info!(feed = %report.feed, records, last_modified = %last_modified, "Feed imported");
                    },
                    Err(e) => {
                        failed += 1;
                        error!(feed = %report.feed, error = %e, "Feed sync failed");
                    },
                }
            }

            if let Some(stats) = engine.pipeline_stats().await {
                info!(succeeded = stats.succeeded, failed = stats.failed, "Write summary");
            }
            if failed > 0 {
                anyhow::bail!("{} feed(s) failed to sync", failed);
            }
        },
        Command::Validate => {},
    }

    Ok(())
}
