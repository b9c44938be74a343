use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use newsdesk_sync::{build_scheduler, open_store, run_sync_once, IngestionPipeline, SyncConfig};
use newsdesk_web::{port_from_env, AppState};
use tracing::{error, info};
use tracing_subscriber::{fmt as tfmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "newsdesk-cli")]
#[command(about = "Newsdesk RSS aggregator command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass over every registered feed.
    Sync,
    /// Create the article schema.
    Migrate,
    /// Serve the HTTP API, with an initial pass and the hourly scheduler.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = run_sync_once(&config).await?;
            println!(
                "sync complete: run_id={} feeds={} failed_feeds={} added={} duplicates={} errors={}",
                summary.run_id,
                summary.feeds_total,
                summary.feeds_failed,
                summary.success_count,
                summary.duplicate_count,
                summary.error_count
            );
        }
        Commands::Migrate => {
            open_store(&config).await?;
            println!("schema ready at {}", config.database_url);
        }
        Commands::Serve { port } => {
            let store = open_store(&config).await?;
            let pipeline = Arc::new(IngestionPipeline::from_config(&config, store.clone()).await?);

            let initial = pipeline.clone();
            tokio::spawn(async move {
                initial.run().await;
            });

            let scheduler = build_scheduler(pipeline.clone(), &config).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.sync_cron, "feed scheduler started");
            }

            let port = port.unwrap_or_else(port_from_env);
            tokio::select! {
                res = newsdesk_web::serve(AppState::new(store).with_pipeline(pipeline), port) => {
                    if let Err(err) = &res {
                        error!(error = %err, "server stopped");
                    }
                    res?;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down");
                }
            }

            if let Some(mut sched) = scheduler {
                sched.shutdown().await.context("stopping scheduler")?;
            }
        }
    }

    Ok(())
}
