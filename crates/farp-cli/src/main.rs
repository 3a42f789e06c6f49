use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use farp_adapters::default_adapters;
use farp_store::{MemoryStore, PgStore, PortfolioStore, RecordStore};
use farp_sync::{build_cron_driver, SyncConfig, SyncService, SyncTrigger};
use farp_web::{AppState, StaticTokens};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "farp")]
#[command(about = "Faculty academic research portfolio service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the JSON API, plus the in-process sweep driver when enabled.
    Serve {
        #[arg(long, default_value_t = 8000, env = "FARP_WEB_PORT")]
        port: u16,
    },
    /// Run one due-user sweep and exit.
    Sweep,
    /// Run one manual sync pass for a single user and exit.
    Sync {
        #[arg(long)]
        user: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let store = build_store().await?;
    let service = Arc::new(SyncService::new(
        PortfolioStore::new(store),
        default_adapters(),
        config,
    )?);

    match cli.command.unwrap_or(Commands::Sweep) {
        Commands::Serve { port } => {
            if let Some(driver) = build_cron_driver(service.clone()).await? {
                driver.start().await.context("starting sweep driver")?;
                info!("in-process sweep driver started");
            }
            let tokens =
                StaticTokens::from_spec(&std::env::var("FARP_API_TOKENS").unwrap_or_default());
            info!(port, "serving JSON API");
            farp_web::serve(AppState::new(service, Arc::new(tokens)), port).await?;
        }
        Commands::Sweep => {
            let summary = service.sweep(Utc::now()).await?;
            println!(
                "sweep complete: due={} synced={} failed={}",
                summary.due, summary.synced, summary.failed
            );
        }
        Commands::Sync { user } => {
            let outcome = service.sync_user(&user, SyncTrigger::Manual, Utc::now()).await?;
            println!(
                "sync complete: user={} run_id={} records_written={} total_citations={}",
                outcome.user_id,
                outcome.run_id,
                outcome.records_written,
                outcome.snapshot.citations.total
            );
        }
    }

    Ok(())
}

async fn build_store() -> Result<Arc<dyn RecordStore>> {
    match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let store = PgStore::connect(&url)
                .await
                .context("connecting to postgres record store")?;
            store.ensure_schema().await.context("ensuring kv schema")?;
            info!("using postgres record store");
            Ok(Arc::new(store))
        }
        Err(_) => {
            warn!("DATABASE_URL not set; records will not survive restarts");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
