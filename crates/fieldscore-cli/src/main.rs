use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use fieldscore_store::Store;
use fieldscore_sync::{SyncConfig, SyncPipeline};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fieldscore")]
#[command(about = "FieldScore observation sync and challenge scoring")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull new and updated observations, reconcile deletions, and
    /// recompute scores.
    Sync,
    /// Recompute scores from already-synced data, without fetching.
    Score,
    /// Apply pending database migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let store = Arc::new(Store::connect(&config.database_url).await?);
            store.migrate().await?;
            let pipeline = SyncPipeline::new(config, store)?;

            let cancel = CancellationToken::new();
            let signal_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received, stopping after the current page");
                    signal_cancel.cancel();
                }
            });

            let summary = pipeline.run_once(&cancel).await?;
            println!(
                "sync complete: run_id={} pages={} upserted={} deleted={} entries={} watermark={}",
                summary.run_id,
                summary.pages_fetched,
                summary.upserted,
                summary.deleted,
                summary.entries_written,
                summary
                    .watermark
                    .map(|w| w.to_rfc3339())
                    .unwrap_or_else(|| "unchanged".to_string()),
            );
        }
        Commands::Score => {
            let store = Arc::new(Store::connect(&config.database_url).await?);
            store.migrate().await?;
            let pipeline = SyncPipeline::new(config, store)?;
            let summary = pipeline.score_only().await?;
            println!(
                "score complete: run_id={} entries={}",
                summary.run_id, summary.entries_written
            );
        }
        Commands::Migrate => {
            let store = Store::connect(&config.database_url).await?;
            store.migrate().await?;
            info!("migrations applied");
        }
    }

    Ok(())
}
