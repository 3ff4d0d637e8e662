use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use itlog_core::{summarize, ReportingWindow};
use itlog_storage::TicketStore;
use itlog_sync::SyncConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "itlog")]
#[command(about = "IT Log ticket reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every enabled source and reconcile into the ticket store.
    Sync,
    /// Serve the JSON API (and the scheduled sync when enabled).
    Serve,
    /// Create tickets from a JSON array file; existing tickets are left alone.
    Import { file: PathBuf },
    /// Delete every ticket.
    Clear {
        #[arg(long)]
        yes: bool,
    },
    /// Print the dashboard summary as JSON.
    Summary {
        #[arg(long, conflicts_with = "all")]
        year: Option<i32>,
        #[arg(long)]
        all: bool,
    },
    /// Create the tickets table if missing.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "itlog=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = itlog_sync::run_sync_once_from_env().await?;
            for source in &summary.sources {
                println!(
                    "{:<16} {:?} records={} inserted={} updated={} unchanged={} skipped={} failed={}",
                    source.source_id,
                    source.status,
                    source.records,
                    source.tally.inserted,
                    source.tally.updated,
                    source.tally.unchanged,
                    source.tally.skipped,
                    source.tally.failed,
                );
            }
            println!(
                "sync complete: run_id={} total_records={} finished_at={}",
                summary.run_id, summary.total_records, summary.finished_at
            );
        }
        Commands::Serve => {
            itlog_web::serve_from_env().await?;
        }
        Commands::Import { file } => {
            let records = itlog_adapters::read_json_records(&file)?;
            let store = config.open_store().await?;
            let report = itlog_sync::import_tickets(store.as_ref(), records).await;
            println!(
                "import complete: received={} created={} existing={} skipped={} failed={}",
                report.received, report.created, report.existing, report.skipped, report.failed
            );
        }
        Commands::Clear { yes } => {
            if !yes {
                bail!("refusing to delete every ticket without --yes");
            }
            let store = config.open_store().await?;
            let removed = itlog_sync::clear_all(store.as_ref()).await?;
            println!("cleared {removed} tickets");
        }
        Commands::Summary { year, all } => {
            let window = match (all, year) {
                (true, _) => ReportingWindow::AllTime,
                (false, Some(year)) => ReportingWindow::Year(year),
                (false, None) => ReportingWindow::current_year(),
            };
            let store = config.open_store().await?;
            let tickets = store.list().await?;
            let summary = summarize(&tickets, window);
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).context("rendering summary")?
            );
        }
        Commands::Migrate => {
            config.open_store().await?;
            println!("tickets schema ready at {}", config.database_url);
        }
    }

    Ok(())
}
