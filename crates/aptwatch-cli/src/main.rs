use std::sync::Arc;

use anyhow::{Context, Result};
use aptwatch_core::{format_capture_time, neighborhood_label, sort_newest_first};
use aptwatch_storage::{FileSnapshotStore, SnapshotStore};
use aptwatch_sync::{build_scheduler, ScanConfig, ScanPipeline, SearchRegistry};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "aptwatch")]
#[command(about = "Watch apartment searches and report newly posted listings")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one scan, merge it into the snapshot and notify on new listings.
    Scan {
        /// Search profile name; defaults to the first profile.
        #[arg(long)]
        search: Option<String>,
    },
    /// Serve the web UI.
    Serve,
    /// Scan every profile on the configured cron schedule until Ctrl-C.
    Schedule,
    /// Summarize the latest stored snapshot.
    Snapshot {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Markdown digest of recent notification reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("aptwatch=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Scan { search: None }) {
        Commands::Scan { search } => {
            let outcome = aptwatch_sync::run_scan_once_from_env(search.as_deref()).await?;
            let s = &outcome.summary;
            println!(
                "scan complete: run_id={} search={} scanned={} unique={} duplicates={} malformed={} cache={}->{} new={} saved={} notified={}",
                s.run_id,
                s.search,
                s.scanned,
                s.unique,
                s.duplicates,
                s.malformed,
                s.cache_before,
                s.cache_after,
                s.new_listings,
                s.saved_snapshot.as_deref().unwrap_or("-"),
                s.notified
            );
        }
        Commands::Serve => {
            aptwatch_web::serve_from_env().await?;
        }
        Commands::Schedule => {
            let config = ScanConfig::from_env();
            let registry = SearchRegistry::load(&config.searches_path)?;
            let pipeline = Arc::new(ScanPipeline::from_config(&config)?);
            let mut sched = build_scheduler(pipeline, &config.scan_cron, registry.searches).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.scan_cron, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Snapshot { limit } => {
            let config = ScanConfig::from_env();
            let store = FileSnapshotStore::new(config.data_dir.clone());
            let mut listings = store.load_latest().await?;
            let location = store
                .latest_path()
                .await?
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "none".to_string());
            println!("snapshot {location}: {} listings", listings.len());
            sort_newest_first(&mut listings);
            for listing in listings.iter().take(limit) {
                println!(
                    "  {} | {} | {} | {} | {}",
                    format_capture_time(listing),
                    listing.address,
                    neighborhood_label(&listing.zip),
                    listing.price,
                    listing.availability
                );
            }
        }
        Commands::Report { runs } => {
            let config = ScanConfig::from_env();
            print!("{}", aptwatch_sync::report_markdown(runs, &config.reports_dir)?);
        }
    }

    Ok(())
}
