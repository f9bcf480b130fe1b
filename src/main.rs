use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use scanvault::config::IndexConfig;
use scanvault::models::cloud::MonitorEvent;
use scanvault::services::fs_feed::FsChangeFeed;
use scanvault::Services;

#[derive(Parser)]
#[command(name = "scanvault")]
#[command(about = "Full-text index for a folder of scanned documents")]
#[command(version)]
struct Cli {
    /// JSON config file (default: platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one reconciliation pass over the documents folder
    Reconcile,

    /// Search indexed documents
    Search {
        query: String,

        /// Maximum number of results
        #[arg(short, long)]
        limit: Option<usize>,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show index statistics
    Stats,

    /// Reconcile, then follow folder changes until Ctrl+C
    Watch,
}

fn load_config(path: Option<PathBuf>) -> Result<IndexConfig> {
    let Some(path) = path.or_else(IndexConfig::default_config_path) else {
        return Ok(IndexConfig::default());
    };
    IndexConfig::load(&path).with_context(|| format!("loading config {}", path.display()))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async move {
            match cli.command {
                Commands::Reconcile => cmd_reconcile(config).await,
                Commands::Search { query, limit, json } => {
                    if let Some(limit) = limit {
                        config.search_limit = limit;
                    }
                    cmd_search(config, &query, json)
                }
                Commands::Stats => cmd_stats(config),
                Commands::Watch => cmd_watch(config).await,
            }
        })
}

async fn cmd_reconcile(config: IndexConfig) -> Result<()> {
    let services = Services::open(config)?;
    let outcome = services.reconcile().await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

fn cmd_search(config: IndexConfig, query: &str, json: bool) -> Result<()> {
    let services = Services::open(config)?;
    let results = services.search(query)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }
    if results.is_empty() {
        println!("No matches for \"{query}\"");
        return Ok(());
    }
    for hit in &results {
        println!("{}  ({} pages)  {}", hit.title, hit.page_count, hit.path);
        if !hit.snippet.is_empty() {
            println!("    {}", hit.snippet);
        }
    }
    Ok(())
}

fn cmd_stats(config: IndexConfig) -> Result<()> {
    let services = Services::open(config)?;
    let stats = services.store.stats()?;
    println!("Documents:      {}", stats.documents);
    println!("Placeholders:   {}", stats.placeholders);
    println!("OCR complete:   {}", stats.ocr_completed);
    Ok(())
}

async fn cmd_watch(config: IndexConfig) -> Result<()> {
    let feed = Arc::new(FsChangeFeed::new(
        &config.documents_root,
        &config.document_extension,
    ));
    let services = Services::open(config)?;

    let outcome = services.reconcile().await?;
    tracing::info!(indexed = outcome.indexed, placeholders = outcome.placeholders_seeded, "initial pass done");

    let (observer_tx, mut observer_rx) = mpsc::unbounded_channel();
    let running = services.start_monitor(feed, Some(observer_tx));
    println!("Watching for changes. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("listening for Ctrl+C")?;
                break;
            }
            Some(event) = observer_rx.recv() => match event {
                MonitorEvent::DocumentsChanged => tracing::info!("document list changed"),
                MonitorEvent::DocumentsDownloaded(paths) => {
                    tracing::info!(count = paths.len(), "documents downloaded");
                }
            },
        }
    }

    services.reconciler.cancel();
    running.shutdown().await;
    Ok(())
}
