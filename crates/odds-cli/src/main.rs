use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use odds_core::merge_messages;
use odds_storage::MemoryEventStore;
use odds_sync::{load_messages, ImportConfig, ImportPipeline, ImportSummary};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "odds-cli")]
#[command(about = "Merge sporting event odds updates and persist them")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Merge the batch and upsert it into the database (default).
    Import(ImportArgs),
    /// Create the events and odds tables if they are missing.
    Migrate {
        #[arg(long)]
        database_url: Option<String>,
    },
    /// Merge the batch and print the canonical events as JSON.
    Merge {
        #[arg(long)]
        source: Option<PathBuf>,
    },
}

#[derive(Debug, Default, Args)]
struct ImportArgs {
    #[arg(long)]
    source: Option<PathBuf>,
    #[arg(long)]
    database_url: Option<String>,
    /// Persist into an in-memory store instead of Postgres.
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    skip_schema: bool,
    #[arg(long)]
    max_concurrent_persists: Option<usize>,
    #[arg(long)]
    simulated_delay_ms: Option<u64>,
}

impl ImportArgs {
    fn apply(&self, config: &mut ImportConfig) {
        if let Some(source) = &self.source {
            config.source_path = source.clone();
        }
        if let Some(url) = &self.database_url {
            config.database_url = Some(url.clone());
        }
        if self.skip_schema {
            config.create_schema = false;
        }
        if let Some(n) = self.max_concurrent_persists {
            config.persist.max_concurrent_persists = n;
        }
        if let Some(ms) = self.simulated_delay_ms {
            config.persist.simulated_delay_max = (ms > 0).then(|| Duration::from_millis(ms));
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = ImportConfig::from_env();

    match cli.command.unwrap_or(Commands::Import(ImportArgs::default())) {
        Commands::Import(args) => {
            args.apply(&mut config);
            let pipeline = ImportPipeline::new(config);
            let summary = if args.dry_run {
                pipeline.run_with_store(Arc::new(MemoryEventStore::new())).await?
            } else {
                pipeline.run_once().await?
            };
            print_summary(&summary);
        }
        Commands::Migrate { database_url } => {
            if database_url.is_some() {
                config.database_url = database_url;
            }
            ImportPipeline::new(config).migrate().await?;
            println!("schema ready");
        }
        Commands::Merge { source } => {
            let path = source.unwrap_or(config.source_path);
            let messages = load_messages(&path).await?;
            let events = merge_messages(&messages);
            println!("{}", serde_json::to_string_pretty(&events)?);
        }
    }

    Ok(())
}

fn print_summary(summary: &ImportSummary) {
    println!(
        "import complete: run_id={} messages={} events={} succeeded={}/{} failed={} elapsed={:.2}s",
        summary.run_id,
        summary.messages,
        summary.merged_events,
        summary.persist.succeeded,
        summary.persist.total,
        summary.persist.failed(),
        summary.elapsed().num_milliseconds() as f64 / 1000.0,
    );
    let failed = summary.persist.failed_event_ids();
    if !failed.is_empty() {
        eprintln!("failed events: {failed:?}");
    }
}
