use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use citesync_core::format_timestamp;
use citesync_storage::CitationStore;
use citesync_sync::{export_year, maybe_build_scheduler, run_enrichment, run_sync_once, SyncConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "citesync")]
#[command(about = "Keep a local SFMTA parking citation store in sync and enrich it with zip codes")]
struct Cli {
    /// Overrides CITESYNC_DATABASE_URL.
    #[arg(long, global = true)]
    database_url: Option<String>,
    /// Overrides CITESYNC_ARTIFACTS_DIR.
    #[arg(long, global = true)]
    artifacts_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the citation table if it does not exist.
    Init,
    /// Fetch every citation issued since the stored watermark.
    Sync {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Attach zip codes to a seeded sample of one year's citations.
    Enrich {
        #[arg(long)]
        year: i32,
        #[arg(long, default_value_t = 0.1)]
        fraction: f64,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Write one year of stored citations as a Parquet artifact.
    Export {
        #[arg(long)]
        year: i32,
        /// Keep only rows that carry a geometry.
        #[arg(long)]
        geometry_only: bool,
    },
    /// Row count, watermark and per-year geometry coverage.
    Stats,
    /// Run the sync on its cron schedule until interrupted.
    Schedule {
        #[arg(long)]
        cron: Option<String>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_json = std::env::var("CITESYNC_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false);
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

impl Cli {
    fn config(&self) -> SyncConfig {
        let mut config = SyncConfig::from_env();
        if let Some(url) = &self.database_url {
            config.database_url = url.clone();
        }
        if let Some(dir) = &self.artifacts_dir {
            config.artifacts_dir = dir.clone();
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = cli.config();

    match cli.command.unwrap_or(Commands::Sync { limit: None }) {
        Commands::Init => {
            let store = CitationStore::connect(&config.database_url).await?;
            store.create_table().await?;
            println!("citation table ready in {}", config.database_url);
        }
        Commands::Sync { limit } => {
            if let Some(limit) = limit {
                config.fetch_limit = limit;
            }
            let summary = run_sync_once(&config).await?;
            println!(
                "sync complete: run_id={} watermark={} windows={} appended={} rejected={} truncated={}",
                summary.run_id,
                format_timestamp(summary.watermark),
                summary.windows_fetched,
                summary.rows_appended,
                summary.rows_rejected,
                summary.truncated_windows
            );
        }
        Commands::Enrich {
            year,
            fraction,
            seed,
        } => {
            if let Some(seed) = seed {
                config.sample_seed = seed;
            }
            let summary = run_enrichment(&config, year, fraction).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&summary.manifest)
                    .context("serializing enrichment manifest")?
            );
        }
        Commands::Export {
            year,
            geometry_only,
        } => {
            let stored = export_year(&config, year, geometry_only).await?;
            println!(
                "export complete: path={} sha256={} bytes={}",
                stored.absolute_path.display(),
                stored.content_hash,
                stored.byte_size
            );
        }
        Commands::Stats => {
            let store = CitationStore::connect(&config.database_url).await?;
            println!("rows: {}", store.count().await?);
            match store.latest_issued().await? {
                Some(latest) => println!("watermark: {}", format_timestamp(latest)),
                None => println!("watermark: (empty store)"),
            }
            for entry in store.geometry_counts_by_year().await? {
                println!("{}: {} rows with geometry", entry.year, entry.count);
            }
        }
        Commands::Schedule { cron } => {
            config.scheduler_enabled = true;
            if let Some(cron) = cron {
                config.sync_cron = cron;
            }
            let Some(mut sched) = maybe_build_scheduler(&config).await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
