//! BDGD Import - Main entry point

use anyhow::{Context, Result};
use bdgd_common::logging::{init_logging, LogConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{error, info};

use bdgd_import::{
    db, orchestrator, queue, Destination, ImportConfig, LayerPipeline, MemoryDestination,
    MemoryStatusStore, Orchestrator, PgDestination, PgStatusStore, StatusStore, StatusTracker,
};

#[derive(Parser, Debug)]
#[command(name = "bdgd-import", version, about = "Import BDGD extracts into Postgres")]
struct Cli {
    /// Directory holding `{prefix}_{year}.gdb` containers
    #[arg(long, env = "BDGD_DOWNLOADS_DIR", global = true)]
    downloads_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import containers: discovered ones, or the given distributors and years
    Run {
        /// Distributor display name (repeatable)
        #[arg(long = "distributor")]
        distributors: Vec<String>,

        /// Extract year (repeatable)
        #[arg(long = "year")]
        years: Vec<i32>,

        /// Read, sanitize, and identify without writing anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Mark layers of the given distributors and years as queued
    Enqueue {
        #[arg(long = "distributor", required = true)]
        distributors: Vec<String>,

        #[arg(long = "year", required = true)]
        years: Vec<i32>,
    },
    /// Print the job listing as JSON
    Status,
}

/// Status store and destination for this process
struct Backends {
    tracker: StatusTracker,
    destination: Arc<dyn Destination>,
}

async fn backends(config: &ImportConfig) -> Result<Backends> {
    if config.database_url.is_none() {
        info!("No DATABASE_URL, using in-memory stores");
        let store: Arc<dyn StatusStore> = Arc::new(MemoryStatusStore::new());
        return Ok(Backends {
            tracker: StatusTracker::new(store),
            destination: Arc::new(MemoryDestination::new()),
        });
    }

    let pool = db::create_pool(config)
        .await
        .context("Failed to connect to the database")?;
    db::ensure_schema(&pool, &config.schema)
        .await
        .context("Failed to prepare the destination schema")?;

    Ok(Backends {
        tracker: StatusTracker::new(Arc::new(PgStatusStore::new(pool.clone(), &config.schema)?)),
        destination: Arc::new(PgDestination::new(pool, config.schema.clone())?),
    })
}

async fn execute(cli: Cli) -> Result<()> {
    let mut config = ImportConfig::load_env()?;
    if let Some(dir) = cli.downloads_dir {
        config.downloads_dir = dir;
    }
    match &cli.command {
        Command::Run { dry_run: true, .. } => config.dry_run = true,
        // Listing works without a database, against in-memory status only
        Command::Status if config.database_url.is_none() => config.dry_run = true,
        _ => {},
    }
    config.validate()?;

    match cli.command {
        Command::Run {
            distributors,
            years,
            ..
        } => {
            let backends = backends(&config).await?;
            let pipeline = LayerPipeline::new(backends.destination, backends.tracker, &config);
            let downloads_dir = config.downloads_dir.clone();
            let runner = Orchestrator::new(pipeline, config);

            let summary = if distributors.is_empty() && years.is_empty() {
                runner.run_discovered().await?
            } else {
                if distributors.is_empty() || years.is_empty() {
                    anyhow::bail!("--distributor and --year must be given together");
                }
                let candidates = orchestrator::candidates_for(&downloads_dir, &distributors, &years);
                runner.run(candidates).await
            };

            println!("{}", serde_json::to_string_pretty(&summary)?);
            if summary.failed() > 0 {
                anyhow::bail!("{} job(s) failed", summary.failed());
            }
        },
        Command::Enqueue { distributors, years } => {
            let backends = backends(&config).await?;
            let queued = queue::enqueue(&backends.tracker, &distributors, &years).await?;
            for key in queued {
                println!("{}", key);
            }
        },
        Command::Status => {
            let backends = backends(&config).await?;
            let listing = queue::list_jobs(&backends.tracker, &config.downloads_dir).await?;
            println!("{}", serde_json::to_string_pretty(&listing)?);
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: could not load .env: {}", e);
        }
    }

    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .log_file_prefix("bdgd-import")
        .filter_directives("bdgd_import=info,sqlx=warn")
        .build();
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);
    if let Err(e) = init_logging(&log_config) {
        eprintln!("Warning: logging not initialized: {}", e);
    }

    if let Err(e) = execute(cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}
