//! Advisory engine CLI
//!
//! Local execution entry point: runs the scheduler and workers, single jobs,
//! and prints stored state.

use std::path::PathBuf;

use advisory_engine::{
    Engine,
    config,
    error::{AppError, Result},
    models::JobStatus,
};
use clap::{Parser, Subcommand};

/// Travel-advisory ingestion engine
#[derive(Parser, Debug)]
#[command(
    name = "advisory",
    version,
    about = "Travel-advisory ingestion and scheduling engine"
)]
struct Cli {
    /// Path to the engine configuration (default: $ADVISORY_CONFIG or engine.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Store state as JSON files under this directory
    #[arg(short, long)]
    storage_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler and worker pool until Ctrl-C
    Run,

    /// Run one job inline and report the outcome
    Once {
        /// Source identifier, e.g. us_state_dept
        #[arg(long)]
        source: String,

        /// Country to fetch; all countries when omitted
        #[arg(long)]
        country: Option<String>,
    },

    /// Validate the configuration file
    Validate,

    /// Show sources, stored jobs and optionally a country's advisories
    Info {
        #[arg(long)]
        country: Option<String>,
    },

    /// List dead-lettered jobs
    DeadLetters,
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = config::config_path(cli.config.as_deref());
    let config = config::load_all(&config_path, cli.storage_dir.as_deref())?;
    log::info!("Loaded configuration from {}", config_path.display());

    match cli.command {
        Command::Run => {
            let engine = Engine::new(config)?;
            engine.start()?;
            tokio::signal::ctrl_c().await?;
            log::info!("Shutting down...");
            engine.shutdown().await;
        }

        Command::Once { source, country } => {
            let engine = Engine::new(config)?;
            let report = engine.run_once(&source, country.as_deref()).await?;
            for outcome in &report.changes {
                log::info!(
                    "{}: {} [{}]",
                    outcome.record.key(),
                    outcome.change_type.as_str(),
                    outcome.record.risk_level_standardized
                );
            }
            match report.job.status {
                JobStatus::Success => log::info!("Job {} succeeded", report.job.id),
                status => {
                    let reason = report.job.last_error.unwrap_or_default();
                    log::error!("Job {} ended {}: {}", report.job.id, status, reason);
                    return Err(AppError::config(format!("job ended {status}")));
                }
            }
        }

        Command::Validate => {
            log::info!("Validating configuration...");
            Engine::new(config)?;
            log::info!("✓ Config OK");
        }

        Command::Info { country } => {
            let engine = Engine::new(config)?;
            for source in &engine.config().sources {
                log::info!(
                    "Source {} ({}, {:?} every {:?}){}",
                    source.id,
                    source.adapter_id(),
                    source.queue_class,
                    source.cadence(&engine.config().scheduler),
                    if source.enabled { "" } else { " [disabled]" }
                );
            }

            let jobs = engine.jobs(None).await?;
            log::info!("Stored jobs: {}", jobs.len());
            for status in [
                JobStatus::Pending,
                JobStatus::Success,
                JobStatus::Failure,
                JobStatus::DeadLetter,
            ] {
                let count = jobs.iter().filter(|j| j.status == status).count();
                if count > 0 {
                    log::info!("  {}: {}", status, count);
                }
            }

            if let Some(country) = country {
                let records = engine.latest_advisories(&country, None).await?;
                if records.is_empty() {
                    log::info!("No advisories stored for {}", country);
                } else {
                    println!("{}", serde_json::to_string_pretty(&records)?);
                }
            }
        }

        Command::DeadLetters => {
            let engine = Engine::new(config)?;
            let entries = engine.dead_letters().await?;
            if entries.is_empty() {
                log::info!("No dead letters.");
            }
            for entry in entries {
                log::info!(
                    "{} ({}) attempts={} replays={} last={}: {}",
                    entry.id,
                    entry.job_snapshot.target(),
                    entry.attempt_count,
                    entry.reprocess_count,
                    entry.last_attempted_at,
                    entry.reason
                );
            }
        }
    }

    Ok(())
}
