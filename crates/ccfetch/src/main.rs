//! ccfetch - Common Crawl document harvester

use anyhow::{Context, Result};
use ccfetch::config::{FetcherConfig, RunConfig};
use ccfetch::pipeline::Pipeline;
use ccfetch::progress::ProgressReporter;
use ccfetch::quota::QuotaTracker;
use ccfetch_common::logging::{init_logging, LogConfig, LogLevel};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "ccfetch")]
#[command(author, version, about = "Fetch Common Crawl documents listed in CDX indexes")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch and store every selected record
    Run {
        /// JSON run configuration
        #[arg(short, long)]
        config: PathBuf,

        /// Select, count and name records without fetching or storing
        #[arg(long)]
        dry_run: bool,

        /// Override numThreads
        #[arg(short, long)]
        threads: Option<usize>,
    },

    /// Validate a configuration and print the resolved run settings
    Check {
        /// JSON run configuration
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn load_config(path: &Path, dry_run: bool, threads: Option<usize>) -> Result<RunConfig> {
    let mut config = FetcherConfig::load(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    config.apply_env()?;

    if dry_run {
        config.dry_run = true;
    }
    if let Some(threads) = threads {
        config.num_threads = threads;
    }

    Ok(config.validate()?)
}

fn spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) =
        ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")
    {
        pb.set_style(style);
    }
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

async fn run(config: RunConfig, show_spinner: bool) -> Result<()> {
    config.log_summary();

    let quota = Arc::new(QuotaTracker::new(config.limits));
    let pipeline = Pipeline::from_config(&config, quota.clone())
        .await
        .map_err(|e| {
            let stage = if e.is_startup() {
                "configuration"
            } else {
                "backend setup"
            };
            anyhow::Error::new(e).context(format!("Run aborted during {}", stage))
        })?;

    let reporter = ProgressReporter::new(quota.clone()).spawn();
    let live = show_spinner.then(|| {
        let pb = spinner();
        let observer_pb = pb.clone();
        let handle = ProgressReporter::new(quota.clone())
            .with_interval(Duration::from_millis(500))
            .without_log()
            .with_observer(move |s| {
                observer_pb.set_message(format!(
                    "seen {} | extracted {} | truncated {}",
                    s.records_seen, s.files_extracted, s.files_truncated
                ))
            })
            .spawn();
        (pb, handle)
    });

    let result = pipeline.run(Box::new(config.index_source())).await;

    reporter.stop().await;
    if let Some((pb, handle)) = live {
        handle.stop().await;
        pb.finish_and_clear();
    }

    let summary = result?;
    println!("{}", summary);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("ccfetch")
        .build()
        .merge_env()?;

    let _guard = init_logging(&log_config).context("Failed to initialize logging")?;

    match cli.command {
        Command::Run {
            config,
            dry_run,
            threads,
        } => {
            let run_config = load_config(&config, dry_run, threads)?;
            let show_spinner =
                !log_config.output.to_console() && std::io::stdout().is_terminal();

            info!(config = %config.display(), "Starting run");
            if let Err(e) = run(run_config, show_spinner).await {
                error!(error = %e, "Run failed");
                return Err(e);
            }
        }
        Command::Check { config } => {
            let run_config = load_config(&config, false, None)?;
            println!("configuration OK");
            println!("  source:         {}", run_config.backend.describe());
            println!("  sink:           {}", run_config.sink.describe());
            println!("  workers:        {}", run_config.num_threads);
            println!("  max records:    {}", run_config.limits.max_records);
            println!("  max extracted:  {}", run_config.limits.max_files_extracted);
            println!("  max truncated:  {}", run_config.limits.max_files_truncated);
            println!("  max attempts:   {}", run_config.backoff.max_attempts());
            println!("  index files:    {}", run_config.index_paths.len());
            println!("  truncated log:  {}", run_config.truncated_urls_file.display());
        }
    }

    Ok(())
}
