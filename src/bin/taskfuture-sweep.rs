//! taskfuture-sweep: removes expired terminal task records.
//!
//! Intended to run from cron or a scheduler. Prints the number of records
//! removed; exits non-zero only when the configuration or the store fails.
//! The in-process `memory` backend is rejected, since a fresh one is always
//! empty.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use taskfuture::{ExpirationSweep, FutureConfig};

/// Remove expired terminal task records
#[derive(Debug, Parser)]
#[command(name = "taskfuture-sweep")]
#[command(about = "Remove expired terminal task records", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ./taskfuture.toml when present)
    #[arg(long, env = "TASKFUTURE_CONFIG")]
    config: Option<PathBuf>,

    /// Retention in seconds, overriding the configured value
    #[arg(long)]
    retention_secs: Option<u64>,

    /// Explicit cutoff (RFC 3339); records completed before it are removed.
    /// Takes precedence over the retention window.
    #[arg(long, value_parser = parse_cutoff)]
    cutoff: Option<DateTime<Utc>>,
}

fn parse_cutoff(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("invalid RFC 3339 timestamp '{raw}': {e}"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(removed) => {
            println!("{removed}");
            ExitCode::SUCCESS
        },
        Err(e) => {
            tracing::error!(error = %e, "sweep failed");
            eprintln!("taskfuture-sweep: {e}");
            ExitCode::FAILURE
        },
    }
}

async fn run(cli: Cli) -> Result<usize, taskfuture::ConfigError> {
    let mut config = match &cli.config {
        Some(path) => FutureConfig::from_file(path)?,
        None => FutureConfig::load()?,
    };
    if let Some(secs) = cli.retention_secs {
        config.retention_secs = secs;
    }

    config.require_shared_store()?;

    let store = config.connect_store().await?;
    let sweep =
        ExpirationSweep::new(store).with_retention(Duration::from_secs(config.retention_secs));
    let report = match cli.cutoff {
        Some(cutoff) => sweep.run_with_cutoff(cutoff).await?,
        None => sweep.run(Utc::now()).await?,
    };
    Ok(report.removed)
}
