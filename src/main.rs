//! fraud-replay - replays captured decision requests from service logs
//!
//! Usage:
//!   fraud-replay --log-dir /data/fraud/logs --service-url http://decision:8080/fraud/check
//!   fraud-replay --config replay.toml --summary-json summary.json
//!
//! Environment Variables:
//!   REPLAY_LOG_DIR     - Directory of captured log files
//!   REPLAY_SERVICE_URL - Decision service endpoint
//!   RUST_LOG           - Log filter (overrides --log-level)
//!
//! Exit Codes:
//!   0 - run completed (individual records may still have failed)
//!   2 - configuration error
//!   3 - run aborted (pool saturation, unreadable log directory)

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fraud_replay::replay::ExtractionStrategy;
use fraud_replay::{orchestrator, ReplayConfig, RunSummary};

#[derive(Parser, Debug)]
#[command(name = "fraud-replay")]
#[command(about = "Replay captured fraud decision requests, AF1001 before AF1002")]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory of captured log files (not searched recursively)
    #[arg(long, env = "REPLAY_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Decision service endpoint
    #[arg(long, env = "REPLAY_SERVICE_URL")]
    service_url: Option<String>,

    /// How payloads are located in log text
    #[arg(long, value_enum)]
    strategy: Option<ExtractionStrategy>,

    /// Records per pool task
    #[arg(long)]
    batch_size: Option<usize>,

    /// Pause after each request in milliseconds (0 disables)
    #[arg(long)]
    post_request_delay_ms: Option<u64>,

    /// Write the run summary as JSON to this path
    #[arg(long)]
    summary_json: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    // .env first so clap's env fallbacks can see it
    let _ = dotenv();
    let args = Args::parse();
    init_tracing(&args.log_level);

    info!("🚀 fraud-replay starting");

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {:#}", e);
            return ExitCode::from(2);
        }
    };
    info!(
        log_dir = %config.log_dir.display(),
        service_url = %config.service_url,
        strategy = ?config.extraction.strategy,
        batch_size = config.pool.batch_size,
        "Config loaded"
    );

    let summary = match orchestrator::run(config).await {
        Ok(summary) => summary,
        Err(e) => {
            error!("🛑 Run aborted: {:#}", e);
            return ExitCode::from(3);
        }
    };

    if let Some(path) = &args.summary_json {
        if let Err(e) = write_summary(path, &summary) {
            error!("Failed to write summary: {:#}", e);
        }
    }

    info!("fraud-replay finished");
    ExitCode::SUCCESS
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("fraud_replay={}", level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Defaults, then the TOML file, then environment / CLI flags.
fn build_config(args: &Args) -> Result<ReplayConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading config from {}", path.display());
            ReplayConfig::load(path)?
        }
        None => ReplayConfig::default(),
    };

    if let Some(dir) = &args.log_dir {
        config.log_dir = dir.clone();
    }
    if let Some(url) = &args.service_url {
        config.service_url = url.clone();
    }
    if let Some(strategy) = args.strategy {
        config.extraction.strategy = strategy;
    }
    if let Some(size) = args.batch_size {
        config.pool.batch_size = size;
    }
    if let Some(ms) = args.post_request_delay_ms {
        config.client.post_request_delay = Duration::from_millis(ms);
    }

    config.validate()?;
    Ok(config)
}

fn write_summary(path: &Path, summary: &RunSummary) -> Result<()> {
    let json = serde_json::to_string_pretty(summary).context("Failed to encode summary")?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write summary to {}", path.display()))?;
    info!("Summary written to {}", path.display());
    Ok(())
}
