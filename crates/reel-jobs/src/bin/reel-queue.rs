//! reel-queue: operator tool for inspecting and recovering a job snapshot.
//!
//! Reads the JSON snapshot written by the queue supervisor. Output goes to
//! stdout as JSON; logs go to stderr.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use reel_jobs::{defaults, JobId, JobQueue, JobStatus, JobStore, JsonFileJobStore};

#[derive(Parser)]
#[command(name = "reel-queue")]
#[command(author, version, about = "Inspect and recover the reel job queue snapshot")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to the JSON job snapshot
    #[arg(long, global = true, env = "REEL_SNAPSHOT_PATH", default_value = defaults::SNAPSHOT_PATH)]
    snapshot: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show per-status counts and average wait/run times
    Stats,

    /// List jobs, newest first (dispatch order when filtering on pending)
    List {
        /// Only show jobs with this status
        #[arg(short, long)]
        status: Option<JobStatus>,

        /// Maximum number of jobs to show
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// Show one job by id
    Show {
        /// Job id
        id: JobId,
    },

    /// Requeue jobs that were running when the process stopped
    Recover,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _file_guard = init_tracing();

    match cli.command {
        Commands::Stats => cmd_stats(&cli.snapshot).await,
        Commands::List { status, limit } => cmd_list(&cli.snapshot, status, limit).await,
        Commands::Show { id } => cmd_show(&cli.snapshot, id).await,
        Commands::Recover => cmd_recover(&cli.snapshot).await,
    }
}

/// Initialize tracing.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, enables file logging)
///   LOG_ANSI    - "true"/"false" override ANSI colors
///   RUST_LOG    - standard env filter (default: "reel_jobs=info,reel_providers=info")
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "reel_jobs=info,reel_providers=info".into());

    let registry = tracing_subscriber::registry().with(env_filter);

    if let Some(ref path) = log_file {
        let file_dir = Path::new(path).parent().unwrap_or(Path::new("."));
        let file_name = Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("reel-queue.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    }
}

async fn open_store(path: &Path) -> anyhow::Result<JsonFileJobStore> {
    JsonFileJobStore::open(path)
        .await
        .with_context(|| format!("failed to open snapshot {}", path.display()))
}

/// Read-only view of the snapshot: running jobs stay as recorded.
async fn inspect(path: &Path) -> anyhow::Result<JobQueue> {
    let jobs = open_store(path).await?.load_all().await?;
    Ok(JobQueue::inspect(jobs))
}

async fn cmd_stats(path: &Path) -> anyhow::Result<()> {
    let queue = inspect(path).await?;
    let output = json!({
        "snapshot": path.display().to_string(),
        "stats": queue.statistics(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn cmd_list(path: &Path, status: Option<JobStatus>, limit: usize) -> anyhow::Result<()> {
    let queue = inspect(path).await?;
    let jobs = queue.list(status, limit);
    println!("{}", serde_json::to_string_pretty(&jobs)?);
    Ok(())
}

async fn cmd_show(path: &Path, id: JobId) -> anyhow::Result<()> {
    let job = inspect(path).await?.require(id)?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

async fn cmd_recover(path: &Path) -> anyhow::Result<()> {
    let store = Arc::new(open_store(path).await?);
    let queue = JobQueue::new(store);
    let requeued = queue.restore().await?;
    let stats = queue.statistics();

    info!(
        subsystem = "jobs",
        component = "cli",
        op = "recover",
        requeued,
        pending = stats.pending,
        "Snapshot recovered"
    );

    let output = json!({
        "snapshot": path.display().to_string(),
        "requeued": requeued,
        "stats": stats,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
