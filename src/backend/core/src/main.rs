//! Taskmill - background job engine.
//!
//! `taskmill run` boots the engine against in-memory storage with a couple
//! of built-in handlers; `config` and `cron` are inspection helpers.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tabled::{
    settings::{object::Columns, Alignment, Modify, Style},
    Table, Tabled,
};

use taskmill_core::{
    clock::{Clock, SystemClock},
    config::EngineConfig,
    engine::Engine,
    error::TaskError,
    jobs::{CronJob, FnHandler, InMemoryStorage, Job, Queue, TaskContext, TaskDescriptor},
    scheduling::upcoming,
    telemetry::init_telemetry,
};

// ═══════════════════════════════════════════════════════════════════════════════
// CLI Structure
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Parser)]
#[command(
    name = "taskmill",
    version,
    about = "Taskmill - background job engine with retries, cron and circuit breaking",
    propagate_version = true
)]
struct Cli {
    /// Configuration file path (toml, yaml or json)
    #[arg(short, long, global = true, env = "TASKMILL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine until interrupted
    Run {
        /// Seed a few demo jobs and a heartbeat cron job
        #[arg(long)]
        demo: bool,
    },

    /// Print the effective configuration as JSON
    Config,

    /// Preview the next fire times of a cron expression
    Cron {
        /// Five-field (or six/seven-field with seconds) expression
        expression: String,

        /// Number of fire times to show
        #[arg(short = 'n', long, default_value = "5")]
        count: usize,

        /// Start from this RFC 3339 timestamp instead of now
        #[arg(long)]
        after: Option<DateTime<Utc>>,
    },
}

#[derive(Tabled)]
struct FireTimeRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Fires At (UTC)")]
    at: String,
    #[tabled(rename = "In")]
    delta: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { demo } => run(load_config(cli.config.as_ref())?, demo).await,
        Commands::Config => print_config(load_config(cli.config.as_ref())?),
        Commands::Cron {
            expression,
            count,
            after,
        } => preview_cron(&expression, count, after),
    };

    if let Err(e) = result {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("Could not load config from {}", path.display()))?,
        None => EngineConfig::load().context("Could not load config from the environment")?,
    };
    config.validate()?;
    Ok(config)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Commands
// ═══════════════════════════════════════════════════════════════════════════════

async fn run(config: EngineConfig, demo: bool) -> Result<()> {
    let metrics = init_telemetry(&config.logging, &config.metrics, &config.service_name)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Taskmill");

    let clock = SystemClock::shared();
    let storage = Arc::new(InMemoryStorage::new(clock.clone()));
    if demo {
        seed_demo(&storage, clock.now());
    }

    let engine = Engine::builder()
        .config(config)
        .storage(storage)
        .clock(clock)
        .task(TaskDescriptor::new("noop", FnHandler(noop)).with_description("Does nothing"))
        .task(
            TaskDescriptor::new("echo", FnHandler(echo))
                .with_description("Logs its payload")
                .with_retry_strategy("linear")
                .with_timeout(Duration::from_secs(30)),
        )
        .env(std::env::vars().filter(|(k, _)| k.starts_with("TASKMILL_")).collect())
        .build()?;

    engine.start();
    shutdown_signal().await;

    let outcome = engine.shutdown().await;
    let stats = engine.stats();
    tracing::info!(
        processed = stats.pool.processed,
        skipped = stats.pool.skipped,
        worker_panics = stats.pool.worker_panics,
        ticks = stats.scheduling.ticks,
        breaker = ?stats.circuit_breaker.state,
        "Engine stopped"
    );
    if metrics.is_enabled() {
        tracing::debug!(exposition = %metrics.render(), "Final metrics");
    }

    if let Err(err) = outcome {
        tracing::warn!(error = %err, "Aborting jobs still running");
        engine.shutdown_now();
    }
    Ok(())
}

fn print_config(config: EngineConfig) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn preview_cron(expression: &str, count: usize, after: Option<DateTime<Utc>>) -> Result<()> {
    let now = Utc::now();
    let after = after.unwrap_or(now);
    let rows: Vec<FireTimeRow> = upcoming(expression, after, count)?
        .into_iter()
        .enumerate()
        .map(|(i, at)| FireTimeRow {
            index: i + 1,
            at: at.format("%Y-%m-%d %H:%M:%S").to_string(),
            delta: match (at - now).to_std() {
                Ok(delta) => humantime::format_duration(Duration::from_secs(delta.as_secs())).to_string(),
                Err(_) => "past".to_string(),
            },
        })
        .collect();

    let mut table = Table::new(rows);
    table
        .with(Style::rounded())
        .with(Modify::new(Columns::first()).with(Alignment::right()));
    println!("{}", table);
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Built-in Handlers
// ═══════════════════════════════════════════════════════════════════════════════

async fn noop(_ctx: TaskContext) -> Result<(), TaskError> {
    Ok(())
}

async fn echo(ctx: TaskContext) -> Result<(), TaskError> {
    if ctx.data().get("fail").and_then(|v| v.as_bool()).unwrap_or(false) {
        return Err(TaskError::new("Echo asked to fail").with_context(ctx.data().clone()));
    }
    tracing::info!(payload = %ctx.data(), attempt = ctx.attempt(), "echo");
    ctx.report_progress(100, None);
    Ok(())
}

fn seed_demo(storage: &InMemoryStorage, now: DateTime<Utc>) {
    let queue = Queue::new("default");
    for i in 0..3 {
        storage.insert_job(Job::new("echo", queue.clone(), now).with_data(serde_json::json!({ "n": i })));
    }
    storage.insert_job(
        Job::new("echo", queue.clone(), now)
            .with_max_retries(2)
            .with_data(serde_json::json!({ "fail": true })),
    );
    storage.insert_cron_job(CronJob::new("heartbeat", "* * * * *", "noop", queue));
    tracing::info!("Seeded demo jobs");
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
