//! auditq CLI: run the scheduler and inspect its outcome store.

use auditq::alert::{LogAlertHook, run_alert_subscriber};
use auditq::backend::{CommandAnalyzer, DirectorySource};
use auditq::config::{Config, Settings, store_from_env};
use auditq::engine::{ControlPlane, SchedulerContext};
use auditq::error::Error;
use auditq::model::{ItemId, OutcomeRecord, Status};
use auditq::pool::ResourcePool;
use auditq::stats;
use auditq::store::{DedupStore, WriteOutcome};
use auditq::telemetry::{TelemetryConfig, init_telemetry};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "auditq", about = "Concurrent audit scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until interrupted
    Serve {
        /// Scheduler settings TOML (overrides AUDITQ_SETTINGS)
        #[arg(long)]
        settings: Option<PathBuf>,
    },
    /// Summarize the outcome store
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// List outcome records, newest first
    List {
        /// Filter by status (pending, succeeded, failed, skipped)
        #[arg(long)]
        status: Option<Status>,
        /// Maximum records to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show one outcome record as JSON
    Show {
        /// Item id
        id: String,
    },
    /// Mark an item as skipped so it is never dispatched
    Skip {
        /// Item id
        id: String,
        #[arg(long, default_value = "skipped by operator")]
        reason: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // `serve` sets up its own telemetry. The inspection commands still get
    // store warnings (skipped records, unreadable files) on stderr.
    let _logging = match cli.command {
        Command::Serve { .. } => None,
        _ => {
            let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "warn".to_string());
            Some(init_telemetry(TelemetryConfig::stderr(level))?)
        }
    };

    match cli.command {
        Command::Serve { settings } => cmd_serve(settings).await,
        Command::Stats { json } => cmd_stats(&open_store().await?, json).await,
        Command::List { status, limit } => cmd_list(&open_store().await?, status, limit).await,
        Command::Show { id } => cmd_show(&open_store().await?, id).await,
        Command::Skip { id, reason } => cmd_skip(&open_store().await?, id, reason).await,
    }
}

async fn open_store() -> anyhow::Result<DedupStore> {
    let (path, settings) = store_from_env()?;
    Ok(DedupStore::open(path, settings.shard_max_bytes).await?)
}

async fn cmd_serve(settings: Option<PathBuf>) -> anyhow::Result<()> {
    let mut config = Config::from_env()?;
    if let Some(path) = settings {
        config.settings = Settings::load(&path)?;
    }

    let _guard = init_telemetry(TelemetryConfig::new(
        config.otel_endpoint.clone(),
        &config.log_level,
    ))?;

    let analyzer = CommandAnalyzer::new(config.require_analyzer()?, config.settings.analyze_timeout());
    let source = DirectorySource::new(&config.source_dir);
    let store = DedupStore::open(&config.store_path, config.settings.shard_max_bytes).await?;
    let pool = ResourcePool::new(config.credentials, config.settings.min_delay())?;

    let ctx = SchedulerContext::new(store, pool);
    let control = ControlPlane::new(
        ctx.clone(),
        Arc::new(source),
        Arc::new(analyzer),
        config.settings.scheduler(),
    );

    // Stopped only after the scheduler has drained, so late outcomes still alert.
    let alerts_done = CancellationToken::new();
    let alerts = tokio::spawn(run_alert_subscriber(
        ctx.events.subscribe(),
        Arc::new(LogAlertHook),
        alerts_done.clone(),
    ));

    let ctrl = control.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        ctrl.shutdown();
    });

    control.run().await?;
    alerts_done.cancel();
    alerts.await?;
    Ok(())
}

async fn cmd_stats(store: &DedupStore, json: bool) -> anyhow::Result<()> {
    let snapshot = stats::snapshot(store).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        println!("{snapshot}");
    }
    Ok(())
}

async fn cmd_list(store: &DedupStore, status: Option<Status>, limit: usize) -> anyhow::Result<()> {
    let view = store.view();
    let mut records: Vec<&OutcomeRecord> = view
        .iter()
        .filter(|r| status.is_none_or(|s| r.status == s))
        .collect();
    records.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));

    if records.is_empty() {
        println!("No records found.");
        return Ok(());
    }

    println!(
        "{:<44} {:<10} {:<20} {:>8}  REASON",
        "ID", "STATUS", "RECORDED", "FINDINGS"
    );
    for record in records.into_iter().take(limit) {
        println!(
            "{:<44} {:<10} {:<20} {:>8}  {}",
            record.id,
            record.status,
            record.recorded_at.format("%Y-%m-%d %H:%M:%S"),
            record.findings.len(),
            record.failure_reason.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

async fn cmd_show(store: &DedupStore, id: String) -> anyhow::Result<()> {
    let id = ItemId::new(id);
    let record = store
        .get(&id)
        .ok_or_else(|| Error::NotFound(id.to_string()))?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

async fn cmd_skip(store: &DedupStore, id: String, reason: String) -> anyhow::Result<()> {
    let id = ItemId::new(id);
    match store.write(OutcomeRecord::skipped(id.clone(), reason)).await? {
        WriteOutcome::Written => {
            println!("{id} marked skipped");
            Ok(())
        }
        WriteOutcome::Rejected { existing } => {
            anyhow::bail!("{id} already has a terminal record ({existing})")
        }
    }
}
