//! CLI commands implementation.

use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use console::style;

use crate::config::Settings;
use crate::models::{JobStatus, Priority, QueueItemStatus};
use crate::persistence::SnapshotStore;
use crate::queue::{QueueManager, QueueQuery};
use crate::recovery::{RecoveryService, TracingNotifier};
use crate::tracker::JobTracker;
use crate::webhook::{
    result_channel, serve, spawn_consumer, GatewayState, TracingResultNotifier,
    TrackingDispatcher, WebhookClient,
};

#[derive(Parser)]
#[command(name = "dealflow")]
#[command(about = "M&A deal document-analysis coordination core")]
#[command(version)]
pub struct Cli {
    /// Data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the data directory and default configuration
    Init,

    /// Run the processing core: queue loops, webhook server, consumer
    Serve {
        /// Listen host (overrides configuration)
        #[arg(long)]
        host: Option<String>,
        /// Listen port (overrides configuration)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Enqueue a document for a deal
    Enqueue {
        /// Deal name
        deal: String,
        /// Path to the document
        path: PathBuf,
        /// Priority: high, normal or low
        #[arg(short, long, default_value = "normal")]
        priority: String,
    },

    /// Show queue items and statistics
    Queue {
        /// Filter by deal name
        #[arg(long)]
        deal: Option<String>,
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
    },

    /// Show tracked jobs
    Jobs {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
    },

    /// Synchronize a deal folder mirror against disk
    Sync {
        /// Deal name
        deal: String,
    },
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.data_dir.clone())?;

    match cli.command {
        Commands::Init => init(&settings),
        Commands::Serve { host, port } => serve_core(settings, host, port).await,
        Commands::Enqueue {
            deal,
            path,
            priority,
        } => enqueue(&settings, &deal, &path, &priority).await,
        Commands::Queue { deal, status } => show_queue(&settings, deal, status).await,
        Commands::Jobs { status } => show_jobs(&settings, status).await,
        Commands::Sync { deal } => sync_deal(&settings, &deal).await,
    }
}

fn init(settings: &Settings) -> anyhow::Result<()> {
    std::fs::create_dir_all(settings.state_dir())?;
    std::fs::create_dir_all(settings.deals_dir())?;
    settings.write_to(&settings.data_dir)?;
    println!(
        "{} initialized data directory at {}",
        style("ok").green(),
        settings.data_dir.display()
    );
    Ok(())
}

async fn serve_core(
    settings: Settings,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let store = SnapshotStore::new(settings.state_dir());

    let tracker = Arc::new(JobTracker::new());
    tracker.load_from(&store).await;

    let queue = Arc::new(QueueManager::new(
        settings.queue.clone(),
        settings.deals_dir(),
        store.clone(),
    ));
    queue.load_from_store().await;

    let client = Arc::new(WebhookClient::new(
        settings.webhook.clone(),
        settings.auth.clone(),
    ));

    let recovery = Arc::new(RecoveryService::new(
        settings.recovery.clone(),
        store.clone(),
        Arc::new(TracingNotifier),
    ));
    recovery.load_from_store().await;

    let (results_tx, results_rx) = result_channel();
    let consumer = spawn_consumer(
        tracker.clone(),
        queue.clone(),
        Arc::new(TracingResultNotifier),
        results_rx,
    );

    let dispatcher = Arc::new(TrackingDispatcher::new(client.clone(), tracker.clone()));
    queue.start(dispatcher).await?;

    // Tracker snapshots and execution cleanup share the queue cadences.
    let persist_tracker = tracker.clone();
    let persist_store = store.clone();
    let persist_interval = Duration::from_secs(settings.queue.persistence_interval_secs.max(1));
    let tracker_loop = tokio::spawn(async move {
        let mut tick = tokio::time::interval(persist_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            if let Err(e) = persist_tracker.persist(&persist_store).await {
                tracing::error!(error = %e, "tracker snapshot failed");
            }
        }
    });
    let cleanup_recovery = recovery.clone();
    let cleanup_interval = Duration::from_secs(settings.queue.cleanup_interval_secs.max(1));
    let recovery_loop = tokio::spawn(async move {
        let mut tick = tokio::time::interval(cleanup_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            cleanup_recovery.cleanup_old_executions().await;
        }
    });

    let state = GatewayState {
        tracker: tracker.clone(),
        queue: queue.clone(),
        client,
        auth: settings.auth.clone(),
        results_tx,
        dropped_results: Arc::new(AtomicU64::new(0)),
    };
    let host = host.unwrap_or_else(|| settings.webhook.bind_host.clone());
    let port = port.unwrap_or(settings.webhook.bind_port);

    println!(
        "{} serving on http://{}:{} (data: {})",
        style("ok").green(),
        host,
        port,
        settings.data_dir.display()
    );

    tokio::select! {
        result = serve(state, &host, port) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    // Orderly shutdown: stop loops, cancel executions, final snapshots.
    tracker_loop.abort();
    recovery_loop.abort();
    queue.stop().await?;
    recovery.shutdown();
    recovery.persist().await?;
    tracker.persist(&store).await?;
    consumer.abort();
    Ok(())
}

async fn enqueue(
    settings: &Settings,
    deal: &str,
    path: &std::path::Path,
    priority: &str,
) -> anyhow::Result<()> {
    let priority = Priority::from_str(priority)
        .ok_or_else(|| anyhow::anyhow!("invalid priority: {priority}"))?;
    let queue = load_queue(settings).await;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    let item = queue
        .enqueue_document(deal, path, &name, priority, serde_json::json!({}))
        .await?;
    println!(
        "{} queued {} for deal {} (item {}, job {})",
        style("ok").green(),
        name,
        deal,
        item.id,
        item.job_id
    );
    Ok(())
}

async fn show_queue(
    settings: &Settings,
    deal: Option<String>,
    status: Option<String>,
) -> anyhow::Result<()> {
    let status = match status.as_deref() {
        Some(raw) => Some(
            QueueItemStatus::from_str(raw)
                .ok_or_else(|| anyhow::anyhow!("invalid status: {raw}"))?,
        ),
        None => None,
    };
    let queue = load_queue(settings).await;
    let items = queue
        .query_queue(&QueueQuery {
            deal_name: deal,
            status,
            ..Default::default()
        })
        .await;

    if items.is_empty() {
        println!("queue is empty");
    }
    for item in &items {
        println!(
            "{:10} {:8} {:24} {}",
            item.status.as_str(),
            item.priority.as_str(),
            item.deal_name,
            item.document_name
        );
    }

    let stats = queue.queue_status().await;
    println!(
        "\n{} items, {} processing, {} completed last hour, {} history records",
        stats.total_items,
        stats.processing_count,
        stats.throughput_last_hour,
        stats.history_records
    );
    Ok(())
}

async fn show_jobs(settings: &Settings, status: Option<String>) -> anyhow::Result<()> {
    let store = SnapshotStore::new(settings.state_dir());
    let tracker = JobTracker::new();
    tracker.load_from(&store).await;

    let statuses: Vec<JobStatus> = match status.as_deref() {
        Some(raw) => vec![JobStatus::from_str(raw)
            .ok_or_else(|| anyhow::anyhow!("invalid status: {raw}"))?],
        None => vec![
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Canceled,
            JobStatus::TimedOut,
        ],
    };
    let mut total = 0;
    for status in statuses {
        for job in tracker.jobs_by_status(status).await {
            total += 1;
            println!(
                "{:10} {:5.0}% {:24} {}",
                job.status.as_str(),
                job.progress * 100.0,
                job.deal_name,
                job.job_id
            );
        }
    }
    if total == 0 {
        println!("no jobs");
    }
    Ok(())
}

async fn sync_deal(settings: &Settings, deal: &str) -> anyhow::Result<()> {
    let queue = load_queue(settings).await;
    let mirror = queue.sync_deal_folder(deal).await;
    println!(
        "{} {}: {} files, {} processed, status {}",
        style("ok").green(),
        deal,
        mirror.file_count,
        mirror.processed_files,
        mirror.sync_status.as_str()
    );
    for error in &mirror.sync_errors {
        println!("  {} {}: {}", style("warn").yellow(), error.path, error.message);
    }
    queue.persist().await?;
    Ok(())
}

async fn load_queue(settings: &Settings) -> Arc<QueueManager> {
    let store = SnapshotStore::new(settings.state_dir());
    let queue = Arc::new(QueueManager::new(
        settings.queue.clone(),
        settings.deals_dir(),
        store,
    ));
    queue.load_from_store().await;
    queue
}
