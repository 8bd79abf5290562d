//! `rendq` Daemon
//!
//! Runs the render queue: restores persisted jobs, dispatches render engine
//! processes and logs every queue event until shut down.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use rendq_core::SettingsUpdate;
use rendq_core::config::{Config, database_path, load_config};
use rendq_core::tracing_init::{default_filter, init_tracing};
use rendq_daemon::queue::{JobSpec, QueueEvent, QueueScheduler, SchedulerConfig};
use rendq_daemon::session::{EventHub, SessionEvent};
use rendq_daemon::storage::Database;
use rendq_daemon::supervisor::{ProcessSupervisor, SupervisorConfig};

/// How often `--exit-when-idle` checks for remaining work.
const IDLE_CHECK_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "rendq-daemon")]
#[command(version, about = "rendq daemon - Blender render queue")]
struct Args {
    /// Database file path
    #[arg(long, env = "RENDQ_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Path to the `blender` executable
    #[arg(long, env = "RENDQ_BLENDER_BIN")]
    blender_bin: Option<PathBuf>,

    /// Maximum concurrent render processes
    #[arg(long, env = "RENDQ_MAX_CONCURRENT")]
    max_concurrent: Option<u32>,

    /// Scheduler polling interval in milliseconds
    #[arg(long, env = "RENDQ_POLL_INTERVAL_MS")]
    poll_interval_ms: Option<u64>,

    /// Milliseconds to wait after SIGTERM before killing a render's process group
    #[arg(long, env = "RENDQ_TERMINATE_TIMEOUT_MS")]
    terminate_timeout_ms: Option<u64>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, env = "RENDQ_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "RENDQ_LOG_JSON")]
    log_json: bool,

    /// Directory searched for `.rendq/settings.json` (defaults to the current directory)
    #[arg(long)]
    project_dir: Option<PathBuf>,

    /// Render command to add to the queue at startup (repeatable)
    #[arg(long = "enqueue", value_name = "COMMAND")]
    enqueue: Vec<String>,

    /// Start processing immediately
    #[arg(long)]
    start: bool,

    /// Exit once nothing is running, scheduled, or ready to run
    #[arg(long)]
    exit_when_idle: bool,
}

impl Args {
    /// CLI values take precedence over every config source.
    fn apply(&self, config: &mut Config) {
        if let Some(path) = &self.db_path {
            config.daemon.database_path = Some(path.clone());
        }
        if let Some(bin) = &self.blender_bin {
            config.daemon.blender_bin.clone_from(bin);
        }
        if let Some(ms) = self.poll_interval_ms {
            config.daemon.poll_interval_ms = ms;
        }
        if let Some(ms) = self.terminate_timeout_ms {
            config.daemon.terminate_timeout_ms = ms;
        }
        if let Some(level) = &self.log_level {
            config.daemon.log_level.clone_from(level);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let project_dir = args
        .project_dir
        .clone()
        .or_else(|| std::env::current_dir().ok());
    let mut config = load_config(project_dir.as_deref())?;
    args.apply(&mut config);

    init_tracing(&default_filter(&config.daemon.log_level), args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        blender_bin = %config.daemon.blender_bin.display(),
        "Starting rendq-daemon"
    );

    // Initialize database
    let db_path = config.daemon.database_path.clone().or_else(database_path);
    if let Some(path) = &db_path {
        info!(path = %path.display(), "Opening database");
    }
    let db = Database::open_or_in_memory(db_path.as_deref()).await?;

    let supervisor = Arc::new(ProcessSupervisor::new(
        SupervisorConfig::with_terminate_timeout(Duration::from_millis(
            config.daemon.terminate_timeout_ms,
        )),
    ));
    let hub = Arc::new(EventHub::with_defaults());
    let scheduler = Arc::new(QueueScheduler::new(
        supervisor,
        Arc::clone(&hub),
        db,
        SchedulerConfig::from_config(&config),
    ));

    // Subscribe before anything can publish.
    let mut events = hub.subscribe();

    scheduler.load().await;
    if let Some(max_concurrent) = args.max_concurrent {
        scheduler
            .update_settings(SettingsUpdate {
                max_concurrent: Some(max_concurrent),
                ..SettingsUpdate::default()
            })
            .await;
    }
    for command in &args.enqueue {
        let job = scheduler
            .add_job(JobSpec::from_command(command.clone()))
            .await?;
        info!(job_id = %job.id, command = %job.command, "Enqueued from command line");
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let tasks = scheduler.spawn(&shutdown_rx);
    if args.start {
        scheduler.start_processing().await;
    }

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut signal = tokio::spawn(async move {
        #[cfg(unix)]
        let sigterm_future = sigterm.recv();
        #[cfg(not(unix))]
        let sigterm_future = std::future::pending::<Option<()>>();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C shutdown signal"),
            _ = sigterm_future => info!("Received SIGTERM shutdown signal"),
        }
    });

    let mut idle_check = tokio::time::interval(IDLE_CHECK_INTERVAL);
    info!("Render queue ready");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event log lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = idle_check.tick(), if args.exit_when_idle => {
                if !scheduler.has_work().await {
                    info!("Queue is idle, exiting");
                    break;
                }
            }
            _ = &mut signal => break,
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler.shutdown().await {
        error!(error = %e, "Final queue flush failed");
    }
    for task in tasks {
        let _ = task.await;
    }

    info!("Daemon stopped");
    Ok(())
}

fn log_event(event: &QueueEvent) {
    match event {
        QueueEvent::JobAdded { job } => {
            info!(job_id = %job.id, name = %job.name, status = %job.status, "Job added");
        }
        QueueEvent::JobUpdated { job } => {
            debug!(job_id = %job.id, status = %job.status, "Job updated");
        }
        QueueEvent::JobRemoved { job_id } => info!(job_id, "Job removed"),
        QueueEvent::JobFinished {
            job_id,
            status,
            cancelled,
            error,
        } => info!(job_id, %status, cancelled, error = ?error, "Job finished"),
        QueueEvent::HistoryRecorded { record } => {
            debug!(job_id = %record.job_id, status = %record.status, duration_ms = record.duration_ms, "History recorded");
        }
        QueueEvent::Session(message) => match &message.event {
            SessionEvent::Progress { snapshot } => debug!(
                job_id = %message.job_id,
                frame = snapshot.current_frame,
                sample = snapshot.current_sample,
                progress = snapshot.progress,
                "Render progress"
            ),
            SessionEvent::Complete {
                exit_code,
                cancelled,
            } => debug!(job_id = %message.job_id, exit_code = ?exit_code, cancelled, "Render complete"),
            // Lines and errors are logged by the session itself.
            SessionEvent::Log { .. } | SessionEvent::Critical { .. } | SessionEvent::Error { .. } => {}
        },
        QueueEvent::SettingsChanged { settings } => info!(?settings, "Queue settings changed"),
        QueueEvent::ProcessingChanged { processing } => {
            info!(processing, "Queue processing changed");
        }
    }
}
