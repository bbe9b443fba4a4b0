//! taskrouter-worker - connect one worker and log its lifecycle
//!
//! Loads worker options, opens the signaling channel and logs every
//! reservation, task and activity change until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use taskrouter_core::{
    HttpApi, TaskEvent, Worker, WorkerError, WorkerEvent, WorkerOptions, WsTransport,
};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "taskrouter-worker")]
#[command(about = "Connect a task-routing worker and log its reservations")]
#[command(version)]
struct Args {
    /// Options file (default: ~/.taskrouter/worker.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Activity to move to once connected (overrides connect_activity_sid)
    #[arg(short, long)]
    activity: Option<String>,
}

fn log_filter() -> tracing_subscriber::EnvFilter {
    let level = if let Ok(v) = std::env::var("RUST_LOG") {
        v
    } else if let Ok(v) = std::env::var("TASKROUTER_LOG_LEVEL") {
        match v.as_str() {
            "silent" => "off".to_string(),
            "fatal" => "error".to_string(),
            other => other.to_string(),
        }
    } else {
        "info".to_string()
    };

    tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
}

fn log_dir(config_path: &std::path::Path) -> PathBuf {
    config_path
        .parent()
        .map(|p| p.join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"))
}

fn describe(event: &WorkerEvent) {
    match event {
        WorkerEvent::ReservationCreated(reservation) => {
            let task = reservation.task();
            info!(
                sid = %reservation.sid(),
                task_sid = %task.sid(),
                queue_sid = ?task.queue_sid(),
                attributes = ?task.attributes(),
                "Reservation created"
            );
        }
        WorkerEvent::ReservationUpdated { reservation, kind } => {
            info!(sid = %reservation.sid(), event = kind.as_str(), "Reservation updated");
        }
        WorkerEvent::ReservationRemoved(reservation) => {
            info!(sid = %reservation.sid(), status = %reservation.status(), "Reservation removed");
        }
        WorkerEvent::ActivityUpdated(activity) => {
            info!(activity_sid = %activity.sid, name = %activity.name, available = activity.available, "Activity updated");
        }
        WorkerEvent::Ready => info!("Worker ready"),
        WorkerEvent::Disconnected(e) => warn!(error = %e, "Worker disconnected"),
        WorkerEvent::Error(e) => error!(error = %e, "Worker error"),
    }
}

/// Forward a new reservation's task events into the main loop.
fn watch_task(event: &WorkerEvent, task_tx: &mpsc::UnboundedSender<TaskEvent>) {
    if let WorkerEvent::ReservationCreated(reservation) = event {
        let tx = task_tx.clone();
        reservation.task().on(move |e: &TaskEvent| {
            let _ = tx.send(e.clone());
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(WorkerOptions::default_path);

    // Dual-layer logging: stderr + file (daily rotation)
    let log_dir = log_dir(&config_path);
    std::fs::create_dir_all(&log_dir).ok();
    let file_appender = tracing_appender::rolling::daily(&log_dir, "taskrouter-worker.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(log_filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    let mut options = WorkerOptions::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    options.apply_env();
    if let Some(activity) = args.activity {
        options.connect_activity_sid = Some(activity);
    }
    options.validate()?;
    info!(
        config = %config_path.display(),
        worker_sid = %options.worker_sid,
        "Starting worker"
    );

    let api = Arc::new(HttpApi::new(&options)?);
    let mut worker = Worker::new(options, Arc::new(WsTransport::new()), api)?;
    let mut events = worker.subscribe();
    let (task_tx, mut task_rx) = mpsc::unbounded_channel::<TaskEvent>();
    worker.start();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                watch_task(&event, &task_tx);
                describe(&event);
                if let WorkerEvent::Error(WorkerError::Connection(_)) = event {
                    break;
                }
            }
            Some(event) = task_rx.recv() => {
                let task = &event.task;
                info!(
                    sid = %task.sid(),
                    event = event.kind.as_str(),
                    status = %task.status(),
                    reason = ?task.reason(),
                    "Task event"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                break;
            }
        }
    }

    worker.shutdown().await;
    if let Some(activity) = worker.activity() {
        info!(activity_sid = %activity.sid, reservations = worker.reservation_count(), "Final state");
    }
    Ok(())
}
