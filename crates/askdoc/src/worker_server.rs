//! Worker process: runs the registered queue consumers until Ctrl-C
//!
//! Progress events have no client socket in this process, so they are
//! written to the log instead.
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::notify::BroadcastNotifier;
use crate::shared_state::AppState;

/// Run the worker process with `cfg`.
pub async fn run_worker_server(cfg: Config) -> anyhow::Result<()> {
    crate::telemetry::init_tracing();
    crate::metrics::init_metrics()?;
    cfg.print_config();

    info!("Starting document worker process");
    let state = AppState::new(cfg)?;
    let progress_log = spawn_progress_logger(&state.notifier);

    state.initialize_workers()?;
    let started = state.worker_manager.start_all();
    info!(
        "Started {} worker(s): {}",
        started,
        state.worker_manager.worker_names().join(", ")
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, waiting for in-flight jobs");
    state.worker_manager.stop_all().await;
    progress_log.abort();

    info!("Worker process stopped");
    Ok(())
}

fn spawn_progress_logger(notifier: &BroadcastNotifier) -> JoinHandle<()> {
    let mut events = notifier.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(targeted) => info!(
                    target_id = %targeted.target,
                    document_id = %targeted.event.document_id(),
                    "Progress event: {}",
                    serde_json::to_string(&targeted.event).unwrap_or_default()
                ),
                Err(RecvError::Lagged(skipped)) => warn!("Progress log skipped {} event(s)", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    })
}
