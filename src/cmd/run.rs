//! The long-running worker loop: `edit-worker run`.

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use edit_worker::config::WorkerConfig;
use edit_worker::consumer::Worker;
use edit_worker::store::DbHandle;

use super::super::Cli;

pub async fn cmd_run(
    mut config: WorkerConfig,
    cli: &Cli,
    worker_id: Option<String>,
    max_units: Option<usize>,
) -> Result<()> {
    if let Some(id) = worker_id {
        config.worker.id = Some(id);
    }
    if let Some(max) = max_units {
        config.worker.max_units = max;
    }
    config.ensure_valid()?;

    // Held until exit so the file writer flushes.
    let _guard = edit_worker::logging::init(&config.logging, cli.verbose)?;
    for warning in config.validate() {
        warn!("{}", warning);
    }

    let db = DbHandle::open(&config.worker.database).with_context(|| {
        format!(
            "Failed to open database at {}",
            config.worker.database.display()
        )
    })?;
    std::fs::create_dir_all(&config.worker.workspace_root).with_context(|| {
        format!(
            "Failed to create workspace root {}",
            config.worker.workspace_root.display()
        )
    })?;

    let worker = Worker::new(config, db);
    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    worker.run(shutdown).await
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown requested, finishing in-flight work and releasing claims");
    shutdown.cancel();
}
