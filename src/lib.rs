//! HotReel -- control plane for scheduled, cancellable hot-list collection runs.
//!
//! This crate provides the run scheduler, the progress event fan-out, the
//! worker boundary with its process-backed implementation, run history
//! storage, and the HTTP API that exposes them.

pub mod api;
pub mod config;
pub mod events;
pub mod scheduler;
pub mod storage;
pub mod worker;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::HotReelConfig;
use crate::events::EventPublisher;
use crate::scheduler::{Scheduler, SqliteHistory};
use crate::worker::{CommandWorker, SharedWorker};

/// Wire a scheduler from configuration around the given worker.
pub fn build_scheduler(config: &HotReelConfig, worker: SharedWorker) -> Result<Scheduler> {
    tracing::info!(db_path = %config.storage.db_path.display(), "Initializing database");
    let pool = storage::open_pool(&config.storage.db_path)?;

    Ok(Scheduler::with_grace(
        worker,
        Arc::new(SqliteHistory::new(pool)),
        EventPublisher::new(config.scheduler.event_queue_capacity),
        config.scheduler.stop_grace(),
    ))
}

/// Start the HotReel daemon: scheduler, optional recurrence, and API server.
pub async fn serve(config: HotReelConfig) -> Result<()> {
    config.validate()?;

    // 1. Scheduler + worker
    let worker: SharedWorker = Arc::new(CommandWorker::new(config.worker.clone()));
    let scheduler = build_scheduler(&config, worker)?;

    // 2. Recurring mode from config
    if let Some(params) = config.recurring.params() {
        scheduler.arm(params)?;
        tracing::info!(
            interval_minutes = config.recurring.interval_minutes,
            "Recurring collection armed from configuration"
        );
    }

    // 3. API server
    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.server.bind))?;
    let state = api::state::AppState::new(scheduler, config.scheduler.history_limit);

    tracing::info!(%addr, "HotReel listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    run_server(listener, state, shutdown_signal()).await
}

/// Serve the API on `listener` until `shutdown` resolves.
///
/// On shutdown the scheduler is disarmed and its active run stopped, open
/// event streams are closed, then in-flight requests are drained.
pub async fn run_server<F>(
    listener: tokio::net::TcpListener,
    state: api::state::AppState,
    shutdown: F,
) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let scheduler = state.scheduler.clone();
    let streams = state.shutdown.clone();
    let app = api::router(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            scheduler.shutdown();
            streams.cancel();
        })
        .await?;

    tracing::info!("HotReel stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {}", e);
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
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("received shutdown signal, starting graceful shutdown");
}
