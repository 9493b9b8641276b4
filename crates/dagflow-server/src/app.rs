//! Composition root: builds the engine over the configured store and runs
//! it until shutdown.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use dagflow_core::lock::{InstanceLocker, MemoryLocker};
use dagflow_core::repository::WorkflowStore;
use dagflow_core::repository::memory::MemoryWorkflowStore;
use dagflow_core::service::Engine;
use dagflow_infra::config::resolve_database_url;
use dagflow_infra::sqlite::{DatabasePool, SqliteLocker, SqliteWorkflowStore};
use dagflow_infra::workflow::HttpHandler;
use dagflow_observe::event_log::log_event;
use dagflow_types::config::{EngineConfig, StorageBackend};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::sweeps::spawn_sweeps;

pub type SqliteEngine = Engine<SqliteWorkflowStore, SqliteLocker>;
pub type MemoryEngine = Engine<MemoryWorkflowStore, MemoryLocker>;

/// Open the database and build an engine over it.
pub async fn build_sqlite_engine(config: EngineConfig, data_dir: &std::path::Path) -> anyhow::Result<SqliteEngine> {
    tokio::fs::create_dir_all(data_dir).await?;
    let url = resolve_database_url(&config, data_dir);
    let pool = DatabasePool::new(&url).await?;
    tracing::info!(url = %url, "database opened");

    let http = HttpHandler::new()?;
    Ok(Engine::new(
        config,
        Arc::new(SqliteWorkflowStore::new(pool.clone())),
        Arc::new(SqliteLocker::new(pool)),
        move |registry| {
            registry.register(http);
        },
    ))
}

/// Build a volatile in-process engine.
pub fn build_memory_engine(config: EngineConfig) -> anyhow::Result<MemoryEngine> {
    tracing::warn!("using in-memory storage; state is lost on exit");
    let http = HttpHandler::new()?;
    Ok(Engine::new(
        config,
        Arc::new(MemoryWorkflowStore::new()),
        Arc::new(MemoryLocker::new()),
        move |registry| {
            registry.register(http);
        },
    ))
}

/// Build the configured engine and serve until `shutdown` resolves.
pub async fn run(
    config: EngineConfig,
    data_dir: PathBuf,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    match config.storage {
        StorageBackend::Sqlite => {
            let engine = build_sqlite_engine(config, &data_dir).await?;
            serve(&engine, shutdown).await
        }
        StorageBackend::Memory => {
            let engine = build_memory_engine(config)?;
            serve(&engine, shutdown).await
        }
    }
}

/// Start consumers, the event log and the sweeps; stop them all once
/// `shutdown` resolves.
pub async fn serve<S: WorkflowStore, L: InstanceLocker>(
    engine: &Engine<S, L>,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let token = CancellationToken::new();
    let mut handles = start(engine, token.clone()).await?;

    shutdown.await;
    tracing::info!("shutdown requested");
    token.cancel();

    for handle in handles.drain(..) {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "background task ended abnormally");
        }
    }
    engine.stop().await?;
    Ok(())
}

/// Everything `serve` runs in the background, tied to `token`.
pub async fn start<S: WorkflowStore, L: InstanceLocker>(
    engine: &Engine<S, L>,
    token: CancellationToken,
) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let mut handles = engine.start(token.clone()).await?;
    handles.push(spawn_event_log(engine, token.clone()));
    handles.extend(spawn_sweeps(engine, token));
    Ok(handles)
}

fn spawn_event_log<S: WorkflowStore, L: InstanceLocker>(
    engine: &Engine<S, L>,
    token: CancellationToken,
) -> JoinHandle<()> {
    let mut events = engine.events.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => log_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event log lagged behind the event bus");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    })
}

/// Wait for Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "failed to install SIGTERM handler");
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
}
