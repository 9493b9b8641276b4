//! Periodic background sweeps: node poller, timeout checker, archiver.
//!
//! Each sweep runs on its own `tokio::time::interval` until the shutdown
//! token is cancelled. A failed pass is logged and retried on the next tick.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dagflow_core::lock::InstanceLocker;
use dagflow_core::repository::WorkflowStore;
use dagflow_core::service::Engine;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Run `pass` every `period` until `shutdown` fires.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    shutdown: CancellationToken,
    mut pass: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!(sweep = name, period_ms = period.as_millis() as u64, "sweep loop started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => pass().await,
            }
        }
        tracing::debug!(sweep = name, "sweep loop stopped");
    })
}

/// Spawn the three engine sweeps.
pub fn spawn_sweeps<S: WorkflowStore, L: InstanceLocker>(
    engine: &Engine<S, L>,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let poller = Arc::clone(&engine.poller);
    let checker = Arc::clone(&engine.checker);
    let archiver = Arc::clone(&engine.archiver);
    let config = &engine.config;

    vec![
        spawn_periodic(
            "poller",
            Duration::from_secs(config.poller.interval_secs),
            shutdown.clone(),
            move || {
                let poller = Arc::clone(&poller);
                async move {
                    match poller.sweep(Utc::now()).await {
                        Ok(0) => {}
                        Ok(polled) => tracing::debug!(polled, "poller sweep done"),
                        Err(e) => tracing::warn!(error = %e, "poller sweep failed"),
                    }
                }
            },
        ),
        spawn_periodic(
            "timeout_checker",
            Duration::from_secs(config.timeout_checker.interval_secs),
            shutdown.clone(),
            move || {
                let checker = Arc::clone(&checker);
                async move {
                    match checker.sweep(Utc::now()).await {
                        Ok(report) => {
                            if report.near_alerted + report.nodes_timed_out + report.insts_timed_out > 0 {
                                tracing::info!(
                                    near_alerted = report.near_alerted,
                                    nodes_timed_out = report.nodes_timed_out,
                                    insts_timed_out = report.insts_timed_out,
                                    "timeout sweep done"
                                );
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "timeout sweep failed"),
                    }
                }
            },
        ),
        spawn_periodic(
            "archiver",
            Duration::from_secs(config.archiver.interval_secs),
            shutdown,
            move || {
                let archiver = Arc::clone(&archiver);
                async move {
                    match archiver.sweep(Utc::now()).await {
                        Ok(0) => {}
                        Ok(archived) => tracing::info!(archived, "archive sweep done"),
                        Err(e) => tracing::warn!(error = %e, "archive sweep failed"),
                    }
                }
            },
        ),
    ]
}
