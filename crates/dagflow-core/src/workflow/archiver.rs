//! History archiver: moves terminal instances and their node instances into
//! the history tables.
//!
//! Each instance is moved under its instance lock and only while it is still
//! terminal, so a concurrent restart, rerun or skip that reopens it wins.
//! History inserts are duplicate tolerant, so a move that failed halfway
//! (rows copied but not yet deleted) is simply redone by the next sweep.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dagflow_types::command::ArchiveReport;
use dagflow_types::config::{ArchiverConfig, LockConfig};
use dagflow_types::error::EngineError;
use tracing::{debug, info, warn};

use crate::lock::{InstanceLocker, acquire_with_retry, instance_lock_key, release};
use crate::repository::WorkflowStore;

pub struct HistoryArchiver<S: WorkflowStore, L: InstanceLocker> {
    store: Arc<S>,
    locker: Arc<L>,
    lock_config: LockConfig,
    config: ArchiverConfig,
}

impl<S: WorkflowStore, L: InstanceLocker> HistoryArchiver<S, L> {
    pub fn new(store: Arc<S>, locker: Arc<L>, lock_config: LockConfig, config: ArchiverConfig) -> Self {
        Self {
            store,
            locker,
            lock_config,
            config,
        }
    }

    /// Archive every instance that ended before the retention window.
    /// Returns the number archived; a failing move stops the sweep and is
    /// retried next time.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let before = now - Duration::days(i64::from(self.config.retention_days));
        let batch_size = self.config.batch_size.max(1);
        let mut archived = 0;
        'sweep: loop {
            let batch = self
                .store
                .list_archivable_instances(before, batch_size)
                .await?;
            let full = batch.len() as u32 >= batch_size;
            if batch.is_empty() {
                break;
            }
            for inst in &batch {
                match self.archive_one(inst.inst_id).await {
                    Ok(true) => archived += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(inst_id = inst.inst_id, error = %e, "archiving failed, will retry next sweep");
                        break 'sweep;
                    }
                }
            }
            if !full {
                break;
            }
        }
        if archived > 0 {
            info!(archived, %before, "instances archived");
        }
        Ok(archived)
    }

    /// Archive specific terminal instances of one definition. Instances
    /// already in history (or gone, or reopened meanwhile) are reported as
    /// skipped.
    pub async fn archive(&self, def_id: i64, inst_ids: &[i64]) -> Result<ArchiveReport, EngineError> {
        let mut report = ArchiveReport::default();
        let mut pending: Vec<i64> = Vec::new();
        for &inst_id in inst_ids {
            let Some(inst) = self.store.get_instance(inst_id).await? else {
                report.skipped.push(inst_id);
                continue;
            };
            if inst.def_id != def_id {
                return Err(EngineError::invalid(format!(
                    "instance {inst_id} does not belong to definition {def_id}"
                )));
            }
            if !inst.status.is_terminal() {
                return Err(EngineError::invalid(format!(
                    "instance {inst_id} is {}, only ended instances can be archived",
                    inst.status
                )));
            }
            if !pending.contains(&inst_id) {
                pending.push(inst_id);
            }
        }
        for inst_id in pending {
            if self.archive_one(inst_id).await? {
                report.archived.push(inst_id);
            } else {
                report.skipped.push(inst_id);
            }
        }
        debug!(def_id, archived = report.archived.len(), skipped = report.skipped.len(), "archive request handled");
        Ok(report)
    }

    async fn archive_one(&self, inst_id: i64) -> Result<bool, EngineError> {
        let lease = acquire_with_retry(self.locker.as_ref(), &instance_lock_key(inst_id), &self.lock_config).await?;
        let result = self.archive_locked(inst_id).await;
        release(self.locker.as_ref(), &lease).await;
        result
    }

    async fn archive_locked(&self, inst_id: i64) -> Result<bool, EngineError> {
        let Some(inst) = self.store.get_instance(inst_id).await? else {
            return Ok(false);
        };
        if !inst.status.is_terminal() {
            debug!(inst_id, status = %inst.status, "instance reopened, not archiving");
            return Ok(false);
        }
        let nodes = self.store.list_node_insts(inst_id).await?;
        let inserted_insts = self.store.insert_instance_history(std::slice::from_ref(&inst)).await?;
        let inserted_nodes = self.store.insert_node_history(&nodes).await?;
        self.store.delete_node_insts(&[inst_id]).await?;
        self.store.delete_instances(&[inst_id]).await?;

        debug!(
            inst_id,
            inserted_insts,
            nodes = nodes.len(),
            inserted_nodes,
            "instance moved to history"
        );
        Ok(true)
    }
}
