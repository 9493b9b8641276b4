//! Timeout checker: enforces node deadlines, raises near-timeout alerts,
//! and expires instances past their own deadline.
//!
//! Every write is compare-and-set, so overlapping sweeps (or a sweep racing
//! an operator) are harmless.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dagflow_types::config::TimeoutCheckerConfig;
use dagflow_types::error::EngineError;
use dagflow_types::event::EngineEvent;
use dagflow_types::instance::InstStatus;
use dagflow_types::message::BusMessage;
use dagflow_types::node::{NodeInst, NodeStatus, NodeUpdate};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::executor::{ENGINE_OPERATOR, WorkflowExecutor};
use crate::lock::InstanceLocker;
use crate::message::MessageBus;
use crate::repository::WorkflowStore;

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeoutReport {
    pub near_alerted: usize,
    pub nodes_timed_out: usize,
    pub insts_timed_out: usize,
}

enum NodeAction {
    TimedOut,
    NearAlerted,
    Nothing,
}

pub struct TimeoutChecker<S: WorkflowStore, L: InstanceLocker> {
    store: Arc<S>,
    executor: Arc<WorkflowExecutor<S, L>>,
    bus: MessageBus,
    config: TimeoutCheckerConfig,
    workers: Arc<Semaphore>,
}

impl<S: WorkflowStore, L: InstanceLocker> TimeoutChecker<S, L> {
    pub fn new(
        store: Arc<S>,
        executor: Arc<WorkflowExecutor<S, L>>,
        bus: MessageBus,
        config: TimeoutCheckerConfig,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.workers.max(1)));
        Self {
            store,
            executor,
            bus,
            config,
            workers,
        }
    }

    pub async fn sweep(self: &Arc<Self>, now: DateTime<Utc>) -> Result<TimeoutReport, EngineError> {
        let mut report = TimeoutReport::default();

        let nodes = self
            .store
            .list_deadline_nodes(now, self.config.batch_size)
            .await?;
        let mut set = JoinSet::new();
        for node in nodes {
            let permit = Arc::clone(&self.workers)
                .acquire_owned()
                .await
                .map_err(|_| EngineError::internal("timeout worker pool closed"))?;
            let checker = Arc::clone(self);
            set.spawn(async move {
                let _permit = permit;
                let node_inst_id = node.node_inst_id;
                (node_inst_id, checker.check_node(node, now).await)
            });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(NodeAction::TimedOut))) => report.nodes_timed_out += 1,
                Ok((_, Ok(NodeAction::NearAlerted))) => report.near_alerted += 1,
                Ok((_, Ok(NodeAction::Nothing))) => {}
                Ok((node_inst_id, Err(e))) => warn!(node_inst_id, error = %e, "node deadline check failed"),
                Err(e) => warn!(error = %e, "node deadline task panicked"),
            }
        }

        let insts = self
            .store
            .list_expired_instances(now, self.config.batch_size)
            .await?;
        let mut set = JoinSet::new();
        for inst in insts {
            let permit = Arc::clone(&self.workers)
                .acquire_owned()
                .await
                .map_err(|_| EngineError::internal("timeout worker pool closed"))?;
            let executor = Arc::clone(&self.executor);
            set.spawn(async move {
                let _permit = permit;
                let result = executor
                    .terminate(
                        inst.inst_id,
                        InstStatus::Timeout,
                        ENGINE_OPERATOR,
                        "instance deadline exceeded",
                    )
                    .await;
                (inst.inst_id, result)
            });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((inst_id, Ok(true))) => {
                    info!(inst_id, "instance timed out");
                    report.insts_timed_out += 1;
                }
                Ok((_, Ok(false))) => {}
                Ok((inst_id, Err(e))) => warn!(inst_id, error = %e, "instance deadline check failed"),
                Err(e) => warn!(error = %e, "instance deadline task panicked"),
            }
        }

        if report != TimeoutReport::default() {
            debug!(?report, "timeout sweep finished");
        }
        Ok(report)
    }

    async fn check_node(&self, node: NodeInst, now: DateTime<Utc>) -> Result<NodeAction, EngineError> {
        if node.timeout_at.is_some_and(|at| at <= now) {
            let moved = self
                .store
                .transition_node(
                    node.node_inst_id,
                    node.inst_id,
                    &NodeStatus::LIVE,
                    NodeStatus::Timeout,
                    &NodeUpdate::failed("node deadline exceeded", now),
                )
                .await?;
            if !moved {
                return Ok(NodeAction::Nothing);
            }
            warn!(
                inst_id = node.inst_id,
                node_inst_id = node.node_inst_id,
                ref_name = %node.ref_name,
                "node timed out"
            );
            self.bus.events().publish(EngineEvent::NodeFinished {
                inst_id: node.inst_id,
                node_inst_id: node.node_inst_id,
                ref_name: node.ref_name.clone(),
                status: NodeStatus::Timeout,
            });
            self.bus.publish(BusMessage::drive(node.inst_id, "node timed out"))?;
            return Ok(NodeAction::TimedOut);
        }

        if !node.near_timeout_alerted && node.near_timeout_at.is_some_and(|at| at <= now) {
            if !self
                .store
                .mark_near_timeout_alerted(node.node_inst_id, node.inst_id)
                .await?
            {
                return Ok(NodeAction::Nothing);
            }
            warn!(
                inst_id = node.inst_id,
                node_inst_id = node.node_inst_id,
                ref_name = %node.ref_name,
                timeout_at = ?node.timeout_at,
                "node is close to its deadline"
            );
            self.bus.events().publish(EngineEvent::NodeNearTimeout {
                inst_id: node.inst_id,
                node_inst_id: node.node_inst_id,
                ref_name: node.ref_name.clone(),
            });
            return Ok(NodeAction::NearAlerted);
        }

        Ok(NodeAction::Nothing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::instance::InstanceRepository;
    use crate::repository::node::NodeRepository;
    use crate::test_support::{Harness, node};
    use chrono::Duration;
    use dagflow_types::definition::NodeType;
    use serde_json::json;

    #[tokio::test]
    async fn test_near_timeout_alerts_once_without_status_change() {
        let h = Harness::new();
        let mut wait = node(NodeType::Wait, 0);
        wait.timeout_secs = Some(3600);
        wait.near_timeout_secs = Some(60);
        let def = h.enabled_def(vec![("w", wait)]).await;
        let inst = h.start(def.def_id, json!({})).await;
        h.settle().await;
        let mut events = h.bus.events().subscribe();

        let later = Utc::now() + Duration::seconds(120);
        let report = h.checker.sweep(later).await.unwrap();
        assert_eq!(report.near_alerted, 1);
        assert_eq!(report.nodes_timed_out, 0);
        assert!(matches!(events.try_recv(), Ok(EngineEvent::NodeNearTimeout { .. })));

        let again = h.checker.sweep(later).await.unwrap();
        assert_eq!(again, TimeoutReport::default());

        let w = h.store.list_node_insts(inst.inst_id).await.unwrap()[0].clone();
        assert_eq!(w.status, NodeStatus::Waiting);
        assert!(w.near_timeout_alerted);
    }

    #[tokio::test]
    async fn test_node_timeout_fails_instance() {
        let h = Harness::new();
        let mut wait = node(NodeType::Wait, 0);
        wait.timeout_secs = Some(10);
        let def = h.enabled_def(vec![("w", wait)]).await;
        let inst = h.start(def.def_id, json!({})).await;
        h.settle().await;

        let later = Utc::now() + Duration::seconds(30);
        assert_eq!(h.checker.sweep(later).await.unwrap().nodes_timed_out, 1);
        // Monotonic: a second sweep finds nothing to do.
        assert_eq!(h.checker.sweep(later).await.unwrap(), TimeoutReport::default());
        h.settle().await;

        let inst = h.store.get_instance(inst.inst_id).await.unwrap().unwrap();
        assert_eq!(inst.status, InstStatus::Failed);
        let w = h.store.list_node_insts(inst.inst_id).await.unwrap()[0].clone();
        assert_eq!(w.status, NodeStatus::Timeout);
    }

    #[tokio::test]
    async fn test_instance_deadline_times_out_and_cancels_nodes() {
        let h = Harness::new();
        let def = h
            .enabled_def_with(vec![("w", node(NodeType::Wait, 0))], |d| d.timeout_secs = Some(5))
            .await;
        let inst = h.start(def.def_id, json!({})).await;
        h.settle().await;

        let report = h.checker.sweep(Utc::now() + Duration::seconds(10)).await.unwrap();
        assert_eq!(report.insts_timed_out, 1);

        let inst = h.store.get_instance(inst.inst_id).await.unwrap().unwrap();
        assert_eq!(inst.status, InstStatus::Timeout);
        let w = h.store.list_node_insts(inst.inst_id).await.unwrap()[0].clone();
        assert_eq!(w.status, NodeStatus::Cancelled);
    }
}
