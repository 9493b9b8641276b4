//! Workflow executor: advances one instance per drive event.
//!
//! A drive runs under the instance lock and loops
//! refresh -> decide -> create wavefront rows -> run scheduled nodes
//! while nodes keep finishing synchronously, up to `max_sync_steps` rounds.
//! Terminal instance transitions are compare-and-set, so concurrent
//! finishers (operator cancel, timeout checker, decider) resolve to one
//! winner.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use dagflow_types::config::{ExecutorConfig, LockConfig};
use dagflow_types::definition::WorkflowDef;
use dagflow_types::error::EngineError;
use dagflow_types::event::EngineEvent;
use dagflow_types::instance::{InstStatus, InstTransition, SchedNodeInst, WorkflowInst};
use dagflow_types::message::{BusMessage, DriveEvent};
use dagflow_types::node::{NewNodeInst, NodeInst, NodeStatus, NodeUpdate};
use dagflow_types::trigger::TriggerScope;
use tracing::{debug, info, warn};

use super::decider::{Decision, decide};
use super::expression::WorkflowEvaluator;
use super::handlers::child_outcome;
use super::runner::{NodeRunner, PollOutcome};
use super::trigger::TriggerRegistry;
use super::updater::{WorkflowUpdater, reconcile_sched_nodes, record_wavefront};
use crate::lock::{InstanceLocker, acquire_with_retry, instance_lock_key, release};
use crate::message::MessageBus;
use crate::repository::WorkflowStore;

/// Operator recorded on transitions the engine makes by itself.
pub const ENGINE_OPERATOR: &str = "engine";

pub struct WorkflowExecutor<S: WorkflowStore, L: InstanceLocker> {
    store: Arc<S>,
    locker: Arc<L>,
    lock_config: LockConfig,
    config: ExecutorConfig,
    bus: MessageBus,
    updater: Arc<WorkflowUpdater<S>>,
    runner: Arc<NodeRunner<S>>,
    triggers: Arc<TriggerRegistry<S>>,
}

impl<S: WorkflowStore, L: InstanceLocker> WorkflowExecutor<S, L> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<S>,
        locker: Arc<L>,
        lock_config: LockConfig,
        config: ExecutorConfig,
        bus: MessageBus,
        updater: Arc<WorkflowUpdater<S>>,
        runner: Arc<NodeRunner<S>>,
        triggers: Arc<TriggerRegistry<S>>,
    ) -> Self {
        Self {
            store,
            locker,
            lock_config,
            config,
            bus,
            updater,
            runner,
            triggers,
        }
    }

    /// Handle one drive event. Lock contention surfaces as `Retryable` so
    /// the bus redelivers the event later.
    pub async fn drive(&self, event: &DriveEvent) -> Result<(), EngineError> {
        let lease = acquire_with_retry(
            self.locker.as_ref(),
            &instance_lock_key(event.inst_id),
            &self.lock_config,
        )
        .await?;
        let result = self.drive_locked(event.inst_id, &event.cause).await;
        release(self.locker.as_ref(), &lease).await;
        result
    }

    async fn drive_locked(&self, inst_id: i64, cause: &str) -> Result<(), EngineError> {
        let Some(mut inst) = self.store.get_instance(inst_id).await? else {
            debug!(inst_id, cause, "drive for unknown instance ignored");
            return Ok(());
        };
        if inst.status != InstStatus::Running {
            debug!(inst_id, status = %inst.status, cause, "instance not running, drive ignored");
            return Ok(());
        }
        let def = self
            .store
            .get_definition(inst.def_id, Some(inst.version))
            .await?
            .ok_or_else(|| {
                EngineError::internal(format!(
                    "definition {} version {} of instance {inst_id} is missing",
                    inst.def_id, inst.version
                ))
            })?;

        debug!(inst_id, cause, "driving instance");
        for step in 0..self.config.max_sync_steps.max(1) {
            let rows = self.updater.refresh(&mut inst).await?;

            let decision = match self.decide(&def, &inst) {
                Ok(decision) => decision,
                Err(EngineError::InvalidArgument(msg)) => {
                    warn!(inst_id, error = %msg, "definition cannot be evaluated, failing instance");
                    self.save(&inst).await?;
                    self.finish(&mut inst, InstStatus::Failed, ENGINE_OPERATOR, &msg)
                        .await?;
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            if let Some(verdict) = decision.verdict {
                self.save(&inst).await?;
                self.finish(&mut inst, verdict.status, ENGINE_OPERATOR, &verdict.reason)
                    .await?;
                return Ok(());
            }

            let mut to_run: Vec<NodeInst> = rows
                .into_iter()
                .filter(|n| {
                    n.status == NodeStatus::Scheduled
                        && inst
                            .sched_node_insts
                            .iter()
                            .any(|s| s.node_inst_id == n.node_inst_id)
                })
                .collect();
            let mut progressed = decision.wavefront.iter().any(|r| r.skip);
            to_run.extend(self.schedule_wavefront(&def, &mut inst, &decision).await?);
            self.save(&inst).await?;

            for node in &to_run {
                if let Some(status) = self.runner.run(&inst, &def, node).await? {
                    progressed |= status.is_terminal();
                }
            }

            if !progressed {
                self.updater.refresh(&mut inst).await?;
                self.save(&inst).await?;
                debug!(inst_id, step, "drive settled");
                return Ok(());
            }
        }

        debug!(inst_id, "sync step budget used up, continuing on a fresh drive");
        self.bus.publish(BusMessage::drive(inst_id, "continue"))?;
        Ok(())
    }

    /// The evaluator is not `Send`; it lives only inside this call.
    fn decide(&self, def: &WorkflowDef, inst: &WorkflowInst) -> Result<Decision, EngineError> {
        let evaluator = WorkflowEvaluator::new();
        decide(def, &inst.sched_node_insts, &inst.context, &evaluator)
    }

    /// Create node rows for a wavefront and append it to the execute path.
    /// Returns the rows created as `Scheduled`.
    async fn schedule_wavefront(
        &self,
        def: &WorkflowDef,
        inst: &mut WorkflowInst,
        decision: &Decision,
    ) -> Result<Vec<NodeInst>, EngineError> {
        let now = Utc::now();
        let mut scheduled = Vec::new();
        let mut refs = Vec::with_capacity(decision.wavefront.len());
        for ready in &decision.wavefront {
            let node_def = def.nodes.get(&ready.ref_name).ok_or_else(|| {
                EngineError::internal(format!("decider returned unknown node '{}'", ready.ref_name))
            })?;
            let status = if ready.skip {
                NodeStatus::Skipped
            } else {
                NodeStatus::Scheduled
            };
            let deadline = |secs: Option<u64>| secs.map(|s| now + Duration::seconds(s as i64));
            let created = self
                .store
                .create_node_inst(&NewNodeInst {
                    def_id: inst.def_id,
                    inst_id: inst.inst_id,
                    ref_name: ready.ref_name.clone(),
                    node_type: node_def.node_type,
                    status,
                    nexts: node_def.nexts.iter().map(|e| e.ref_name.clone()).collect(),
                    parents: def
                        .parents_of(&ready.ref_name)
                        .into_iter()
                        .map(str::to_string)
                        .collect(),
                    error: None,
                    scheduled_at: now,
                    timeout_at: deadline(node_def.timeout_secs),
                    near_timeout_at: deadline(node_def.near_timeout_secs),
                })
                .await?;

            if ready.skip {
                debug!(inst_id = inst.inst_id, ref_name = %ready.ref_name, "node skipped by condition");
            } else {
                debug!(
                    inst_id = inst.inst_id,
                    node_inst_id = created.node_inst_id,
                    ref_name = %ready.ref_name,
                    "node scheduled"
                );
                self.bus.events().publish(EngineEvent::NodeScheduled {
                    inst_id: inst.inst_id,
                    node_inst_id: created.node_inst_id,
                    ref_name: ready.ref_name.clone(),
                });
                scheduled.push(created);
            }
            refs.push(ready.ref_name.clone());
        }
        record_wavefront(inst, refs);
        Ok(scheduled)
    }

    async fn save(&self, inst: &WorkflowInst) -> Result<(), EngineError> {
        if !self.store.save_instance(inst).await? {
            return Err(EngineError::not_found(format!("instance {}", inst.inst_id)));
        }
        Ok(())
    }

    /// Move a live instance to a terminal status under its lock. Returns
    /// `false` when it had already ended.
    pub async fn terminate(
        &self,
        inst_id: i64,
        to: InstStatus,
        operator: &str,
        reason: &str,
    ) -> Result<bool, EngineError> {
        let lease = acquire_with_retry(
            self.locker.as_ref(),
            &instance_lock_key(inst_id),
            &self.lock_config,
        )
        .await?;
        let result = self.terminate_locked(inst_id, to, operator, reason).await;
        release(self.locker.as_ref(), &lease).await;
        result
    }

    async fn terminate_locked(
        &self,
        inst_id: i64,
        to: InstStatus,
        operator: &str,
        reason: &str,
    ) -> Result<bool, EngineError> {
        let mut inst = self
            .store
            .get_instance(inst_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("instance {inst_id}")))?;
        if inst.status.is_terminal() {
            return Ok(false);
        }
        self.finish(&mut inst, to, operator, reason).await
    }

    /// Compare-and-set the instance into `to`, then clean up: cancel live
    /// nodes, deactivate instance and node triggers, notify a parent.
    /// Caller holds the instance lock.
    async fn finish(
        &self,
        inst: &mut WorkflowInst,
        to: InstStatus,
        operator: &str,
        reason: &str,
    ) -> Result<bool, EngineError> {
        let now = Utc::now();
        let change = InstTransition {
            operator: Some(operator.to_string()),
            reason: Some(reason.to_string()),
            ended_at: Some(now),
        };
        let won = self
            .store
            .transition_instance(inst.inst_id, inst.def_id, &InstStatus::LIVE, to, &change)
            .await?;
        if !won {
            debug!(inst_id = inst.inst_id, %to, "instance already terminal");
            return Ok(false);
        }
        inst.status = to;
        inst.reason = Some(reason.to_string());
        inst.ended_at = Some(now);

        self.cancel_live_nodes(inst, &format!("instance {to}")).await?;
        self.triggers
            .unregister(&TriggerScope::instance(inst.def_id, inst.version, inst.inst_id))
            .await?;
        self.triggers
            .unregister(&TriggerScope::node(inst.def_id, inst.version, inst.inst_id, None))
            .await?;

        info!(inst_id = inst.inst_id, status = %to, operator, reason, "instance finished");
        self.bus.events().publish(EngineEvent::InstanceFinished {
            inst_id: inst.inst_id,
            status: to,
        });
        self.notify_parent(inst).await?;
        Ok(true)
    }

    /// Cancel every live node of an instance. Returns how many moved.
    pub async fn cancel_live_nodes(&self, inst: &WorkflowInst, reason: &str) -> Result<usize, EngineError> {
        let rows = self.store.list_node_insts(inst.inst_id).await?;
        self.cancel_nodes(inst, rows, reason).await
    }

    /// Cancel the live nodes that reconciliation under the instance's
    /// current restart mark no longer keeps. Kept live nodes stay untouched.
    pub async fn cancel_superseded_nodes(&self, inst: &WorkflowInst, reason: &str) -> Result<usize, EngineError> {
        let rows = self.store.list_node_insts(inst.inst_id).await?;
        let all: Vec<SchedNodeInst> = rows
            .iter()
            .map(|n| SchedNodeInst::new(n.node_inst_id, &n.ref_name, n.status))
            .collect();
        let kept: HashSet<i64> = reconcile_sched_nodes(&all, inst.restart_mark().as_ref())
            .into_iter()
            .map(|s| s.node_inst_id)
            .collect();
        let superseded = rows
            .into_iter()
            .filter(|n| !kept.contains(&n.node_inst_id))
            .collect();
        self.cancel_nodes(inst, superseded, reason).await
    }

    async fn cancel_nodes(&self, inst: &WorkflowInst, rows: Vec<NodeInst>, reason: &str) -> Result<usize, EngineError> {
        let now = Utc::now();
        let mut cancelled = 0;
        for node in rows {
            if node.status.is_terminal() {
                continue;
            }
            let moved = self
                .store
                .transition_node(
                    node.node_inst_id,
                    inst.inst_id,
                    &NodeStatus::LIVE,
                    NodeStatus::Cancelled,
                    &NodeUpdate::failed(reason, now),
                )
                .await?;
            if moved {
                cancelled += 1;
                self.bus.events().publish(EngineEvent::NodeFinished {
                    inst_id: inst.inst_id,
                    node_inst_id: node.node_inst_id,
                    ref_name: node.ref_name.clone(),
                    status: NodeStatus::Cancelled,
                });
            }
        }
        if cancelled > 0 {
            debug!(inst_id = inst.inst_id, cancelled, "live nodes cancelled");
        }
        Ok(cancelled)
    }

    /// Resolve the waiting sub-workflow node of a finished child's parent.
    async fn notify_parent(&self, child: &WorkflowInst) -> Result<(), EngineError> {
        let (Some(parent_id), Some(parent_node_id)) = (child.parent_inst_id, child.parent_node_inst_id) else {
            return Ok(());
        };
        let now = Utc::now();
        let (status, update) = match child_outcome(child) {
            Some(PollOutcome::Completed(output)) => (
                NodeStatus::Completed,
                NodeUpdate {
                    poll_output: Some(output.clone()),
                    ..NodeUpdate::completed(output, now)
                },
            ),
            Some(PollOutcome::Failed(message)) => (NodeStatus::Failed, NodeUpdate::failed(message, now)),
            _ => return Ok(()),
        };
        let moved = self
            .store
            .transition_node(parent_node_id, parent_id, &[NodeStatus::Waiting], status, &update)
            .await?;
        if moved {
            debug!(
                inst_id = child.inst_id,
                parent_inst_id = parent_id,
                parent_node_inst_id = parent_node_id,
                %status,
                "parent node resolved by sub-workflow"
            );
            self.bus
                .publish(BusMessage::drive(parent_id, "sub-workflow finished"))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::instance::InstanceRepository;
    use crate::repository::node::NodeRepository;
    use crate::test_support::{Harness, node};
    use dagflow_types::definition::{NodeDef, NodeType};
    use serde_json::json;

    #[tokio::test]
    async fn test_linear_workflow_runs_to_success() {
        let h = Harness::new();
        let def = h
            .enabled_def(vec![
                ("a", node(NodeType::Noop, 0).with_next("b").with_params(json!({"v": 1}))),
                ("b", node(NodeType::Noop, 1).with_next("c")),
                ("c", node(NodeType::Noop, 2)),
            ])
            .await;
        let inst = h.start(def.def_id, json!({"order": 7})).await;
        h.settle().await;

        let inst = h.store.get_instance(inst.inst_id).await.unwrap().unwrap();
        assert_eq!(inst.status, InstStatus::Succeed);
        assert_eq!(
            inst.execute_path,
            vec![vec!["a".to_string()], vec!["b".to_string()], vec!["c".to_string()]]
        );
        assert_eq!(inst.context["order"], 7);
        assert_eq!(inst.context["a"], json!({"v": 1}));
        assert!(inst.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_node_fails_instance() {
        let h = Harness::new();
        let def = h
            .enabled_def(vec![
                ("a", node(NodeType::Delay, 0).with_next("b").with_params(json!({"secs": 1}))),
                ("b", node(NodeType::Noop, 1)),
            ])
            .await;
        let inst = h.start(def.def_id, json!({})).await;
        h.settle().await;
        let nodes = h.store.list_node_insts(inst.inst_id).await.unwrap();
        let a = nodes[0].clone();
        assert_eq!(a.status, NodeStatus::Waiting);

        h.store
            .transition_node(
                a.node_inst_id,
                a.inst_id,
                &[NodeStatus::Waiting],
                NodeStatus::Failed,
                &NodeUpdate::failed("boom", Utc::now()),
            )
            .await
            .unwrap();
        h.drive(inst.inst_id).await;

        let inst = h.store.get_instance(inst.inst_id).await.unwrap().unwrap();
        assert_eq!(inst.status, InstStatus::Failed);
        assert_eq!(h.store.list_node_insts(inst.inst_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_false_condition_skips_branch() {
        let h = Harness::new();
        let def = h
            .enabled_def(vec![
                (
                    "a",
                    node(NodeType::Noop, 0)
                        .with_conditional_next("b", "context.approved == true")
                        .with_next("c"),
                ),
                ("b", node(NodeType::Noop, 1)),
                ("c", node(NodeType::Noop, 2)),
            ])
            .await;
        let inst = h.start(def.def_id, json!({"approved": false})).await;
        h.settle().await;

        let inst = h.store.get_instance(inst.inst_id).await.unwrap().unwrap();
        assert_eq!(inst.status, InstStatus::Succeed);
        let nodes = h.store.list_node_insts(inst.inst_id).await.unwrap();
        let b = nodes.iter().find(|n| n.ref_name == "b").unwrap();
        assert_eq!(b.status, NodeStatus::Skipped);
    }

    #[tokio::test]
    async fn test_bad_condition_fails_instance() {
        let h = Harness::new();
        let def = h
            .enabled_def(vec![
                ("a", node(NodeType::Noop, 0).with_conditional_next("b", "context.(((")),
                ("b", node(NodeType::Noop, 1)),
            ])
            .await;
        let inst = h.start(def.def_id, json!({})).await;
        h.settle().await;

        let inst = h.store.get_instance(inst.inst_id).await.unwrap().unwrap();
        assert_eq!(inst.status, InstStatus::Failed);
        assert!(inst.reason.is_some());
    }

    #[tokio::test]
    async fn test_waiting_node_parks_instance() {
        let h = Harness::new();
        let def = h
            .enabled_def(vec![("w", node(NodeType::Wait, 0))])
            .await;
        let inst = h.start(def.def_id, json!({})).await;
        h.settle().await;

        let inst = h.store.get_instance(inst.inst_id).await.unwrap().unwrap();
        assert_eq!(inst.status, InstStatus::Running);
        assert!(inst.cur_node_inst.is_some());

        // Redelivered drives change nothing.
        h.drive(inst.inst_id).await;
        h.drive(inst.inst_id).await;
        assert_eq!(h.store.list_node_insts(inst.inst_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_drive_ignores_non_running_and_unknown() {
        let h = Harness::new();
        h.executor
            .drive(&DriveEvent {
                inst_id: 999,
                cause: "test".into(),
            })
            .await
            .unwrap();

        let def = h.enabled_def(vec![("w", node(NodeType::Wait, 0))]).await;
        let inst = h.start(def.def_id, json!({})).await;
        assert!(
            h.executor
                .terminate(inst.inst_id, InstStatus::Cancelled, "ops", "test")
                .await
                .unwrap()
        );
        h.settle().await;
        assert!(h.store.list_node_insts(inst.inst_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_terminate_is_compare_and_set() {
        let h = Harness::new();
        let def = h.enabled_def(vec![("w", node(NodeType::Wait, 0))]).await;
        let inst = h.start(def.def_id, json!({})).await;
        h.settle().await;

        let first = h.executor.terminate(inst.inst_id, InstStatus::Cancelled, "ops", "a");
        let second = h.executor.terminate(inst.inst_id, InstStatus::Succeed, "ops", "b");
        let (first, second) = tokio::join!(first, second);
        assert!(first.unwrap() ^ second.unwrap());

        let nodes = h.store.list_node_insts(inst.inst_id).await.unwrap();
        assert_eq!(nodes[0].status, NodeStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_lock_contention_is_retryable() {
        let h = Harness::new();
        let def = h.enabled_def(vec![("w", node(NodeType::Wait, 0))]).await;
        let inst = h.start(def.def_id, json!({})).await;
        let _held = h
            .locker
            .try_lock(&instance_lock_key(inst.inst_id), std::time::Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let err = h
            .executor
            .drive(&DriveEvent {
                inst_id: inst.inst_id,
                cause: "test".into(),
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_step_budget_continues_asynchronously() {
        let h = Harness::with_config(|c| c.executor.max_sync_steps = 1);
        let def = h
            .enabled_def(vec![
                ("a", node(NodeType::Noop, 0).with_next("b")),
                ("b", node(NodeType::Noop, 1)),
            ])
            .await;
        let inst = h.start(def.def_id, json!({})).await;
        h.settle().await;

        let inst = h.store.get_instance(inst.inst_id).await.unwrap().unwrap();
        assert_eq!(inst.status, InstStatus::Succeed);
    }

    #[tokio::test]
    async fn test_sub_workflow_resolves_parent() {
        let h = Harness::new();
        let child = h.enabled_def(vec![("x", node(NodeType::Noop, 0).with_params(json!({"r": 1})))]).await;
        let parent = h
            .enabled_def(vec![
                (
                    "sub",
                    NodeDef::new(NodeType::SubWorkflow, 0)
                        .with_params(json!({"def_id": child.def_id}))
                        .with_next("after"),
                ),
                ("after", node(NodeType::Noop, 1)),
            ])
            .await;
        let inst = h.start(parent.def_id, json!({})).await;
        h.settle().await;

        let inst = h.store.get_instance(inst.inst_id).await.unwrap().unwrap();
        assert_eq!(inst.status, InstStatus::Succeed);
        assert_eq!(inst.context["sub"]["status"], "succeed");
        assert_eq!(inst.context["sub"]["context"]["x"], json!({"r": 1}));
    }
}
