//! Workflow command service.
//!
//! The command surface of the engine: definition management, instance and
//! node operations, queries, archival, and event ingress. Every mutating
//! command carries an explicit operator; every instance mutation runs under
//! the instance lock and ends by publishing a drive event rather than
//! advancing the DAG inline.

use std::sync::Arc;

use chrono::{Duration, Utc};
use dagflow_types::command::{
    ArchiveHistoryCmd, ArchiveReport, CompleteNodeCmd, CreateDefCmd, DefQuery, DefRefCmd,
    InstCmd, InstDetail, InstQuery, NodeCmd, Page, PageRequest, RestartInstCmd,
    SetNodeDeadlineCmd, StartInstCmd, UpdateDefCmd, UpdateInstContextCmd,
};
use dagflow_types::config::LockConfig;
use dagflow_types::definition::{DefStatus, NewWorkflowDef, WorkflowDef};
use dagflow_types::error::{EngineError, RepositoryError};
use dagflow_types::event::EngineEvent;
use dagflow_types::instance::{InstStatus, InstTransition, WorkflowInst};
use dagflow_types::message::{BusMessage, ExternalEvent, TriggerFire};
use dagflow_types::node::{NewNodeInst, NodeInst, NodeStatus, NodeUpdate};
use dagflow_types::trigger::{TriggerLevel, TriggerScope};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::lock::{InstanceLocker, LockLease, acquire_with_retry, instance_lock_key, release};
use crate::message::MessageBus;
use crate::repository::WorkflowStore;
use crate::workflow::archiver::HistoryArchiver;
use crate::workflow::dag::validate_nodes;
use crate::workflow::executor::WorkflowExecutor;
use crate::workflow::launcher::{InstanceLauncher, StartRequest};
use crate::workflow::poller::NodePoller;
use crate::workflow::trigger::{TriggerRegistry, validate_trigger_defs};
use crate::workflow::updater::{WorkflowUpdater, mark_restart};

/// Node statuses CancelNode and CompleteNode may leave.
const OPEN_NODE: [NodeStatus; 3] = NodeStatus::LIVE;
/// Node statuses SkipNode may leave.
const SKIPPABLE_NODE: [NodeStatus; 4] = [
    NodeStatus::Scheduled,
    NodeStatus::Waiting,
    NodeStatus::Running,
    NodeStatus::Failed,
];
const ENDED_INST: [InstStatus; 4] = [
    InstStatus::Succeed,
    InstStatus::Failed,
    InstStatus::Cancelled,
    InstStatus::Timeout,
];

fn require_operator(operator: &str) -> Result<(), EngineError> {
    if operator.trim().is_empty() {
        return Err(EngineError::Unauthenticated("operator is required".to_string()));
    }
    Ok(())
}

fn def_not_found(def_id: i64, version: Option<i32>) -> EngineError {
    match version {
        Some(v) => EngineError::not_found(format!("definition {def_id} version {v}")),
        None => EngineError::not_found(format!("definition {def_id}")),
    }
}

/// Service behind every engine command.
pub struct WorkflowService<S: WorkflowStore, L: InstanceLocker> {
    store: Arc<S>,
    locker: Arc<L>,
    lock_config: LockConfig,
    bus: MessageBus,
    updater: Arc<WorkflowUpdater<S>>,
    executor: Arc<WorkflowExecutor<S, L>>,
    launcher: Arc<InstanceLauncher<S>>,
    triggers: Arc<TriggerRegistry<S>>,
    poller: Arc<NodePoller<S>>,
    archiver: Arc<HistoryArchiver<S, L>>,
}

impl<S: WorkflowStore, L: InstanceLocker> WorkflowService<S, L> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<S>,
        locker: Arc<L>,
        lock_config: LockConfig,
        bus: MessageBus,
        updater: Arc<WorkflowUpdater<S>>,
        executor: Arc<WorkflowExecutor<S, L>>,
        launcher: Arc<InstanceLauncher<S>>,
        triggers: Arc<TriggerRegistry<S>>,
        poller: Arc<NodePoller<S>>,
        archiver: Arc<HistoryArchiver<S, L>>,
    ) -> Self {
        Self {
            store,
            locker,
            lock_config,
            bus,
            updater,
            executor,
            launcher,
            triggers,
            poller,
            archiver,
        }
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Store a new definition, or a new version of an existing one. New
    /// versions start disabled.
    pub async fn create_def(&self, cmd: CreateDefCmd) -> Result<WorkflowDef, EngineError> {
        require_operator(&cmd.operator)?;
        let name = cmd.name.trim().to_string();
        if name.is_empty() {
            return Err(EngineError::invalid("definition name cannot be empty"));
        }
        if cmd.parent_def_id.is_some() != cmd.ref_name.is_some() {
            return Err(EngineError::invalid(
                "parent_def_id and ref_name must be set together",
            ));
        }
        validate_nodes(&cmd.nodes)?;
        validate_trigger_defs(&cmd.triggers)?;
        validate_trigger_defs(&cmd.inst_triggers)?;
        for node in cmd.nodes.values() {
            validate_trigger_defs(&node.triggers)?;
        }

        let new = NewWorkflowDef {
            def_id: cmd.def_id,
            name,
            creator: cmd.operator,
            description: cmd.description,
            nodes: cmd.nodes,
            status: DefStatus::Disabled,
            parent_def_id: cmd.parent_def_id,
            ref_name: cmd.ref_name,
            timeout_secs: cmd.timeout_secs,
            triggers: cmd.triggers,
            inst_triggers: cmd.inst_triggers,
        };
        let def = self.store.create_definition(&new).await.map_err(|e| match e {
            RepositoryError::NotFound => def_not_found(cmd.def_id.unwrap_or_default(), None),
            other => other.into(),
        })?;
        info!(def_id = def.def_id, version = def.version, creator = %def.creator, "definition stored");
        Ok(def)
    }

    /// Change name and/or description of one version.
    pub async fn update_def(&self, cmd: UpdateDefCmd) -> Result<WorkflowDef, EngineError> {
        require_operator(&cmd.operator)?;
        if cmd.name.is_none() && cmd.description.is_none() {
            return Err(EngineError::invalid("nothing to update"));
        }
        if cmd.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(EngineError::invalid("definition name cannot be empty"));
        }
        let updated = self
            .store
            .update_definition_meta(
                cmd.def_id,
                cmd.version,
                cmd.name.as_deref().map(str::trim),
                cmd.description.as_deref(),
            )
            .await?;
        if !updated {
            return Err(def_not_found(cmd.def_id, Some(cmd.version)));
        }
        debug!(def_id = cmd.def_id, version = cmd.version, operator = %cmd.operator, "definition updated");
        self.get_def_detail(cmd.def_id, Some(cmd.version)).await
    }

    /// Enable a version and register its definition-level triggers.
    pub async fn enable_def(&self, cmd: DefRefCmd) -> Result<WorkflowDef, EngineError> {
        require_operator(&cmd.operator)?;
        let mut def = self.get_def_detail(cmd.def_id, Some(cmd.version)).await?;
        self.store
            .set_definition_status(def.def_id, def.version, DefStatus::Enabled)
            .await?;
        self.triggers
            .register(&TriggerScope::definition(def.def_id, def.version), &def.triggers)
            .await?;
        def.status = DefStatus::Enabled;
        info!(def_id = def.def_id, version = def.version, operator = %cmd.operator, "definition enabled");
        Ok(def)
    }

    /// Disable a version and deactivate its definition-level triggers.
    /// Running instances are unaffected.
    pub async fn disable_def(&self, cmd: DefRefCmd) -> Result<WorkflowDef, EngineError> {
        require_operator(&cmd.operator)?;
        let mut def = self.get_def_detail(cmd.def_id, Some(cmd.version)).await?;
        self.store
            .set_definition_status(def.def_id, def.version, DefStatus::Disabled)
            .await?;
        self.triggers
            .unregister(&TriggerScope::definition(def.def_id, def.version))
            .await?;
        def.status = DefStatus::Disabled;
        info!(def_id = def.def_id, version = def.version, operator = %cmd.operator, "definition disabled");
        Ok(def)
    }

    pub async fn get_def_detail(&self, def_id: i64, version: Option<i32>) -> Result<WorkflowDef, EngineError> {
        self.store
            .get_definition(def_id, version)
            .await?
            .ok_or_else(|| def_not_found(def_id, version))
    }

    pub async fn get_def_list(&self, query: &DefQuery, page: PageRequest) -> Result<Page<WorkflowDef>, EngineError> {
        Ok(self.store.list_definitions(query, page).await?)
    }

    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    pub async fn start_inst(&self, cmd: StartInstCmd) -> Result<WorkflowInst, EngineError> {
        require_operator(&cmd.operator)?;
        self.launcher
            .start(StartRequest {
                def_id: cmd.def_id,
                version: cmd.version,
                context: cmd.context,
                operator: cmd.operator,
                parent: None,
            })
            .await
    }

    /// Re-run an instance from `ref_name`. Live nodes superseded by the new
    /// restart boundary are cancelled and the instance returns to `Running`
    /// whatever its previous status.
    pub async fn restart_inst(&self, cmd: RestartInstCmd) -> Result<WorkflowInst, EngineError> {
        require_operator(&cmd.operator)?;
        let lease = self.lock(cmd.inst_id).await?;
        let result = self.restart_locked(&cmd).await;
        self.unlock(&lease).await;
        let inst = result?;
        self.drive(inst.inst_id, "restarted")?;
        Ok(inst)
    }

    async fn restart_locked(&self, cmd: &RestartInstCmd) -> Result<WorkflowInst, EngineError> {
        let mut inst = self.load_inst(cmd.inst_id).await?;
        let def = self.get_def_detail(inst.def_id, Some(inst.version)).await?;
        if !def.nodes.contains_key(&cmd.ref_name) {
            return Err(EngineError::invalid(format!(
                "node '{}' is not part of definition {} version {}",
                cmd.ref_name, def.def_id, def.version
            )));
        }

        let boundary = self.store.max_node_inst_id(inst.inst_id).await?;
        mark_restart(&mut inst, &cmd.ref_name, boundary, Utc::now());
        inst.cur_node_inst = None;
        self.save(&inst).await?;
        self.executor
            .cancel_superseded_nodes(&inst, &format!("restart from '{}'", cmd.ref_name))
            .await?;

        let reason = cmd
            .reason
            .clone()
            .unwrap_or_else(|| format!("restart from '{}'", cmd.ref_name));
        let was_ended = inst.status.is_terminal();
        self.reopen(&inst, &InstStatus::ALL, &cmd.operator, &reason).await?;
        if was_ended {
            self.register_inst_triggers(&def, inst.inst_id).await?;
        }
        info!(
            inst_id = inst.inst_id,
            ref_name = %cmd.ref_name,
            boundary,
            operator = %cmd.operator,
            "instance restarted"
        );
        self.load_inst(inst.inst_id).await
    }

    pub async fn cancel_inst(&self, cmd: InstCmd) -> Result<WorkflowInst, EngineError> {
        self.end_inst(cmd, InstStatus::Cancelled, "cancelled by operator").await
    }

    /// Force an instance to `Succeed`, cancelling whatever is still live.
    pub async fn complete_inst(&self, cmd: InstCmd) -> Result<WorkflowInst, EngineError> {
        self.end_inst(cmd, InstStatus::Succeed, "completed by operator").await
    }

    async fn end_inst(&self, cmd: InstCmd, to: InstStatus, default_reason: &str) -> Result<WorkflowInst, EngineError> {
        require_operator(&cmd.operator)?;
        let reason = cmd.reason.as_deref().unwrap_or(default_reason);
        if !self
            .executor
            .terminate(cmd.inst_id, to, &cmd.operator, reason)
            .await?
        {
            return Err(EngineError::invalid(format!(
                "instance {} has already ended",
                cmd.inst_id
            )));
        }
        self.load_inst(cmd.inst_id).await
    }

    pub async fn pause_inst(&self, cmd: InstCmd) -> Result<WorkflowInst, EngineError> {
        require_operator(&cmd.operator)?;
        let inst = self
            .switch_live_status(&cmd, InstStatus::Running, InstStatus::Paused)
            .await?;
        info!(inst_id = inst.inst_id, operator = %cmd.operator, "instance paused");
        Ok(inst)
    }

    pub async fn resume_inst(&self, cmd: InstCmd) -> Result<WorkflowInst, EngineError> {
        require_operator(&cmd.operator)?;
        let inst = self
            .switch_live_status(&cmd, InstStatus::Paused, InstStatus::Running)
            .await?;
        info!(inst_id = inst.inst_id, operator = %cmd.operator, "instance resumed");
        self.drive(inst.inst_id, "resumed")?;
        Ok(inst)
    }

    async fn switch_live_status(
        &self,
        cmd: &InstCmd,
        from: InstStatus,
        to: InstStatus,
    ) -> Result<WorkflowInst, EngineError> {
        let lease = self.lock(cmd.inst_id).await?;
        let result = self.switch_locked(cmd, from, to).await;
        self.unlock(&lease).await;
        result
    }

    async fn switch_locked(
        &self,
        cmd: &InstCmd,
        from: InstStatus,
        to: InstStatus,
    ) -> Result<WorkflowInst, EngineError> {
        let inst = self.load_inst(cmd.inst_id).await?;
        let change = InstTransition {
            operator: Some(cmd.operator.clone()),
            reason: cmd.reason.clone(),
            ended_at: None,
        };
        if !self
            .store
            .transition_instance(inst.inst_id, inst.def_id, &[from], to, &change)
            .await?
        {
            return Err(EngineError::invalid(format!(
                "instance {} is {}, not {from}",
                inst.inst_id, inst.status
            )));
        }
        self.load_inst(inst.inst_id).await
    }

    /// Deep-merge a patch into a live instance's context.
    pub async fn update_inst_context(&self, cmd: UpdateInstContextCmd) -> Result<WorkflowInst, EngineError> {
        require_operator(&cmd.operator)?;
        if !cmd.context.is_object() {
            return Err(EngineError::invalid("context patch must be a JSON object"));
        }
        let lease = self.lock(cmd.inst_id).await?;
        let result = self.update_context_locked(cmd.inst_id, &cmd.context).await;
        self.unlock(&lease).await;
        let inst = result?;
        debug!(inst_id = inst.inst_id, operator = %cmd.operator, "instance context updated");
        self.drive(inst.inst_id, "context updated")?;
        Ok(inst)
    }

    async fn update_context_locked(&self, inst_id: i64, patch: &Value) -> Result<WorkflowInst, EngineError> {
        let inst = self.load_inst(inst_id).await?;
        if inst.status.is_terminal() {
            return Err(EngineError::invalid(format!(
                "instance {inst_id} has already ended"
            )));
        }
        self.updater.update_context(inst_id, patch).await
    }

    /// An instance with its node instances; falls back to history.
    pub async fn get_inst_detail(&self, inst_id: i64) -> Result<InstDetail, EngineError> {
        if let Some(inst) = self.store.get_instance(inst_id).await? {
            let nodes = self.store.list_node_insts(inst_id).await?;
            return Ok(InstDetail {
                inst,
                nodes,
                archived: false,
            });
        }
        let inst = self
            .store
            .get_history_instance(inst_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("instance {inst_id}")))?;
        let nodes = self.store.list_history_nodes(inst_id).await?;
        Ok(InstDetail {
            inst,
            nodes,
            archived: true,
        })
    }

    pub async fn get_inst_list(&self, query: &InstQuery, page: PageRequest) -> Result<Page<WorkflowInst>, EngineError> {
        Ok(self.store.list_instances(query, page).await?)
    }

    pub async fn archive_history(&self, cmd: ArchiveHistoryCmd) -> Result<ArchiveReport, EngineError> {
        require_operator(&cmd.operator)?;
        if cmd.inst_ids.is_empty() {
            return Err(EngineError::invalid("inst_ids cannot be empty"));
        }
        let report = self.archiver.archive(cmd.def_id, &cmd.inst_ids).await?;
        info!(
            def_id = cmd.def_id,
            archived = report.archived.len(),
            skipped = report.skipped.len(),
            operator = %cmd.operator,
            "history archived"
        );
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Nodes
    // -----------------------------------------------------------------------

    pub async fn get_node_inst_detail(&self, node_inst_id: i64) -> Result<NodeInst, EngineError> {
        self.store
            .get_node_inst(node_inst_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("node instance {node_inst_id}")))
    }

    /// Schedule a fresh run of a finished node. An ended instance is
    /// brought back to `Running`.
    pub async fn rerun_node(&self, cmd: NodeCmd) -> Result<NodeInst, EngineError> {
        require_operator(&cmd.operator)?;
        let node = self.get_node_inst_detail(cmd.node_inst_id).await?;
        let lease = self.lock(node.inst_id).await?;
        let result = self.rerun_locked(&node, &cmd).await;
        self.unlock(&lease).await;
        let created = result?;
        info!(inst_id = created.inst_id, ref_name = %created.ref_name, operator = %cmd.operator, "node rerun scheduled");
        self.drive(created.inst_id, "node rerun")?;
        Ok(created)
    }

    async fn rerun_locked(&self, node: &NodeInst, cmd: &NodeCmd) -> Result<NodeInst, EngineError> {
        let inst = self.load_inst(node.inst_id).await?;
        let latest = self.latest_node(inst.inst_id, &node.ref_name).await?;
        if !latest.status.is_terminal() {
            return Err(EngineError::invalid(format!(
                "node '{}' is still {}",
                node.ref_name, latest.status
            )));
        }
        let created = self.reschedule_node(&inst, &node.ref_name).await?;
        let reason = cmd.reason.as_deref().unwrap_or("node rerun");
        self.reopen_if_idle(&inst, &cmd.operator, reason).await?;
        Ok(created)
    }

    /// Poll a waiting node immediately.
    pub async fn resume_node(&self, cmd: NodeCmd) -> Result<NodeInst, EngineError> {
        require_operator(&cmd.operator)?;
        let status = self.poller.poll_now(cmd.node_inst_id).await?;
        debug!(node_inst_id = cmd.node_inst_id, %status, operator = %cmd.operator, "node resumed");
        self.get_node_inst_detail(cmd.node_inst_id).await
    }

    pub async fn cancel_node(&self, cmd: NodeCmd) -> Result<NodeInst, EngineError> {
        require_operator(&cmd.operator)?;
        let reason = cmd.reason.clone().unwrap_or_else(|| "cancelled by operator".to_string());
        self.close_node(
            cmd.node_inst_id,
            &OPEN_NODE,
            NodeStatus::Cancelled,
            NodeUpdate::failed(reason, Utc::now()),
        )
        .await
    }

    pub async fn complete_node(&self, cmd: CompleteNodeCmd) -> Result<NodeInst, EngineError> {
        require_operator(&cmd.operator)?;
        let output = if cmd.output.is_null() {
            Value::Object(Default::default())
        } else {
            cmd.output
        };
        self.close_node(
            cmd.node_inst_id,
            &OPEN_NODE,
            NodeStatus::Completed,
            NodeUpdate::completed(output, Utc::now()),
        )
        .await
    }

    /// Resolve a node to `Skipped`. Skipping the failed node of a failed
    /// instance brings the instance back to `Running`.
    pub async fn skip_node(&self, cmd: NodeCmd) -> Result<NodeInst, EngineError> {
        require_operator(&cmd.operator)?;
        let node = self.get_node_inst_detail(cmd.node_inst_id).await?;
        let lease = self.lock(node.inst_id).await?;
        let result = self.skip_locked(&node, &cmd.operator).await;
        self.unlock(&lease).await;
        let skipped = result?;
        info!(inst_id = skipped.inst_id, ref_name = %skipped.ref_name, operator = %cmd.operator, "node skipped");
        self.drive(skipped.inst_id, "node skipped")?;
        Ok(skipped)
    }

    async fn skip_locked(&self, node: &NodeInst, operator: &str) -> Result<NodeInst, EngineError> {
        let inst = self.load_inst(node.inst_id).await?;
        let update = NodeUpdate {
            completed_at: Some(Utc::now()),
            ..Default::default()
        };
        if !self
            .store
            .transition_node(node.node_inst_id, node.inst_id, &SKIPPABLE_NODE, NodeStatus::Skipped, &update)
            .await?
        {
            return Err(EngineError::invalid(format!(
                "node instance {} cannot be skipped",
                node.node_inst_id
            )));
        }
        self.release_node_triggers(&inst, &node.ref_name).await?;
        if inst.status == InstStatus::Failed
            && self
                .reopen(&inst, &[InstStatus::Failed], operator, "failed node skipped")
                .await?
        {
            self.register_inst_triggers_for(&inst).await?;
        }
        self.node_finished(node, NodeStatus::Skipped);
        self.get_node_inst_detail(node.node_inst_id).await
    }

    /// Undo a skip: the latest run of the ref must be `Skipped`; a fresh
    /// `Scheduled` run replaces it.
    pub async fn cancel_skip_node(&self, cmd: NodeCmd) -> Result<NodeInst, EngineError> {
        require_operator(&cmd.operator)?;
        let node = self.get_node_inst_detail(cmd.node_inst_id).await?;
        let lease = self.lock(node.inst_id).await?;
        let result = self.cancel_skip_locked(&node, &cmd.operator).await;
        self.unlock(&lease).await;
        let created = result?;
        info!(inst_id = created.inst_id, ref_name = %created.ref_name, operator = %cmd.operator, "node skip cancelled");
        self.drive(created.inst_id, "skip cancelled")?;
        Ok(created)
    }

    async fn cancel_skip_locked(&self, node: &NodeInst, operator: &str) -> Result<NodeInst, EngineError> {
        let inst = self.load_inst(node.inst_id).await?;
        let latest = self.latest_node(inst.inst_id, &node.ref_name).await?;
        if latest.node_inst_id != node.node_inst_id || latest.status != NodeStatus::Skipped {
            return Err(EngineError::invalid(format!(
                "node instance {} is not the latest skipped run of '{}'",
                node.node_inst_id, node.ref_name
            )));
        }
        let created = self.reschedule_node(&inst, &node.ref_name).await?;
        self.reopen_if_idle(&inst, operator, "skip cancelled").await?;
        Ok(created)
    }

    pub async fn set_node_timeout(&self, cmd: SetNodeDeadlineCmd) -> Result<NodeInst, EngineError> {
        require_operator(&cmd.operator)?;
        let node = self.get_node_inst_detail(cmd.node_inst_id).await?;
        let at = Utc::now() + Duration::seconds(cmd.secs as i64);
        if !self.store.set_node_timeout(node.node_inst_id, node.inst_id, at).await? {
            return Err(EngineError::invalid(format!(
                "node instance {} has already ended",
                node.node_inst_id
            )));
        }
        debug!(node_inst_id = node.node_inst_id, %at, operator = %cmd.operator, "node deadline set");
        self.get_node_inst_detail(node.node_inst_id).await
    }

    pub async fn set_node_near_timeout(&self, cmd: SetNodeDeadlineCmd) -> Result<NodeInst, EngineError> {
        require_operator(&cmd.operator)?;
        let node = self.get_node_inst_detail(cmd.node_inst_id).await?;
        let at = Utc::now() + Duration::seconds(cmd.secs as i64);
        if !self
            .store
            .set_node_near_timeout(node.node_inst_id, node.inst_id, at)
            .await?
        {
            return Err(EngineError::invalid(format!(
                "node instance {} has already ended",
                node.node_inst_id
            )));
        }
        debug!(node_inst_id = node.node_inst_id, %at, operator = %cmd.operator, "node near-timeout set");
        self.get_node_inst_detail(node.node_inst_id).await
    }

    // -----------------------------------------------------------------------
    // Events and triggers
    // -----------------------------------------------------------------------

    /// Accept an external event for asynchronous trigger matching.
    pub fn publish_event(&self, event: ExternalEvent) -> Result<Uuid, EngineError> {
        if event.name.trim().is_empty() {
            return Err(EngineError::invalid("event name cannot be empty"));
        }
        debug!(event = %event.name, inst_id = ?event.inst_id, "external event accepted");
        self.bus.publish(BusMessage::External(event))
    }

    /// Apply a matched trigger to its owner.
    ///
    /// Fires whose owner is gone, disabled, or no longer waiting are
    /// dropped, since retrying them cannot succeed.
    pub async fn apply_trigger_fire(&self, fire: &TriggerFire) -> Result<(), EngineError> {
        let operator = format!("trigger:{}", fire.trigger_id);
        match fire.level {
            TriggerLevel::WorkflowDef => {
                let started = self
                    .launcher
                    .start(StartRequest {
                        def_id: fire.def_id,
                        version: Some(fire.def_version),
                        context: fire.payload.clone(),
                        operator,
                        parent: None,
                    })
                    .await;
                match started {
                    Ok(inst) => {
                        debug!(trigger_id = fire.trigger_id, inst_id = inst.inst_id, "trigger started instance");
                        Ok(())
                    }
                    Err(e @ (EngineError::InvalidArgument(_) | EngineError::NotFound(_))) => {
                        warn!(trigger_id = fire.trigger_id, error = %e, "trigger fire dropped");
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            TriggerLevel::WorkflowInst => {
                let Some(inst_id) = fire.inst_id else {
                    warn!(trigger_id = fire.trigger_id, "instance trigger fire without instance dropped");
                    return Ok(());
                };
                let lease = self.lock(inst_id).await?;
                let result = self.merge_trigger_payload(inst_id, &fire.payload).await;
                self.unlock(&lease).await;
                if result? {
                    self.drive(inst_id, "instance trigger fired")?;
                }
                Ok(())
            }
            TriggerLevel::NodeInst => {
                let (Some(inst_id), Some(ref_name)) = (fire.inst_id, fire.ref_name.as_deref()) else {
                    warn!(trigger_id = fire.trigger_id, "node trigger fire without node dropped");
                    return Ok(());
                };
                let lease = self.lock(inst_id).await?;
                let result = self.complete_waiting_ref(inst_id, ref_name, &fire.payload).await;
                self.unlock(&lease).await;
                if result? {
                    self.drive(inst_id, "node trigger fired")?;
                }
                Ok(())
            }
        }
    }

    async fn merge_trigger_payload(&self, inst_id: i64, payload: &Value) -> Result<bool, EngineError> {
        match self.store.get_instance(inst_id).await? {
            Some(inst) if !inst.status.is_terminal() => {
                self.updater.update_context(inst_id, payload).await?;
                Ok(true)
            }
            _ => {
                debug!(inst_id, "instance trigger fire for ended instance dropped");
                Ok(false)
            }
        }
    }

    async fn complete_waiting_ref(&self, inst_id: i64, ref_name: &str, payload: &Value) -> Result<bool, EngineError> {
        let Some(inst) = self.store.get_instance(inst_id).await? else {
            return Ok(false);
        };
        let node = match self.latest_node(inst_id, ref_name).await {
            Ok(node) => node,
            Err(EngineError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        if node.status != NodeStatus::Waiting {
            debug!(inst_id, ref_name, status = %node.status, "node trigger fire for non-waiting node dropped");
            return Ok(false);
        }
        let output = if payload.is_null() {
            Value::Object(Default::default())
        } else {
            payload.clone()
        };
        let moved = self
            .store
            .transition_node(
                node.node_inst_id,
                inst_id,
                &[NodeStatus::Waiting],
                NodeStatus::Completed,
                &NodeUpdate::completed(output, Utc::now()),
            )
            .await?;
        if moved {
            self.release_node_triggers(&inst, ref_name).await?;
            self.node_finished(&node, NodeStatus::Completed);
        }
        Ok(moved)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn lock(&self, inst_id: i64) -> Result<LockLease, EngineError> {
        acquire_with_retry(self.locker.as_ref(), &instance_lock_key(inst_id), &self.lock_config).await
    }

    async fn unlock(&self, lease: &LockLease) {
        release(self.locker.as_ref(), lease).await;
    }

    fn drive(&self, inst_id: i64, cause: &str) -> Result<(), EngineError> {
        self.bus.publish(BusMessage::drive(inst_id, cause))?;
        Ok(())
    }

    async fn load_inst(&self, inst_id: i64) -> Result<WorkflowInst, EngineError> {
        self.store
            .get_instance(inst_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("instance {inst_id}")))
    }

    async fn save(&self, inst: &WorkflowInst) -> Result<(), EngineError> {
        if !self.store.save_instance(inst).await? {
            return Err(EngineError::not_found(format!("instance {}", inst.inst_id)));
        }
        Ok(())
    }

    async fn latest_node(&self, inst_id: i64, ref_name: &str) -> Result<NodeInst, EngineError> {
        self.store
            .list_node_insts(inst_id)
            .await?
            .into_iter()
            .filter(|n| n.ref_name == ref_name)
            .max_by_key(|n| n.node_inst_id)
            .ok_or_else(|| EngineError::not_found(format!("node '{ref_name}' of instance {inst_id}")))
    }

    /// Create a `Scheduled` row for `ref_name` with fresh deadlines.
    async fn reschedule_node(&self, inst: &WorkflowInst, ref_name: &str) -> Result<NodeInst, EngineError> {
        let def = self.get_def_detail(inst.def_id, Some(inst.version)).await?;
        let node_def = def.nodes.get(ref_name).ok_or_else(|| {
            EngineError::invalid(format!("node '{ref_name}' is not part of definition {}", def.def_id))
        })?;
        let now = Utc::now();
        let deadline = |secs: Option<u64>| secs.map(|s| now + Duration::seconds(s as i64));
        let created = self
            .store
            .create_node_inst(&NewNodeInst {
                def_id: inst.def_id,
                inst_id: inst.inst_id,
                ref_name: ref_name.to_string(),
                node_type: node_def.node_type,
                status: NodeStatus::Scheduled,
                nexts: node_def.nexts.iter().map(|e| e.ref_name.clone()).collect(),
                parents: def.parents_of(ref_name).into_iter().map(str::to_string).collect(),
                error: None,
                scheduled_at: now,
                timeout_at: deadline(node_def.timeout_secs),
                near_timeout_at: deadline(node_def.near_timeout_secs),
            })
            .await?;
        self.bus.events().publish(EngineEvent::NodeScheduled {
            inst_id: inst.inst_id,
            node_inst_id: created.node_inst_id,
            ref_name: created.ref_name.clone(),
        });
        Ok(created)
    }

    /// Move an instance back to `Running` from any of `from`.
    async fn reopen(
        &self,
        inst: &WorkflowInst,
        from: &[InstStatus],
        operator: &str,
        reason: &str,
    ) -> Result<bool, EngineError> {
        let change = InstTransition {
            operator: Some(operator.to_string()),
            reason: Some(reason.to_string()),
            ended_at: None,
        };
        Ok(self
            .store
            .transition_instance(inst.inst_id, inst.def_id, from, InstStatus::Running, &change)
            .await?)
    }

    /// Reopen an ended instance for new node work. Paused instances stay
    /// paused.
    async fn reopen_if_idle(&self, inst: &WorkflowInst, operator: &str, reason: &str) -> Result<(), EngineError> {
        if inst.status.is_terminal() && self.reopen(inst, &ENDED_INST, operator, reason).await? {
            self.register_inst_triggers_for(inst).await?;
        }
        Ok(())
    }

    async fn register_inst_triggers(&self, def: &WorkflowDef, inst_id: i64) -> Result<(), EngineError> {
        self.triggers
            .register(&TriggerScope::instance(def.def_id, def.version, inst_id), &def.inst_triggers)
            .await?;
        Ok(())
    }

    async fn register_inst_triggers_for(&self, inst: &WorkflowInst) -> Result<(), EngineError> {
        let def = self.get_def_detail(inst.def_id, Some(inst.version)).await?;
        self.register_inst_triggers(&def, inst.inst_id).await
    }

    async fn release_node_triggers(&self, inst: &WorkflowInst, ref_name: &str) -> Result<(), EngineError> {
        self.triggers
            .unregister(&TriggerScope::node(inst.def_id, inst.version, inst.inst_id, Some(ref_name)))
            .await?;
        Ok(())
    }

    fn node_finished(&self, node: &NodeInst, status: NodeStatus) {
        self.bus.events().publish(EngineEvent::NodeFinished {
            inst_id: node.inst_id,
            node_inst_id: node.node_inst_id,
            ref_name: node.ref_name.clone(),
            status,
        });
    }

    /// Compare-and-set a node out of `from` under the instance lock.
    /// Losing writers get `InvalidArgument`.
    async fn close_node(
        &self,
        node_inst_id: i64,
        from: &[NodeStatus],
        to: NodeStatus,
        update: NodeUpdate,
    ) -> Result<NodeInst, EngineError> {
        let node = self.get_node_inst_detail(node_inst_id).await?;
        let lease = self.lock(node.inst_id).await?;
        let result = self.close_locked(&node, from, to, &update).await;
        self.unlock(&lease).await;
        let closed = result?;
        info!(inst_id = closed.inst_id, node_inst_id, ref_name = %closed.ref_name, status = %to, "node closed by operator");
        self.drive(closed.inst_id, "node closed")?;
        Ok(closed)
    }

    async fn close_locked(
        &self,
        node: &NodeInst,
        from: &[NodeStatus],
        to: NodeStatus,
        update: &NodeUpdate,
    ) -> Result<NodeInst, EngineError> {
        let inst = self.load_inst(node.inst_id).await?;
        if !self
            .store
            .transition_node(node.node_inst_id, node.inst_id, from, to, update)
            .await?
        {
            return Err(EngineError::invalid(format!(
                "node instance {} has already ended",
                node.node_inst_id
            )));
        }
        self.release_node_triggers(&inst, &node.ref_name).await?;
        self.node_finished(node, to);
        self.get_node_inst_detail(node.node_inst_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::instance::InstanceRepository;
    use crate::repository::node::NodeRepository;
    use crate::test_support::{Harness, OPERATOR, node};
    use dagflow_types::definition::{NodeType, TriggerDef};
    use serde_json::json;

    fn inst_cmd(inst_id: i64) -> InstCmd {
        InstCmd {
            inst_id,
            operator: OPERATOR.to_string(),
            reason: None,
        }
    }

    fn node_cmd(node_inst_id: i64) -> NodeCmd {
        NodeCmd {
            node_inst_id,
            operator: OPERATOR.to_string(),
            reason: None,
        }
    }

    fn complete_cmd(node_inst_id: i64, output: Value) -> CompleteNodeCmd {
        CompleteNodeCmd {
            node_inst_id,
            output,
            operator: OPERATOR.to_string(),
        }
    }

    async fn inst_of(h: &Harness, inst_id: i64) -> WorkflowInst {
        h.store.get_instance(inst_id).await.unwrap().unwrap()
    }

    async fn rows_of(h: &Harness, inst_id: i64, ref_name: &str) -> Vec<NodeInst> {
        h.store
            .list_node_insts(inst_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|n| n.ref_name == ref_name)
            .collect()
    }

    /// `a -> w -> c` where `w` waits for an operator.
    async fn waiting_flow(h: &Harness) -> (WorkflowInst, NodeInst) {
        let def = h
            .enabled_def(vec![
                ("a", node(NodeType::Noop, 0).with_next("w")),
                ("w", node(NodeType::Wait, 1).with_next("c")),
                ("c", node(NodeType::Noop, 2)),
            ])
            .await;
        let inst = h.start(def.def_id, json!({})).await;
        h.settle().await;
        let w = rows_of(h, inst.inst_id, "w").await.pop().unwrap();
        assert_eq!(w.status, NodeStatus::Waiting);
        (inst, w)
    }

    #[tokio::test]
    async fn test_create_def_validation() {
        let h = Harness::new();

        let mut cmd = Harness::def_cmd(vec![("a", node(NodeType::Noop, 0))]);
        cmd.operator = "  ".into();
        assert!(matches!(
            h.service.create_def(cmd).await.unwrap_err(),
            EngineError::Unauthenticated(_)
        ));

        let mut cmd = Harness::def_cmd(vec![("a", node(NodeType::Noop, 0))]);
        cmd.name = String::new();
        assert!(matches!(
            h.service.create_def(cmd).await.unwrap_err(),
            EngineError::InvalidArgument(_)
        ));

        let mut cmd = Harness::def_cmd(vec![("a", node(NodeType::Noop, 0))]);
        cmd.parent_def_id = Some(1);
        assert!(matches!(
            h.service.create_def(cmd).await.unwrap_err(),
            EngineError::InvalidArgument(_)
        ));

        let cmd = Harness::def_cmd(vec![
            ("a", node(NodeType::Noop, 0).with_next("b")),
            ("b", node(NodeType::Noop, 1).with_next("a")),
        ]);
        assert!(matches!(
            h.service.create_def(cmd).await.unwrap_err(),
            EngineError::InvalidArgument(_)
        ));

        let mut cmd = Harness::def_cmd(vec![("a", node(NodeType::Noop, 0))]);
        cmd.triggers = vec![TriggerDef::Cron {
            expr: "not a schedule".into(),
            payload: Value::Null,
        }];
        assert!(matches!(
            h.service.create_def(cmd).await.unwrap_err(),
            EngineError::InvalidArgument(_)
        ));
    }

    #[tokio::test]
    async fn test_create_def_appends_versions() {
        let h = Harness::new();
        let v1 = h
            .service
            .create_def(Harness::def_cmd(vec![("a", node(NodeType::Noop, 0))]))
            .await
            .unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v1.status, DefStatus::Disabled);
        assert_eq!(v1.creator, OPERATOR);

        let mut cmd = Harness::def_cmd(vec![("b", node(NodeType::Noop, 0))]);
        cmd.def_id = Some(v1.def_id);
        let v2 = h.service.create_def(cmd).await.unwrap();
        assert_eq!(v2.def_id, v1.def_id);
        assert_eq!(v2.version, 2);

        let latest = h.service.get_def_detail(v1.def_id, None).await.unwrap();
        assert_eq!(latest.version, 2);
        let first = h.service.get_def_detail(v1.def_id, Some(1)).await.unwrap();
        assert!(first.nodes.contains_key("a"));

        let mut cmd = Harness::def_cmd(vec![("a", node(NodeType::Noop, 0))]);
        cmd.def_id = Some(9999);
        assert!(matches!(
            h.service.create_def(cmd).await.unwrap_err(),
            EngineError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_update_def_changes_metadata_only() {
        let h = Harness::new();
        let def = h.enabled_def(vec![("a", node(NodeType::Noop, 0))]).await;
        let updated = h
            .service
            .update_def(UpdateDefCmd {
                def_id: def.def_id,
                version: def.version,
                name: Some("renamed".into()),
                description: None,
                operator: OPERATOR.into(),
            })
            .await
            .unwrap();
        assert_eq!(updated.name, "renamed");
        assert_eq!(updated.nodes, def.nodes);
        assert_eq!(updated.status, DefStatus::Enabled);

        let err = h
            .service
            .update_def(UpdateDefCmd {
                def_id: def.def_id,
                version: 7,
                name: Some("x".into()),
                description: None,
                operator: OPERATOR.into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_start_requires_enabled_definition() {
        let h = Harness::new();
        let def = h
            .service
            .create_def(Harness::def_cmd(vec![("a", node(NodeType::Noop, 0))]))
            .await
            .unwrap();
        let err = h
            .service
            .start_inst(StartInstCmd {
                def_id: def.def_id,
                version: None,
                context: json!({}),
                operator: OPERATOR.into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));

        let disabled = h
            .service
            .disable_def(DefRefCmd {
                def_id: def.def_id,
                version: def.version,
                operator: OPERATOR.into(),
            })
            .await
            .unwrap();
        assert_eq!(disabled.status, DefStatus::Disabled);
    }

    #[tokio::test]
    async fn test_complete_node_finishes_instance() {
        let h = Harness::new();
        let (inst, w) = waiting_flow(&h).await;
        assert_eq!(inst_of(&h, inst.inst_id).await.status, InstStatus::Running);

        let done = h
            .service
            .complete_node(complete_cmd(w.node_inst_id, json!({"approved": true})))
            .await
            .unwrap();
        assert_eq!(done.status, NodeStatus::Completed);
        h.settle().await;

        let inst = inst_of(&h, inst.inst_id).await;
        assert_eq!(inst.status, InstStatus::Succeed);
        assert_eq!(inst.context["w"]["approved"], true);
        assert_eq!(rows_of(&h, inst.inst_id, "c").await.len(), 1);
    }

    #[tokio::test]
    async fn test_second_node_close_loses() {
        let h = Harness::new();
        let (_, w) = waiting_flow(&h).await;
        h.service
            .complete_node(complete_cmd(w.node_inst_id, json!({})))
            .await
            .unwrap();
        let err = h.service.cancel_node(node_cmd(w.node_inst_id)).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
        let err = h
            .service
            .complete_node(complete_cmd(w.node_inst_id, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_cancel_then_complete_instance() {
        let h = Harness::new();
        let (inst, w) = waiting_flow(&h).await;

        let cancelled = h.service.cancel_inst(inst_cmd(inst.inst_id)).await.unwrap();
        assert_eq!(cancelled.status, InstStatus::Cancelled);
        assert!(cancelled.ended_at.is_some());
        let w = h.service.get_node_inst_detail(w.node_inst_id).await.unwrap();
        assert_eq!(w.status, NodeStatus::Cancelled);

        let err = h.service.complete_inst(inst_cmd(inst.inst_id)).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
        assert_eq!(inst_of(&h, inst.inst_id).await.status, InstStatus::Cancelled);

        let err = h.service.cancel_inst(inst_cmd(424242)).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_complete_inst_forces_success() {
        let h = Harness::new();
        let (inst, _) = waiting_flow(&h).await;
        let done = h.service.complete_inst(inst_cmd(inst.inst_id)).await.unwrap();
        assert_eq!(done.status, InstStatus::Succeed);
        assert_eq!(done.operator, OPERATOR);
    }

    #[tokio::test]
    async fn test_pause_blocks_progress_until_resume() {
        let h = Harness::new();
        let (inst, w) = waiting_flow(&h).await;

        let paused = h.service.pause_inst(inst_cmd(inst.inst_id)).await.unwrap();
        assert_eq!(paused.status, InstStatus::Paused);
        let err = h.service.pause_inst(inst_cmd(inst.inst_id)).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));

        h.service
            .complete_node(complete_cmd(w.node_inst_id, json!({})))
            .await
            .unwrap();
        h.settle().await;
        assert!(rows_of(&h, inst.inst_id, "c").await.is_empty());

        let resumed = h.service.resume_inst(inst_cmd(inst.inst_id)).await.unwrap();
        assert_eq!(resumed.status, InstStatus::Running);
        h.settle().await;
        assert_eq!(inst_of(&h, inst.inst_id).await.status, InstStatus::Succeed);
    }

    #[tokio::test]
    async fn test_restart_reruns_from_target() {
        let h = Harness::new();
        let def = h
            .enabled_def(vec![
                ("a", node(NodeType::Noop, 0).with_next("b")),
                ("b", node(NodeType::Noop, 1).with_next("c")),
                ("c", node(NodeType::Noop, 2)),
            ])
            .await;
        let inst = h.start(def.def_id, json!({})).await;
        h.settle().await;
        assert_eq!(inst_of(&h, inst.inst_id).await.status, InstStatus::Succeed);

        let restarted = h
            .service
            .restart_inst(RestartInstCmd {
                inst_id: inst.inst_id,
                ref_name: "b".into(),
                operator: OPERATOR.into(),
                reason: None,
            })
            .await
            .unwrap();
        assert_eq!(restarted.status, InstStatus::Running);
        assert_eq!(restarted.last_restart_node.as_deref(), Some("b"));
        assert_eq!(restarted.before_last_restart_max_node_inst_id, 3);
        assert!(restarted.ended_at.is_none());
        h.settle().await;

        assert_eq!(inst_of(&h, inst.inst_id).await.status, InstStatus::Succeed);
        assert_eq!(rows_of(&h, inst.inst_id, "a").await.len(), 1);
        assert_eq!(rows_of(&h, inst.inst_id, "b").await.len(), 2);
        assert_eq!(rows_of(&h, inst.inst_id, "c").await.len(), 2);

        let err = h
            .service
            .restart_inst(RestartInstCmd {
                inst_id: inst.inst_id,
                ref_name: "zzz".into(),
                operator: OPERATOR.into(),
                reason: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    fn restart_cmd(inst_id: i64, ref_name: &str) -> RestartInstCmd {
        RestartInstCmd {
            inst_id,
            ref_name: ref_name.into(),
            operator: OPERATOR.into(),
            reason: None,
        }
    }

    #[tokio::test]
    async fn test_restart_keeps_parallel_waiting_node() {
        let h = Harness::new();
        let def = h
            .enabled_def(vec![
                ("a", node(NodeType::Noop, 0).with_next("w").with_next("x")),
                ("w", node(NodeType::Wait, 1).with_next("d")),
                ("x", node(NodeType::Noop, 2).with_next("d")),
                ("d", node(NodeType::Noop, 3)),
            ])
            .await;
        let inst = h.start(def.def_id, json!({})).await;
        h.settle().await;
        let w = rows_of(&h, inst.inst_id, "w").await.pop().unwrap();
        assert_eq!(w.status, NodeStatus::Waiting);
        assert_eq!(rows_of(&h, inst.inst_id, "x").await.len(), 1);

        h.service.restart_inst(restart_cmd(inst.inst_id, "x")).await.unwrap();
        h.settle().await;

        let w_rows = rows_of(&h, inst.inst_id, "w").await;
        assert_eq!(w_rows.len(), 1);
        assert_eq!(w_rows[0].status, NodeStatus::Waiting);
        let x_rows = rows_of(&h, inst.inst_id, "x").await;
        assert_eq!(x_rows.len(), 2);
        assert!(x_rows.iter().all(|n| n.status == NodeStatus::Completed));
        assert!(rows_of(&h, inst.inst_id, "d").await.is_empty());
        assert_eq!(inst_of(&h, inst.inst_id).await.status, InstStatus::Running);

        h.service
            .complete_node(complete_cmd(w.node_inst_id, json!({"ok": true})))
            .await
            .unwrap();
        h.settle().await;
        assert_eq!(rows_of(&h, inst.inst_id, "d").await.len(), 1);
        assert_eq!(inst_of(&h, inst.inst_id).await.status, InstStatus::Succeed);
    }

    #[tokio::test]
    async fn test_restart_from_unreached_node_keeps_waiting_node() {
        let h = Harness::new();
        let (inst, w) = waiting_flow(&h).await;

        let restarted = h.service.restart_inst(restart_cmd(inst.inst_id, "c")).await.unwrap();
        assert_eq!(restarted.status, InstStatus::Running);
        h.settle().await;

        let w_rows = rows_of(&h, inst.inst_id, "w").await;
        assert_eq!(w_rows.len(), 1);
        assert_eq!(w_rows[0].status, NodeStatus::Waiting);
        assert!(rows_of(&h, inst.inst_id, "c").await.is_empty());
        assert_eq!(inst_of(&h, inst.inst_id).await.status, InstStatus::Running);

        h.service
            .complete_node(complete_cmd(w.node_inst_id, json!({})))
            .await
            .unwrap();
        h.settle().await;
        assert_eq!(inst_of(&h, inst.inst_id).await.status, InstStatus::Succeed);
    }

    #[tokio::test]
    async fn test_restart_from_waiting_node_replaces_it() {
        let h = Harness::new();
        let (inst, w) = waiting_flow(&h).await;

        h.service.restart_inst(restart_cmd(inst.inst_id, "w")).await.unwrap();
        h.settle().await;

        let w_rows = rows_of(&h, inst.inst_id, "w").await;
        assert_eq!(w_rows.len(), 2);
        let old = w_rows.iter().find(|n| n.node_inst_id == w.node_inst_id).unwrap();
        assert_eq!(old.status, NodeStatus::Cancelled);
        let fresh = w_rows.iter().find(|n| n.node_inst_id != w.node_inst_id).unwrap();
        assert_eq!(fresh.status, NodeStatus::Waiting);
        assert_eq!(inst_of(&h, inst.inst_id).await.status, InstStatus::Running);
    }

    #[tokio::test]
    async fn test_restart_drops_superseded_outputs_from_context() {
        let h = Harness::new();
        let (inst, w) = waiting_flow(&h).await;
        h.service
            .complete_node(complete_cmd(w.node_inst_id, json!({"approved": true})))
            .await
            .unwrap();
        h.settle().await;
        let done = inst_of(&h, inst.inst_id).await;
        assert_eq!(done.status, InstStatus::Succeed);
        assert_eq!(done.context["w"]["approved"], true);

        h.service.restart_inst(restart_cmd(inst.inst_id, "w")).await.unwrap();
        h.settle().await;

        let reopened = inst_of(&h, inst.inst_id).await;
        assert_eq!(reopened.status, InstStatus::Running);
        assert!(reopened.context.get("w").is_none());
        assert!(reopened.context.get("c").is_none());
        assert!(reopened.context.get("a").is_some());
    }

    #[tokio::test]
    async fn test_rerun_node_requires_finished_run() {
        let h = Harness::new();
        let (inst, w) = waiting_flow(&h).await;
        let err = h.service.rerun_node(node_cmd(w.node_inst_id)).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));

        let a = rows_of(&h, inst.inst_id, "a").await.pop().unwrap();
        let rerun = h.service.rerun_node(node_cmd(a.node_inst_id)).await.unwrap();
        assert_eq!(rerun.status, NodeStatus::Scheduled);
        assert!(rerun.node_inst_id > w.node_inst_id);
        h.settle().await;

        let runs = rows_of(&h, inst.inst_id, "a").await;
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|n| n.status == NodeStatus::Completed));
    }

    #[tokio::test]
    async fn test_skip_and_cancel_skip() {
        let h = Harness::new();
        let (inst, w) = waiting_flow(&h).await;

        let skipped = h.service.skip_node(node_cmd(w.node_inst_id)).await.unwrap();
        assert_eq!(skipped.status, NodeStatus::Skipped);
        h.settle().await;
        assert_eq!(inst_of(&h, inst.inst_id).await.status, InstStatus::Succeed);

        let again = h
            .service
            .cancel_skip_node(node_cmd(w.node_inst_id))
            .await
            .unwrap();
        assert_eq!(again.status, NodeStatus::Scheduled);
        h.settle().await;

        let inst = inst_of(&h, inst.inst_id).await;
        assert_eq!(inst.status, InstStatus::Running);
        let latest = rows_of(&h, inst.inst_id, "w").await.pop().unwrap();
        assert_eq!(latest.node_inst_id, again.node_inst_id);
        assert_eq!(latest.status, NodeStatus::Waiting);

        let err = h
            .service
            .cancel_skip_node(node_cmd(w.node_inst_id))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_update_context_merges_patch() {
        let h = Harness::new();
        let def = h.enabled_def(vec![("w", node(NodeType::Wait, 0))]).await;
        let inst = h.start(def.def_id, json!({"a": 1, "nested": {"x": 1}})).await;
        h.settle().await;

        let updated = h
            .service
            .update_inst_context(UpdateInstContextCmd {
                inst_id: inst.inst_id,
                context: json!({"nested": {"y": 2}, "a": null}),
                operator: OPERATOR.into(),
            })
            .await
            .unwrap();
        assert_eq!(updated.context["nested"], json!({"x": 1, "y": 2}));
        assert!(updated.context.get("a").is_none());

        let err = h
            .service
            .update_inst_context(UpdateInstContextCmd {
                inst_id: inst.inst_id,
                context: json!([1, 2]),
                operator: OPERATOR.into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));

        h.service.cancel_inst(inst_cmd(inst.inst_id)).await.unwrap();
        let err = h
            .service
            .update_inst_context(UpdateInstContextCmd {
                inst_id: inst.inst_id,
                context: json!({"b": 1}),
                operator: OPERATOR.into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_node_deadlines() {
        let h = Harness::new();
        let (_, w) = waiting_flow(&h).await;
        let before = Utc::now();

        let updated = h
            .service
            .set_node_timeout(SetNodeDeadlineCmd {
                node_inst_id: w.node_inst_id,
                secs: 60,
                operator: OPERATOR.into(),
            })
            .await
            .unwrap();
        assert!(updated.timeout_at.unwrap() >= before + Duration::seconds(60));

        let updated = h
            .service
            .set_node_near_timeout(SetNodeDeadlineCmd {
                node_inst_id: w.node_inst_id,
                secs: 30,
                operator: OPERATOR.into(),
            })
            .await
            .unwrap();
        assert!(updated.near_timeout_at.is_some());
        assert!(!updated.near_timeout_alerted);

        let err = h
            .service
            .set_node_timeout(SetNodeDeadlineCmd {
                node_inst_id: 424242,
                secs: 1,
                operator: OPERATOR.into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));

        h.service
            .complete_node(complete_cmd(w.node_inst_id, json!({})))
            .await
            .unwrap();
        let err = h
            .service
            .set_node_timeout(SetNodeDeadlineCmd {
                node_inst_id: w.node_inst_id,
                secs: 1,
                operator: OPERATOR.into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_node_trigger_completes_waiting_node() {
        let h = Harness::new();
        let mut w = node(NodeType::Wait, 1).with_next("done");
        w.triggers = vec![TriggerDef::Event {
            event: "approval".into(),
            when: Some("payload.ok == true".into()),
            payload: json!({"source": "trigger"}),
        }];
        let def = h
            .enabled_def(vec![("w", w), ("done", node(NodeType::Noop, 2))])
            .await;
        let inst = h.start(def.def_id, json!({})).await;
        h.settle().await;

        h.service
            .publish_event(ExternalEvent {
                name: "approval".into(),
                inst_id: Some(inst.inst_id),
                payload: json!({"ok": false}),
            })
            .unwrap();
        h.settle().await;
        assert_eq!(inst_of(&h, inst.inst_id).await.status, InstStatus::Running);

        h.service
            .publish_event(ExternalEvent {
                name: "approval".into(),
                inst_id: Some(inst.inst_id),
                payload: json!({"ok": true}),
            })
            .unwrap();
        h.settle().await;

        let inst = inst_of(&h, inst.inst_id).await;
        assert_eq!(inst.status, InstStatus::Succeed);
        assert_eq!(inst.context["w"], json!({"source": "trigger", "ok": true}));
    }

    #[tokio::test]
    async fn test_definition_trigger_starts_instance() {
        let h = Harness::new();
        let def = h
            .enabled_def_with(vec![("w", node(NodeType::Wait, 0))], |d| {
                d.triggers = vec![TriggerDef::Event {
                    event: "order.created".into(),
                    when: None,
                    payload: json!({"channel": "web"}),
                }];
            })
            .await;

        h.service
            .publish_event(ExternalEvent {
                name: "order.created".into(),
                inst_id: None,
                payload: json!({"order": 5}),
            })
            .unwrap();
        h.settle().await;

        let page = h
            .service
            .get_inst_list(
                &InstQuery {
                    def_id: Some(def.def_id),
                    status: None,
                },
                PageRequest::default(),
            )
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        let started = &page.items[0];
        assert_eq!(started.status, InstStatus::Running);
        assert_eq!(started.context["order"], 5);
        assert_eq!(started.context["channel"], "web");
        assert!(started.operator.starts_with("trigger:"));

        h.service
            .disable_def(DefRefCmd {
                def_id: def.def_id,
                version: def.version,
                operator: OPERATOR.into(),
            })
            .await
            .unwrap();
        h.service
            .publish_event(ExternalEvent {
                name: "order.created".into(),
                inst_id: None,
                payload: json!({}),
            })
            .unwrap();
        h.settle().await;
        let page = h
            .service
            .get_inst_list(&InstQuery::default(), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn test_publish_event_requires_name() {
        let h = Harness::new();
        let err = h
            .service
            .publish_event(ExternalEvent {
                name: " ".into(),
                inst_id: None,
                payload: Value::Null,
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_inst_detail_survives_archival() {
        let h = Harness::new();
        let def = h
            .enabled_def(vec![
                ("a", node(NodeType::Noop, 0).with_next("b")),
                ("b", node(NodeType::Noop, 1)),
            ])
            .await;
        let inst = h.start(def.def_id, json!({})).await;
        h.settle().await;

        let live = h.service.get_inst_detail(inst.inst_id).await.unwrap();
        assert!(!live.archived);
        assert_eq!(live.nodes.len(), 2);

        let report = h
            .service
            .archive_history(ArchiveHistoryCmd {
                def_id: def.def_id,
                inst_ids: vec![inst.inst_id],
                operator: OPERATOR.into(),
            })
            .await
            .unwrap();
        assert_eq!(report.archived, vec![inst.inst_id]);

        let archived = h.service.get_inst_detail(inst.inst_id).await.unwrap();
        assert!(archived.archived);
        assert_eq!(archived.inst.status, InstStatus::Succeed);
        assert_eq!(archived.nodes.len(), 2);

        let err = h.service.get_inst_detail(424242).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
