//! Built-in node handlers that need nothing beyond the engine itself.
//!
//! `Http` lives in dagflow-infra since it needs an HTTP client.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dagflow_types::definition::NodeType;
use dagflow_types::error::EngineError;
use dagflow_types::instance::{InstStatus, WorkflowInst};
use dagflow_types::node::NodeInst;
use serde_json::{Value, json};

use super::launcher::{InstanceLauncher, StartRequest};
use super::runner::{NodeContext, NodeHandler, NodeOutcome, PollOutcome};
use crate::repository::WorkflowStore;

/// Re-check interval for sub-workflow nodes without `poll_interval_secs`.
/// Children notify their parent when they end, so this is only a backstop.
const SUB_WORKFLOW_POLL_SECS: u64 = 30;

/// Pass-through: the node's output is its params.
pub struct NoopHandler;

impl NodeHandler for NoopHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Noop
    }

    async fn execute(&self, ctx: &NodeContext) -> Result<NodeOutcome, EngineError> {
        let output = if ctx.params.is_null() {
            json!({})
        } else {
            ctx.params.clone()
        };
        Ok(NodeOutcome::Completed(output))
    }
}

/// Parks until CompleteNode, SkipNode, or a node-level trigger.
pub struct WaitHandler;

impl NodeHandler for WaitHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Wait
    }

    async fn execute(&self, _ctx: &NodeContext) -> Result<NodeOutcome, EngineError> {
        Ok(NodeOutcome::Waiting {
            poll_input: None,
            next_poll_at: None,
        })
    }
}

/// Timer node: `params.secs` after dispatch the poller completes it.
pub struct DelayHandler;

fn fire_at(node: &NodeInst) -> Result<DateTime<Utc>, EngineError> {
    node.poll_input
        .as_ref()
        .and_then(|p| p.get("fire_at"))
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| EngineError::invalid(format!("node {} has no fire_at", node.node_inst_id)))
}

impl NodeHandler for DelayHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Delay
    }

    async fn execute(&self, ctx: &NodeContext) -> Result<NodeOutcome, EngineError> {
        let Some(secs) = ctx.params.get("secs").and_then(Value::as_u64) else {
            return Ok(NodeOutcome::Failed("delay node needs params.secs".to_string()));
        };
        let fire_at = Utc::now() + Duration::seconds(secs as i64);
        Ok(NodeOutcome::Waiting {
            poll_input: Some(json!({ "fire_at": fire_at.to_rfc3339() })),
            next_poll_at: Some(fire_at),
        })
    }

    async fn poll(&self, node: &NodeInst) -> Result<PollOutcome, EngineError> {
        let at = fire_at(node)?;
        if Utc::now() >= at {
            Ok(PollOutcome::Completed(json!({ "fired_at": at.to_rfc3339() })))
        } else {
            Ok(PollOutcome::Pending(Some(at)))
        }
    }
}

/// Starts a child instance of `params.def_id` and waits for it to end.
pub struct SubWorkflowHandler<S: WorkflowStore> {
    store: Arc<S>,
    launcher: Arc<InstanceLauncher<S>>,
}

impl<S: WorkflowStore> SubWorkflowHandler<S> {
    pub fn new(store: Arc<S>, launcher: Arc<InstanceLauncher<S>>) -> Self {
        Self { store, launcher }
    }
}

/// How a finished child resolves its parent node; `None` while it runs.
pub fn child_outcome(child: &WorkflowInst) -> Option<PollOutcome> {
    match child.status {
        InstStatus::Running | InstStatus::Paused => None,
        InstStatus::Succeed => Some(PollOutcome::Completed(json!({
            "child_inst_id": child.inst_id,
            "status": child.status,
            "context": child.context,
        }))),
        other => Some(PollOutcome::Failed(format!(
            "sub-workflow instance {} ended {other}",
            child.inst_id
        ))),
    }
}

impl<S: WorkflowStore> NodeHandler for SubWorkflowHandler<S> {
    fn node_type(&self) -> NodeType {
        NodeType::SubWorkflow
    }

    async fn execute(&self, ctx: &NodeContext) -> Result<NodeOutcome, EngineError> {
        let Some(def_id) = ctx.params.get("def_id").and_then(Value::as_i64) else {
            return Ok(NodeOutcome::Failed("sub_workflow node needs params.def_id".to_string()));
        };
        let version = ctx
            .params
            .get("version")
            .and_then(Value::as_i64)
            .map(|v| v as i32);
        let context = ctx.params.get("context").cloned().unwrap_or(Value::Null);

        let child = match self
            .launcher
            .start(StartRequest {
                def_id,
                version,
                context,
                operator: ctx.operator.clone(),
                parent: Some((ctx.inst_id, ctx.node_inst_id)),
            })
            .await
        {
            Ok(child) => child,
            Err(e @ (EngineError::InvalidArgument(_) | EngineError::NotFound(_))) => {
                return Ok(NodeOutcome::Failed(e.to_string()));
            }
            Err(e) => return Err(e),
        };

        let interval = ctx.poll_interval_secs.unwrap_or(SUB_WORKFLOW_POLL_SECS);
        Ok(NodeOutcome::Waiting {
            poll_input: Some(json!({ "child_inst_id": child.inst_id })),
            next_poll_at: Some(Utc::now() + Duration::seconds(interval as i64)),
        })
    }

    async fn poll(&self, node: &NodeInst) -> Result<PollOutcome, EngineError> {
        let child_id = node
            .poll_input
            .as_ref()
            .and_then(|p| p.get("child_inst_id"))
            .and_then(Value::as_i64)
            .ok_or_else(|| EngineError::invalid(format!("node {} has no child instance", node.node_inst_id)))?;

        let child = match self.store.get_instance(child_id).await? {
            Some(child) => Some(child),
            None => self.store.get_history_instance(child_id).await?,
        };
        match child {
            Some(child) => Ok(child_outcome(&child).unwrap_or(PollOutcome::Pending(None))),
            None => Ok(PollOutcome::Failed(format!(
                "sub-workflow instance {child_id} no longer exists"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(params: Value) -> NodeContext {
        NodeContext {
            inst_id: 1,
            def_id: 1,
            version: 1,
            node_inst_id: 1,
            ref_name: "a".into(),
            params,
            context: json!({}),
            operator: "ops".into(),
            poll_interval_secs: None,
        }
    }

    fn waiting_node(poll_input: Value) -> NodeInst {
        let now = Utc::now();
        NodeInst {
            node_inst_id: 9,
            def_id: 1,
            inst_id: 1,
            ref_name: "d".into(),
            node_type: NodeType::Delay,
            status: dagflow_types::node::NodeStatus::Waiting,
            input: None,
            output: None,
            poll_input: Some(poll_input),
            poll_output: None,
            error: None,
            nexts: vec![],
            parents: vec![],
            scheduled_at: now,
            completed_at: None,
            timeout_at: None,
            near_timeout_at: None,
            near_timeout_alerted: false,
            next_poll_at: None,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_noop_outputs_params() {
        let out = NoopHandler.execute(&ctx(json!({"k": "v"}))).await.unwrap();
        assert_eq!(out, NodeOutcome::Completed(json!({"k": "v"})));
        let out = NoopHandler.execute(&ctx(Value::Null)).await.unwrap();
        assert_eq!(out, NodeOutcome::Completed(json!({})));
    }

    #[tokio::test]
    async fn test_delay_waits_then_completes() {
        let out = DelayHandler.execute(&ctx(json!({"secs": 60}))).await.unwrap();
        let NodeOutcome::Waiting {
            poll_input: Some(input),
            next_poll_at: Some(at),
        } = out
        else {
            panic!("expected waiting outcome");
        };
        assert!(at > Utc::now());
        let pending = DelayHandler.poll(&waiting_node(input)).await.unwrap();
        assert!(matches!(pending, PollOutcome::Pending(Some(_))));

        let past = json!({"fire_at": (Utc::now() - Duration::seconds(1)).to_rfc3339()});
        let done = DelayHandler.poll(&waiting_node(past)).await.unwrap();
        assert!(matches!(done, PollOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn test_delay_without_secs_fails() {
        let out = DelayHandler.execute(&ctx(json!({}))).await.unwrap();
        assert!(matches!(out, NodeOutcome::Failed(_)));
    }

    #[test]
    fn test_child_outcome_by_status() {
        let now = Utc::now();
        let mut child = WorkflowInst {
            inst_id: 4,
            def_id: 2,
            version: 1,
            status: InstStatus::Running,
            context: json!({"done": true}),
            execute_path: vec![],
            sched_node_insts: vec![],
            cur_node_inst: None,
            parent_inst_id: Some(1),
            parent_node_inst_id: Some(3),
            operator: "ops".into(),
            reason: None,
            last_restart_node: None,
            last_restart_at: None,
            before_last_restart_max_node_inst_id: 0,
            timeout_at: None,
            created_at: now,
            updated_at: now,
            ended_at: None,
        };
        assert!(child_outcome(&child).is_none());

        child.status = InstStatus::Succeed;
        let Some(PollOutcome::Completed(out)) = child_outcome(&child) else {
            panic!("expected completion");
        };
        assert_eq!(out["context"]["done"], true);
        assert_eq!(out["status"], "succeed");

        child.status = InstStatus::Cancelled;
        assert!(matches!(child_outcome(&child), Some(PollOutcome::Failed(_))));
    }
}
