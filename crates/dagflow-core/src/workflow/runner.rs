//! Node execution: the `NodeHandler` port, its type-erased registry, and the
//! `NodeRunner` that moves one node instance through
//! `Scheduled -> Running -> {Completed, Waiting, Failed, Skipped}`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dagflow_types::definition::{NodeType, WorkflowDef};
use dagflow_types::error::EngineError;
use dagflow_types::event::EngineEvent;
use dagflow_types::instance::WorkflowInst;
use dagflow_types::node::{NodeInst, NodeStatus, NodeUpdate};
use dagflow_types::trigger::TriggerScope;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::trigger::TriggerRegistry;
use crate::event::EventBus;
use crate::repository::WorkflowStore;

// ---------------------------------------------------------------------------
// Handler port
// ---------------------------------------------------------------------------

/// What a handler sees when it executes a node.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub inst_id: i64,
    pub def_id: i64,
    pub version: i32,
    pub node_inst_id: i64,
    pub ref_name: String,
    pub params: Value,
    /// Instance context at dispatch time.
    pub context: Value,
    pub operator: String,
    pub poll_interval_secs: Option<u64>,
}

/// Result of executing a node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    Completed(Value),
    /// Park in `Waiting`. Nodes with a `poll_input` are picked up by the
    /// poller at `next_poll_at`; the rest wait for an operator or a trigger.
    Waiting {
        poll_input: Option<Value>,
        next_poll_at: Option<DateTime<Utc>>,
    },
    Failed(String),
}

/// Result of polling a waiting node.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Completed(Value),
    Failed(String),
    /// Not done yet; poll again at the given time (poller default if `None`).
    Pending(Option<DateTime<Utc>>),
}

/// Executes one kind of node.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
/// Register implementations through [`BoxNodeHandler`].
pub trait NodeHandler: Send + Sync + 'static {
    fn node_type(&self) -> NodeType;

    /// Run the node. Returning `EngineError::Retryable` puts the node back
    /// to `Scheduled` so the drive is retried.
    fn execute(
        &self,
        ctx: &NodeContext,
    ) -> impl Future<Output = Result<NodeOutcome, EngineError>> + Send;

    /// Check on a `Waiting` node that carries a `poll_input`.
    fn poll(&self, _node: &NodeInst) -> impl Future<Output = Result<PollOutcome, EngineError>> + Send {
        async { Ok(PollOutcome::Pending(None)) }
    }
}

/// Object-safe version of [`NodeHandler`] with boxed futures.
///
/// This trait exists solely to enable dynamic dispatch (`dyn NodeHandlerDyn`).
pub trait NodeHandlerDyn: Send + Sync {
    fn node_type_dyn(&self) -> NodeType;

    fn execute_boxed<'a>(
        &'a self,
        ctx: &'a NodeContext,
    ) -> Pin<Box<dyn Future<Output = Result<NodeOutcome, EngineError>> + Send + 'a>>;

    fn poll_boxed<'a>(
        &'a self,
        node: &'a NodeInst,
    ) -> Pin<Box<dyn Future<Output = Result<PollOutcome, EngineError>> + Send + 'a>>;
}

impl<T: NodeHandler> NodeHandlerDyn for T {
    fn node_type_dyn(&self) -> NodeType {
        self.node_type()
    }

    fn execute_boxed<'a>(
        &'a self,
        ctx: &'a NodeContext,
    ) -> Pin<Box<dyn Future<Output = Result<NodeOutcome, EngineError>> + Send + 'a>> {
        Box::pin(self.execute(ctx))
    }

    fn poll_boxed<'a>(
        &'a self,
        node: &'a NodeInst,
    ) -> Pin<Box<dyn Future<Output = Result<PollOutcome, EngineError>> + Send + 'a>> {
        Box::pin(self.poll(node))
    }
}

/// Type-erased node handler.
pub struct BoxNodeHandler {
    inner: Box<dyn NodeHandlerDyn>,
}

impl BoxNodeHandler {
    pub fn new<T: NodeHandler>(handler: T) -> Self {
        Self {
            inner: Box::new(handler),
        }
    }

    pub fn node_type(&self) -> NodeType {
        self.inner.node_type_dyn()
    }

    pub async fn execute(&self, ctx: &NodeContext) -> Result<NodeOutcome, EngineError> {
        self.inner.execute_boxed(ctx).await
    }

    pub async fn poll(&self, node: &NodeInst) -> Result<PollOutcome, EngineError> {
        self.inner.poll_boxed(node).await
    }
}

/// `NodeType -> handler` dispatch table, built once at startup.
#[derive(Default)]
pub struct NodeHandlerRegistry {
    handlers: HashMap<NodeType, BoxNodeHandler>,
}

impl NodeHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler, replacing any previous one for the same type.
    pub fn register<T: NodeHandler>(&mut self, handler: T) -> &mut Self {
        let handler = BoxNodeHandler::new(handler);
        self.handlers.insert(handler.node_type(), handler);
        self
    }

    pub fn get(&self, node_type: NodeType) -> Option<&BoxNodeHandler> {
        self.handlers.get(&node_type)
    }

    pub fn node_types(&self) -> Vec<NodeType> {
        let mut types: Vec<NodeType> = self.handlers.keys().copied().collect();
        types.sort();
        types
    }
}

// ---------------------------------------------------------------------------
// NodeRunner
// ---------------------------------------------------------------------------

pub struct NodeRunner<S: WorkflowStore> {
    store: Arc<S>,
    handlers: Arc<NodeHandlerRegistry>,
    triggers: Arc<TriggerRegistry<S>>,
    events: EventBus,
}

impl<S: WorkflowStore> NodeRunner<S> {
    pub fn new(
        store: Arc<S>,
        handlers: Arc<NodeHandlerRegistry>,
        triggers: Arc<TriggerRegistry<S>>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            handlers,
            triggers,
            events,
        }
    }

    /// Execute a `Scheduled` node. Returns the status the node ended in, or
    /// `None` when another writer had already claimed it.
    pub async fn run(
        &self,
        inst: &WorkflowInst,
        def: &WorkflowDef,
        node: &NodeInst,
    ) -> Result<Option<NodeStatus>, EngineError> {
        let Some(node_def) = def.nodes.get(&node.ref_name) else {
            return Err(EngineError::invalid(format!(
                "node '{}' is not part of definition {} version {}",
                node.ref_name, def.def_id, def.version
            )));
        };

        let claim = NodeUpdate {
            input: Some(node_def.params.clone()),
            ..Default::default()
        };
        let claimed = self
            .store
            .transition_node(
                node.node_inst_id,
                node.inst_id,
                &[NodeStatus::Scheduled],
                NodeStatus::Running,
                &claim,
            )
            .await?;
        if !claimed {
            debug!(node_inst_id = node.node_inst_id, "node already claimed");
            return Ok(None);
        }

        let ctx = NodeContext {
            inst_id: inst.inst_id,
            def_id: inst.def_id,
            version: inst.version,
            node_inst_id: node.node_inst_id,
            ref_name: node.ref_name.clone(),
            params: node_def.params.clone(),
            context: inst.context.clone(),
            operator: inst.operator.clone(),
            poll_interval_secs: node_def.poll_interval_secs,
        };

        let outcome = match self.handlers.get(node.node_type) {
            Some(handler) => handler.execute(&ctx).await,
            None => Ok(NodeOutcome::Failed(format!(
                "no handler registered for node type '{}'",
                node.node_type
            ))),
        };

        let now = Utc::now();
        let (status, update) = match outcome {
            Ok(NodeOutcome::Completed(output)) => {
                (NodeStatus::Completed, NodeUpdate::completed(output, now))
            }
            Ok(NodeOutcome::Waiting {
                poll_input,
                next_poll_at,
            }) => (
                NodeStatus::Waiting,
                NodeUpdate {
                    poll_input,
                    next_poll_at,
                    ..Default::default()
                },
            ),
            Ok(NodeOutcome::Failed(message)) => {
                (failure_status(node_def.skippable), NodeUpdate::failed(message, now))
            }
            Err(e) if e.is_retryable() => {
                warn!(node_inst_id = node.node_inst_id, error = %e, "node execution will be retried");
                self.store
                    .transition_node(
                        node.node_inst_id,
                        node.inst_id,
                        &[NodeStatus::Running],
                        NodeStatus::Scheduled,
                        &NodeUpdate::default(),
                    )
                    .await?;
                return Err(e);
            }
            Err(e) => (
                failure_status(node_def.skippable),
                NodeUpdate::failed(e.to_string(), now),
            ),
        };

        let moved = self
            .store
            .transition_node(node.node_inst_id, node.inst_id, &[NodeStatus::Running], status, &update)
            .await?;
        if !moved {
            debug!(node_inst_id = node.node_inst_id, "node changed while executing");
            return Ok(None);
        }

        if status == NodeStatus::Waiting {
            self.triggers
                .register(
                    &TriggerScope::node(inst.def_id, inst.version, inst.inst_id, Some(&node.ref_name)),
                    &node_def.triggers,
                )
                .await?;
            debug!(inst_id = inst.inst_id, ref_name = %node.ref_name, "node waiting");
        } else {
            info!(
                inst_id = inst.inst_id,
                node_inst_id = node.node_inst_id,
                ref_name = %node.ref_name,
                %status,
                "node finished"
            );
            self.events.publish(EngineEvent::NodeFinished {
                inst_id: inst.inst_id,
                node_inst_id: node.node_inst_id,
                ref_name: node.ref_name.clone(),
                status,
            });
        }
        Ok(Some(status))
    }
}

/// Terminal status of a failed node.
pub fn failure_status(skippable: bool) -> NodeStatus {
    if skippable {
        NodeStatus::Skipped
    } else {
        NodeStatus::Failed
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
