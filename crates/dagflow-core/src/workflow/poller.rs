//! Node poller: completes `Waiting` nodes whose handlers report progress
//! (timers, sub-workflows) on a bounded worker pool.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dagflow_types::config::PollerConfig;
use dagflow_types::error::EngineError;
use dagflow_types::event::EngineEvent;
use dagflow_types::message::BusMessage;
use dagflow_types::node::{NodeInst, NodeStatus, NodeUpdate};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::runner::{NodeHandlerRegistry, PollOutcome};
use crate::message::MessageBus;
use crate::repository::WorkflowStore;

pub struct NodePoller<S: WorkflowStore> {
    store: Arc<S>,
    handlers: Arc<NodeHandlerRegistry>,
    bus: MessageBus,
    config: PollerConfig,
    workers: Arc<Semaphore>,
}

impl<S: WorkflowStore> NodePoller<S> {
    pub fn new(
        store: Arc<S>,
        handlers: Arc<NodeHandlerRegistry>,
        bus: MessageBus,
        config: PollerConfig,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.workers.max(1)));
        Self {
            store,
            handlers,
            bus,
            config,
            workers,
        }
    }

    /// Poll every due node once. Returns how many nodes reached a terminal
    /// status.
    pub async fn sweep(self: &Arc<Self>, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let due = self
            .store
            .list_pollable_nodes(now, self.config.batch_size)
            .await?;
        if due.is_empty() {
            return Ok(0);
        }
        debug!(due = due.len(), "polling waiting nodes");

        let mut set = JoinSet::new();
        for node in due {
            // Waits here when every worker is busy.
            let permit = Arc::clone(&self.workers)
                .acquire_owned()
                .await
                .map_err(|_| EngineError::internal("poller worker pool closed"))?;
            let poller = Arc::clone(self);
            set.spawn(async move {
                let _permit = permit;
                let node_inst_id = node.node_inst_id;
                (node_inst_id, poller.poll_node(node).await)
            });
        }

        let mut resolved = 0;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(Some(status)))) if status.is_terminal() => resolved += 1,
                Ok((_, Ok(_))) => {}
                Ok((node_inst_id, Err(e))) => warn!(node_inst_id, error = %e, "node poll failed"),
                Err(e) => warn!(error = %e, "node poll task panicked"),
            }
        }
        Ok(resolved)
    }

    /// Poll one waiting node right away (ResumeNode). Returns its status
    /// afterwards.
    pub async fn poll_now(&self, node_inst_id: i64) -> Result<NodeStatus, EngineError> {
        let node = self
            .store
            .get_node_inst(node_inst_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("node instance {node_inst_id}")))?;
        if node.status != NodeStatus::Waiting {
            return Err(EngineError::invalid(format!(
                "node instance {node_inst_id} is {}, not waiting",
                node.status
            )));
        }
        if node.poll_input.is_none() {
            return Err(EngineError::invalid(format!(
                "node instance {node_inst_id} has nothing to poll"
            )));
        }
        Ok(self.poll_node(node).await?.unwrap_or(NodeStatus::Waiting))
    }

    /// Returns the new status, or `None` when the node was left waiting or
    /// another writer moved it first.
    async fn poll_node(&self, node: NodeInst) -> Result<Option<NodeStatus>, EngineError> {
        if node.poll_input.is_none() {
            return Ok(None);
        }
        let Some(handler) = self.handlers.get(node.node_type) else {
            return Err(EngineError::internal(format!(
                "no handler registered for node type '{}'",
                node.node_type
            )));
        };

        let now = Utc::now();
        let outcome = match handler.poll(&node).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.reschedule(&node, None, now).await?;
                return Err(e);
            }
        };

        let (status, update) = match outcome {
            PollOutcome::Pending(at) => {
                self.reschedule(&node, at, now).await?;
                return Ok(None);
            }
            PollOutcome::Completed(output) => (
                NodeStatus::Completed,
                NodeUpdate {
                    poll_output: Some(output.clone()),
                    ..NodeUpdate::completed(output, now)
                },
            ),
            PollOutcome::Failed(message) => (NodeStatus::Failed, NodeUpdate::failed(message, now)),
        };

        let moved = self
            .store
            .transition_node(node.node_inst_id, node.inst_id, &[NodeStatus::Waiting], status, &update)
            .await?;
        if !moved {
            return Ok(None);
        }
        debug!(
            inst_id = node.inst_id,
            node_inst_id = node.node_inst_id,
            ref_name = %node.ref_name,
            %status,
            "polled node finished"
        );
        self.bus.events().publish(EngineEvent::NodeFinished {
            inst_id: node.inst_id,
            node_inst_id: node.node_inst_id,
            ref_name: node.ref_name.clone(),
            status,
        });
        self.bus.publish(BusMessage::drive(node.inst_id, "node polled"))?;
        Ok(Some(status))
    }

    async fn reschedule(
        &self,
        node: &NodeInst,
        at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let at = at.filter(|t| *t > now).unwrap_or_else(|| {
            now + Duration::seconds(self.config.default_interval_secs.max(1) as i64)
        });
        self.store.set_next_poll(node.node_inst_id, node.inst_id, at).await?;
        Ok(())
    }
}
