//! Instance creation shared by StartInst, definition-level triggers, and
//! sub-workflow nodes.

use std::sync::Arc;

use chrono::{Duration, Utc};
use dagflow_types::definition::DefStatus;
use dagflow_types::error::EngineError;
use dagflow_types::event::EngineEvent;
use dagflow_types::instance::{NewWorkflowInst, WorkflowInst};
use dagflow_types::message::BusMessage;
use dagflow_types::trigger::TriggerScope;
use serde_json::{Value, json};
use tracing::info;

use super::trigger::TriggerRegistry;
use crate::message::MessageBus;
use crate::repository::WorkflowStore;

/// Everything needed to start one instance.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub def_id: i64,
    /// Latest version when `None`.
    pub version: Option<i32>,
    pub context: Value,
    pub operator: String,
    /// `(parent_inst_id, parent_node_inst_id)` for sub-workflows.
    pub parent: Option<(i64, i64)>,
}

pub struct InstanceLauncher<S: WorkflowStore> {
    store: Arc<S>,
    bus: MessageBus,
    triggers: Arc<TriggerRegistry<S>>,
}

impl<S: WorkflowStore> InstanceLauncher<S> {
    pub fn new(store: Arc<S>, bus: MessageBus, triggers: Arc<TriggerRegistry<S>>) -> Self {
        Self {
            store,
            bus,
            triggers,
        }
    }

    /// Create a `Running` instance of an enabled definition, register its
    /// instance-level triggers, and publish the first drive.
    pub async fn start(&self, req: StartRequest) -> Result<WorkflowInst, EngineError> {
        let def = self
            .store
            .get_definition(req.def_id, req.version)
            .await?
            .ok_or_else(|| match req.version {
                Some(v) => EngineError::not_found(format!("definition {} version {v}", req.def_id)),
                None => EngineError::not_found(format!("definition {}", req.def_id)),
            })?;
        if def.status != DefStatus::Enabled {
            return Err(EngineError::invalid(format!(
                "definition {} version {} is disabled",
                def.def_id, def.version
            )));
        }

        let context = match req.context {
            Value::Null => json!({}),
            Value::Object(_) => req.context,
            _ => return Err(EngineError::invalid("instance context must be a JSON object")),
        };

        let timeout_at = def
            .timeout_secs
            .map(|secs| Utc::now() + Duration::seconds(secs as i64));
        let new = NewWorkflowInst {
            def_id: def.def_id,
            version: def.version,
            context,
            operator: req.operator,
            parent_inst_id: req.parent.map(|(inst, _)| inst),
            parent_node_inst_id: req.parent.map(|(_, node)| node),
            timeout_at,
        };
        let inst = self.store.create_instance(&new).await?;

        self.triggers
            .register(
                &TriggerScope::instance(def.def_id, def.version, inst.inst_id),
                &def.inst_triggers,
            )
            .await?;

        info!(
            inst_id = inst.inst_id,
            def_id = def.def_id,
            version = def.version,
            parent_inst_id = ?inst.parent_inst_id,
            "instance started"
        );
        self.bus.events().publish(EngineEvent::InstanceStarted {
            inst_id: inst.inst_id,
            def_id: def.def_id,
            version: def.version,
        });
        self.bus.publish(BusMessage::drive(inst.inst_id, "started"))?;
        Ok(inst)
    }
}
