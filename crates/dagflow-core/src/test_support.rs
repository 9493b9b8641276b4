//! Shared fixtures for engine tests.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::Arc;

use dagflow_types::command::{CreateDefCmd, DefRefCmd, StartInstCmd};
use dagflow_types::config::EngineConfig;
use dagflow_types::definition::{NodeDef, NodeType, WorkflowDef};
use dagflow_types::instance::WorkflowInst;
use dagflow_types::message::DriveEvent;
use serde_json::Value;

use crate::lock::MemoryLocker;
use crate::repository::memory::MemoryWorkflowStore;
use crate::service::Engine;

pub(crate) const OPERATOR: &str = "tester";

pub(crate) fn node(node_type: NodeType, index: u32) -> NodeDef {
    NodeDef::new(node_type, index)
}

/// An in-memory engine whose bus is drained inline by `settle`.
pub(crate) struct Harness {
    engine: Engine<MemoryWorkflowStore, MemoryLocker>,
}

impl Deref for Harness {
    type Target = Engine<MemoryWorkflowStore, MemoryLocker>;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub(crate) fn with_config(tweak: impl FnOnce(&mut EngineConfig)) -> Self {
        let mut config = EngineConfig::default();
        config.lock.retry_backoff_ms = 1;
        config.bus.base_backoff_ms = 1;
        config.bus.max_backoff_ms = 5;
        tweak(&mut config);
        let engine = Engine::new(
            config,
            Arc::new(MemoryWorkflowStore::new()),
            Arc::new(MemoryLocker::new()),
            |_| {},
        );
        Self { engine }
    }

    pub(crate) fn def_cmd(nodes: Vec<(&str, NodeDef)>) -> CreateDefCmd {
        CreateDefCmd {
            def_id: None,
            name: "test-flow".to_string(),
            description: String::new(),
            nodes: nodes
                .into_iter()
                .map(|(name, def)| (name.to_string(), def))
                .collect::<BTreeMap<_, _>>(),
            parent_def_id: None,
            ref_name: None,
            timeout_secs: None,
            triggers: Vec::new(),
            inst_triggers: Vec::new(),
            operator: OPERATOR.to_string(),
        }
    }

    pub(crate) async fn enabled_def(&self, nodes: Vec<(&str, NodeDef)>) -> WorkflowDef {
        self.enabled_def_with(nodes, |_| {}).await
    }

    pub(crate) async fn enabled_def_with(
        &self,
        nodes: Vec<(&str, NodeDef)>,
        tweak: impl FnOnce(&mut CreateDefCmd),
    ) -> WorkflowDef {
        let mut cmd = Self::def_cmd(nodes);
        tweak(&mut cmd);
        let def = self.service.create_def(cmd).await.unwrap();
        self.service
            .enable_def(DefRefCmd {
                def_id: def.def_id,
                version: def.version,
                operator: OPERATOR.to_string(),
            })
            .await
            .unwrap()
    }

    pub(crate) async fn start(&self, def_id: i64, context: Value) -> WorkflowInst {
        self.service
            .start_inst(StartInstCmd {
                def_id,
                version: None,
                context,
                operator: OPERATOR.to_string(),
            })
            .await
            .unwrap()
    }

    /// Deliver queued bus messages until the bus is quiet.
    pub(crate) async fn settle(&self) -> usize {
        self.bus.process_pending(self.consumer.as_ref()).await
    }

    pub(crate) async fn drive(&self, inst_id: i64) {
        self.executor
            .drive(&DriveEvent {
                inst_id,
                cause: "test".to_string(),
            })
            .await
            .unwrap();
    }
}
