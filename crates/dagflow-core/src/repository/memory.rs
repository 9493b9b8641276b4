//! In-memory `WorkflowStore` backed by `DashMap`.
//!
//! Used by the engine's own tests and by `storage = "memory"` deployments.
//! Compare-and-set operations are atomic per row because each check and
//! write happens under the row's shard lock.

use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use dagflow_types::command::{DefQuery, InstQuery, Page, PageRequest};
use dagflow_types::definition::{DefStatus, NewWorkflowDef, WorkflowDef};
use dagflow_types::error::RepositoryError;
use dagflow_types::instance::{InstStatus, InstTransition, NewWorkflowInst, WorkflowInst};
use dagflow_types::node::{NewNodeInst, NodeInst, NodeStatus, NodeUpdate};
use dagflow_types::trigger::{NewTrigger, Trigger, TriggerKind, TriggerScope, TriggerStatus};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::definition::DefinitionRepository;
use super::history::HistoryRepository;
use super::instance::InstanceRepository;
use super::node::NodeRepository;
use super::trigger::TriggerRepository;

/// Volatile store implementing every repository port.
pub struct MemoryWorkflowStore {
    /// def_id -> versions in ascending order.
    defs: DashMap<i64, Vec<WorkflowDef>>,
    insts: DashMap<i64, WorkflowInst>,
    nodes: DashMap<i64, NodeInst>,
    triggers: DashMap<i64, Trigger>,
    inst_history: DashMap<i64, WorkflowInst>,
    node_history: DashMap<i64, NodeInst>,
    next_def_id: AtomicI64,
    next_inst_id: AtomicI64,
    next_node_id: AtomicI64,
    next_trigger_id: AtomicI64,
    /// Serializes the lookup-then-insert of trigger upserts.
    trigger_upsert: Mutex<()>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self {
            defs: DashMap::new(),
            insts: DashMap::new(),
            nodes: DashMap::new(),
            triggers: DashMap::new(),
            inst_history: DashMap::new(),
            node_history: DashMap::new(),
            next_def_id: AtomicI64::new(1),
            next_inst_id: AtomicI64::new(1),
            next_node_id: AtomicI64::new(1),
            next_trigger_id: AtomicI64::new(1),
            trigger_upsert: Mutex::new(()),
        }
    }
}

impl Default for MemoryWorkflowStore {
    fn default() -> Self {
        Self::new()
    }
}

fn paginate<T>(mut all: Vec<T>, page: PageRequest) -> Page<T> {
    let total = all.len() as u64;
    let offset = page.offset() as usize;
    let items = if offset >= all.len() {
        Vec::new()
    } else {
        all.drain(offset..)
            .take(page.limit() as usize)
            .collect()
    };
    Page {
        items,
        total,
        page: page.page,
        page_size: page.limit(),
    }
}

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

impl DefinitionRepository for MemoryWorkflowStore {
    async fn create_definition(&self, new: &NewWorkflowDef) -> Result<WorkflowDef, RepositoryError> {
        let now = Utc::now();
        let build = |def_id: i64, version: i32| WorkflowDef {
            def_id,
            version,
            name: new.name.clone(),
            creator: new.creator.clone(),
            description: new.description.clone(),
            nodes: new.nodes.clone(),
            status: new.status,
            parent_def_id: new.parent_def_id,
            ref_name: new.ref_name.clone(),
            timeout_secs: new.timeout_secs,
            triggers: new.triggers.clone(),
            inst_triggers: new.inst_triggers.clone(),
            created_at: now,
            updated_at: now,
        };

        match new.def_id {
            Some(def_id) => {
                let mut versions = self.defs.get_mut(&def_id).ok_or(RepositoryError::NotFound)?;
                let version = versions.last().map(|d| d.version).unwrap_or(0) + 1;
                let def = build(def_id, version);
                versions.push(def.clone());
                Ok(def)
            }
            None => {
                let def_id = self.next_def_id.fetch_add(1, Ordering::SeqCst);
                let def = build(def_id, 1);
                self.defs.insert(def_id, vec![def.clone()]);
                Ok(def)
            }
        }
    }

    async fn get_definition(
        &self,
        def_id: i64,
        version: Option<i32>,
    ) -> Result<Option<WorkflowDef>, RepositoryError> {
        let Some(versions) = self.defs.get(&def_id) else {
            return Ok(None);
        };
        Ok(match version {
            Some(v) => versions.iter().find(|d| d.version == v).cloned(),
            None => versions.last().cloned(),
        })
    }

    async fn update_definition_meta(
        &self,
        def_id: i64,
        version: i32,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<bool, RepositoryError> {
        let Some(mut versions) = self.defs.get_mut(&def_id) else {
            return Ok(false);
        };
        let Some(def) = versions.iter_mut().find(|d| d.version == version) else {
            return Ok(false);
        };
        if let Some(name) = name {
            def.name = name.to_string();
        }
        if let Some(description) = description {
            def.description = description.to_string();
        }
        def.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_definition_status(
        &self,
        def_id: i64,
        version: i32,
        status: DefStatus,
    ) -> Result<bool, RepositoryError> {
        let Some(mut versions) = self.defs.get_mut(&def_id) else {
            return Ok(false);
        };
        let Some(def) = versions.iter_mut().find(|d| d.version == version) else {
            return Ok(false);
        };
        def.status = status;
        def.updated_at = Utc::now();
        Ok(true)
    }

    async fn list_definitions(
        &self,
        query: &DefQuery,
        page: PageRequest,
    ) -> Result<Page<WorkflowDef>, RepositoryError> {
        let mut all: Vec<WorkflowDef> = self
            .defs
            .iter()
            .flat_map(|e| e.value().clone())
            .filter(|d| query.status.is_none_or(|s| d.status == s))
            .filter(|d| {
                query
                    .name
                    .as_deref()
                    .is_none_or(|n| d.name.contains(n))
            })
            .collect();
        all.sort_by(|a, b| b.def_id.cmp(&a.def_id).then(b.version.cmp(&a.version)));
        Ok(paginate(all, page))
    }
}

// ---------------------------------------------------------------------------
// Instances
// ---------------------------------------------------------------------------

impl InstanceRepository for MemoryWorkflowStore {
    async fn create_instance(&self, new: &NewWorkflowInst) -> Result<WorkflowInst, RepositoryError> {
        let now = Utc::now();
        let inst_id = self.next_inst_id.fetch_add(1, Ordering::SeqCst);
        let context = if new.context.is_null() {
            serde_json::json!({})
        } else {
            new.context.clone()
        };
        let inst = WorkflowInst {
            inst_id,
            def_id: new.def_id,
            version: new.version,
            status: InstStatus::Running,
            context,
            execute_path: Vec::new(),
            sched_node_insts: Vec::new(),
            cur_node_inst: None,
            parent_inst_id: new.parent_inst_id,
            parent_node_inst_id: new.parent_node_inst_id,
            operator: new.operator.clone(),
            reason: None,
            last_restart_node: None,
            last_restart_at: None,
            before_last_restart_max_node_inst_id: 0,
            timeout_at: new.timeout_at,
            created_at: now,
            updated_at: now,
            ended_at: None,
        };
        self.insts.insert(inst_id, inst.clone());
        Ok(inst)
    }

    async fn get_instance(&self, inst_id: i64) -> Result<Option<WorkflowInst>, RepositoryError> {
        Ok(self.insts.get(&inst_id).map(|i| i.clone()))
    }

    async fn save_instance(&self, inst: &WorkflowInst) -> Result<bool, RepositoryError> {
        let Some(mut stored) = self.insts.get_mut(&inst.inst_id) else {
            return Ok(false);
        };
        if stored.def_id != inst.def_id {
            return Ok(false);
        }
        stored.context = inst.context.clone();
        stored.execute_path = inst.execute_path.clone();
        stored.sched_node_insts = inst.sched_node_insts.clone();
        stored.cur_node_inst = inst.cur_node_inst;
        stored.operator = inst.operator.clone();
        stored.reason = inst.reason.clone();
        stored.last_restart_node = inst.last_restart_node.clone();
        stored.last_restart_at = inst.last_restart_at;
        stored.before_last_restart_max_node_inst_id = inst.before_last_restart_max_node_inst_id;
        stored.timeout_at = inst.timeout_at;
        stored.updated_at = Utc::now();
        Ok(true)
    }

    async fn transition_instance(
        &self,
        inst_id: i64,
        def_id: i64,
        from: &[InstStatus],
        to: InstStatus,
        change: &InstTransition,
    ) -> Result<bool, RepositoryError> {
        let Some(mut stored) = self.insts.get_mut(&inst_id) else {
            return Ok(false);
        };
        if stored.def_id != def_id || !from.contains(&stored.status) {
            return Ok(false);
        }
        stored.status = to;
        if let Some(operator) = &change.operator {
            stored.operator = operator.clone();
        }
        if let Some(reason) = &change.reason {
            stored.reason = Some(reason.clone());
        }
        stored.ended_at = change.ended_at;
        stored.updated_at = Utc::now();
        Ok(true)
    }

    async fn list_instances(
        &self,
        query: &InstQuery,
        page: PageRequest,
    ) -> Result<Page<WorkflowInst>, RepositoryError> {
        let mut all: Vec<WorkflowInst> = self
            .insts
            .iter()
            .filter(|i| query.def_id.is_none_or(|d| i.def_id == d))
            .filter(|i| query.status.is_none_or(|s| i.status == s))
            .map(|i| i.clone())
            .collect();
        all.sort_by(|a, b| b.inst_id.cmp(&a.inst_id));
        Ok(paginate(all, page))
    }

    async fn list_archivable_instances(
        &self,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<WorkflowInst>, RepositoryError> {
        let mut all: Vec<WorkflowInst> = self
            .insts
            .iter()
            .filter(|i| i.status.is_terminal() && i.ended_at.is_some_and(|t| t < before))
            .map(|i| i.clone())
            .collect();
        all.sort_by_key(|i| (i.ended_at, i.inst_id));
        all.truncate(limit as usize);
        Ok(all)
    }

    async fn list_expired_instances(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<WorkflowInst>, RepositoryError> {
        let mut all: Vec<WorkflowInst> = self
            .insts
            .iter()
            .filter(|i| !i.status.is_terminal() && i.timeout_at.is_some_and(|t| t <= now))
            .map(|i| i.clone())
            .collect();
        all.sort_by_key(|i| i.inst_id);
        all.truncate(limit as usize);
        Ok(all)
    }

    async fn delete_instances(&self, inst_ids: &[i64]) -> Result<u64, RepositoryError> {
        Ok(inst_ids
            .iter()
            .filter(|id| self.insts.remove(id).is_some())
            .count() as u64)
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

impl NodeRepository for MemoryWorkflowStore {
    async fn create_node_inst(&self, new: &NewNodeInst) -> Result<NodeInst, RepositoryError> {
        let node_inst_id = self.next_node_id.fetch_add(1, Ordering::SeqCst);
        let completed_at = new.status.is_terminal().then_some(new.scheduled_at);
        let node = NodeInst {
            node_inst_id,
            def_id: new.def_id,
            inst_id: new.inst_id,
            ref_name: new.ref_name.clone(),
            node_type: new.node_type,
            status: new.status,
            input: None,
            output: None,
            poll_input: None,
            poll_output: None,
            error: new.error.clone(),
            nexts: new.nexts.clone(),
            parents: new.parents.clone(),
            scheduled_at: new.scheduled_at,
            completed_at,
            timeout_at: new.timeout_at,
            near_timeout_at: new.near_timeout_at,
            near_timeout_alerted: false,
            next_poll_at: None,
            updated_at: Utc::now(),
        };
        self.nodes.insert(node_inst_id, node.clone());
        Ok(node)
    }

    async fn get_node_inst(&self, node_inst_id: i64) -> Result<Option<NodeInst>, RepositoryError> {
        Ok(self.nodes.get(&node_inst_id).map(|n| n.clone()))
    }

    async fn list_node_insts(&self, inst_id: i64) -> Result<Vec<NodeInst>, RepositoryError> {
        let mut all: Vec<NodeInst> = self
            .nodes
            .iter()
            .filter(|n| n.inst_id == inst_id)
            .map(|n| n.clone())
            .collect();
        all.sort_by_key(|n| n.node_inst_id);
        Ok(all)
    }

    async fn max_node_inst_id(&self, inst_id: i64) -> Result<i64, RepositoryError> {
        Ok(self
            .nodes
            .iter()
            .filter(|n| n.inst_id == inst_id)
            .map(|n| n.node_inst_id)
            .max()
            .unwrap_or(0))
    }

    async fn transition_node(
        &self,
        node_inst_id: i64,
        inst_id: i64,
        from: &[NodeStatus],
        to: NodeStatus,
        update: &NodeUpdate,
    ) -> Result<bool, RepositoryError> {
        let Some(mut node) = self.nodes.get_mut(&node_inst_id) else {
            return Ok(false);
        };
        if node.inst_id != inst_id || !from.contains(&node.status) {
            return Ok(false);
        }
        node.status = to;
        if let Some(v) = &update.input {
            node.input = Some(v.clone());
        }
        if let Some(v) = &update.output {
            node.output = Some(v.clone());
        }
        if let Some(v) = &update.poll_input {
            node.poll_input = Some(v.clone());
        }
        if let Some(v) = &update.poll_output {
            node.poll_output = Some(v.clone());
        }
        if let Some(e) = &update.error {
            node.error = Some(e.clone());
        }
        if let Some(t) = update.completed_at {
            node.completed_at = Some(t);
        }
        if let Some(t) = update.next_poll_at {
            node.next_poll_at = Some(t);
        }
        node.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_node_timeout(
        &self,
        node_inst_id: i64,
        inst_id: i64,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let Some(mut node) = self.nodes.get_mut(&node_inst_id) else {
            return Ok(false);
        };
        if node.inst_id != inst_id || node.status.is_terminal() {
            return Ok(false);
        }
        node.timeout_at = Some(at);
        node.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_node_near_timeout(
        &self,
        node_inst_id: i64,
        inst_id: i64,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let Some(mut node) = self.nodes.get_mut(&node_inst_id) else {
            return Ok(false);
        };
        if node.inst_id != inst_id || node.status.is_terminal() {
            return Ok(false);
        }
        node.near_timeout_at = Some(at);
        node.near_timeout_alerted = false;
        node.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_near_timeout_alerted(
        &self,
        node_inst_id: i64,
        inst_id: i64,
    ) -> Result<bool, RepositoryError> {
        let Some(mut node) = self.nodes.get_mut(&node_inst_id) else {
            return Ok(false);
        };
        if node.inst_id != inst_id || node.near_timeout_alerted {
            return Ok(false);
        }
        node.near_timeout_alerted = true;
        Ok(true)
    }

    async fn list_pollable_nodes(
        &self,
        due: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<NodeInst>, RepositoryError> {
        let mut all: Vec<NodeInst> = self
            .nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Waiting && n.next_poll_at.is_some_and(|t| t <= due))
            .map(|n| n.clone())
            .collect();
        all.sort_by_key(|n| (n.next_poll_at, n.node_inst_id));
        all.truncate(limit as usize);
        Ok(all)
    }

    async fn set_next_poll(
        &self,
        node_inst_id: i64,
        inst_id: i64,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let Some(mut node) = self.nodes.get_mut(&node_inst_id) else {
            return Ok(false);
        };
        if node.inst_id != inst_id || node.status != NodeStatus::Waiting {
            return Ok(false);
        }
        node.next_poll_at = Some(at);
        Ok(true)
    }

    async fn list_deadline_nodes(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<NodeInst>, RepositoryError> {
        let mut all: Vec<NodeInst> = self
            .nodes
            .iter()
            .filter(|n| !n.status.is_terminal())
            .filter(|n| {
                n.timeout_at.is_some_and(|t| t <= now)
                    || (!n.near_timeout_alerted && n.near_timeout_at.is_some_and(|t| t <= now))
            })
            .map(|n| n.clone())
            .collect();
        all.sort_by_key(|n| n.node_inst_id);
        all.truncate(limit as usize);
        Ok(all)
    }

    async fn delete_node_insts(&self, inst_ids: &[i64]) -> Result<u64, RepositoryError> {
        let before = self.nodes.len();
        self.nodes.retain(|_, n| !inst_ids.contains(&n.inst_id));
        Ok((before - self.nodes.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

impl TriggerRepository for MemoryWorkflowStore {
    async fn upsert_trigger(&self, new: &NewTrigger) -> Result<Trigger, RepositoryError> {
        let _guard = self
            .trigger_upsert
            .lock()
            .map_err(|_| RepositoryError::Query("trigger upsert lock poisoned".to_string()))?;
        let now = Utc::now();

        let existing = self
            .triggers
            .iter()
            .find(|t| t.scope() == new.scope && t.kind == new.kind && t.target == new.target)
            .map(|t| t.trigger_id);

        if let Some(trigger_id) = existing {
            let mut t = self.triggers.get_mut(&trigger_id).ok_or(RepositoryError::NotFound)?;
            t.when = new.when.clone();
            t.payload = new.payload.clone();
            t.status = TriggerStatus::Active;
            t.updated_at = now;
            return Ok(t.clone());
        }

        let trigger_id = self.next_trigger_id.fetch_add(1, Ordering::SeqCst);
        let trigger = Trigger {
            trigger_id,
            level: new.scope.level,
            kind: new.kind,
            target: new.target.clone(),
            when: new.when.clone(),
            payload: new.payload.clone(),
            status: TriggerStatus::Active,
            def_id: new.scope.def_id,
            def_version: new.scope.def_version,
            inst_id: new.scope.inst_id,
            ref_name: new.scope.ref_name.clone(),
            last_fired_at: None,
            created_at: now,
            updated_at: now,
        };
        self.triggers.insert(trigger_id, trigger.clone());
        Ok(trigger)
    }

    async fn deactivate_triggers(&self, scope: &TriggerScope) -> Result<u64, RepositoryError> {
        let mut count = 0;
        for mut t in self.triggers.iter_mut() {
            if t.status == TriggerStatus::Active && scope.contains(&t.scope()) {
                t.status = TriggerStatus::Inactive;
                t.updated_at = Utc::now();
                count += 1;
            }
        }
        Ok(count)
    }

    async fn get_trigger(&self, trigger_id: i64) -> Result<Option<Trigger>, RepositoryError> {
        Ok(self.triggers.get(&trigger_id).map(|t| t.clone()))
    }

    async fn list_active_triggers(
        &self,
        kind: Option<TriggerKind>,
        target: Option<&str>,
    ) -> Result<Vec<Trigger>, RepositoryError> {
        let mut all: Vec<Trigger> = self
            .triggers
            .iter()
            .filter(|t| t.status == TriggerStatus::Active)
            .filter(|t| kind.is_none_or(|k| t.kind == k))
            .filter(|t| target.is_none_or(|n| t.target == n))
            .map(|t| t.clone())
            .collect();
        all.sort_by_key(|t| t.trigger_id);
        Ok(all)
    }

    async fn list_triggers(&self, scope: &TriggerScope) -> Result<Vec<Trigger>, RepositoryError> {
        let mut all: Vec<Trigger> = self
            .triggers
            .iter()
            .filter(|t| scope.contains(&t.scope()))
            .map(|t| t.clone())
            .collect();
        all.sort_by_key(|t| t.trigger_id);
        Ok(all)
    }

    async fn record_trigger_fire(
        &self,
        trigger_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        if let Some(mut t) = self.triggers.get_mut(&trigger_id) {
            t.last_fired_at = Some(at);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

impl HistoryRepository for MemoryWorkflowStore {
    async fn insert_instance_history(&self, insts: &[WorkflowInst]) -> Result<u64, RepositoryError> {
        let mut inserted = 0;
        for inst in insts {
            if let Entry::Vacant(slot) = self.inst_history.entry(inst.inst_id) {
                slot.insert(inst.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn insert_node_history(&self, nodes: &[NodeInst]) -> Result<u64, RepositoryError> {
        let mut inserted = 0;
        for node in nodes {
            if let Entry::Vacant(slot) = self.node_history.entry(node.node_inst_id) {
                slot.insert(node.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn get_history_instance(&self, inst_id: i64) -> Result<Option<WorkflowInst>, RepositoryError> {
        Ok(self.inst_history.get(&inst_id).map(|i| i.clone()))
    }

    async fn list_history_nodes(&self, inst_id: i64) -> Result<Vec<NodeInst>, RepositoryError> {
        let mut all: Vec<NodeInst> = self
            .node_history
            .iter()
            .filter(|n| n.inst_id == inst_id)
            .map(|n| n.clone())
            .collect();
        all.sort_by_key(|n| n.node_inst_id);
        Ok(all)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
