//! Instance bookkeeping: restart reconciliation, context merging, and the
//! projection of persisted node rows onto `sched_node_insts`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dagflow_types::error::EngineError;
use dagflow_types::instance::{RestartMark, SchedNodeInst, WorkflowInst};
use dagflow_types::node::{NodeInst, NodeStatus};
use serde_json::Value;
use tracing::debug;

use crate::repository::WorkflowStore;

// ---------------------------------------------------------------------------
// Restart reconciliation
// ---------------------------------------------------------------------------

/// Decide which node instances remain valid under the current restart mark.
///
/// Without a mark (or when the restart target never ran) the latest
/// instance of every ref is kept. Otherwise, with `R_oldest` the first
/// instance of the restart target:
/// - refs first run before `R_oldest` keep their latest instance
/// - every other ref keeps its latest instance only when it was created
///   after the restart boundary
///
/// Only the first recorded path is consulted; see DESIGN.md.
///
/// Returns the kept instances sorted by `node_inst_id` descending.
pub fn reconcile_sched_nodes(
    nodes: &[SchedNodeInst],
    mark: Option<&RestartMark>,
) -> Vec<SchedNodeInst> {
    let mut latest: HashMap<&str, &SchedNodeInst> = HashMap::new();
    let mut oldest: HashMap<&str, i64> = HashMap::new();
    for n in nodes {
        let slot = latest.entry(n.ref_name.as_str()).or_insert(n);
        if n.node_inst_id > slot.node_inst_id {
            *slot = n;
        }
        let first = oldest.entry(n.ref_name.as_str()).or_insert(n.node_inst_id);
        *first = (*first).min(n.node_inst_id);
    }

    let restart = mark.and_then(|m| oldest.get(m.ref_name.as_str()).map(|r| (*r, m.boundary)));

    let mut kept: Vec<SchedNodeInst> = latest
        .into_iter()
        .filter(|(ref_name, inst)| match restart {
            None => true,
            Some((restart_oldest, boundary)) => {
                oldest[ref_name] < restart_oldest || inst.node_inst_id > boundary
            }
        })
        .map(|(_, inst)| inst.clone())
        .collect();
    kept.sort_by(|a, b| b.node_inst_id.cmp(&a.node_inst_id));
    kept
}

/// Record a restart from `ref_name`. `boundary` is the highest node
/// instance id existing at restart time.
pub fn mark_restart(inst: &mut WorkflowInst, ref_name: &str, boundary: i64, at: DateTime<Utc>) {
    inst.last_restart_node = Some(ref_name.to_string());
    inst.last_restart_at = Some(at);
    inst.before_last_restart_max_node_inst_id = boundary;
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Deep-merge `patch` into `target` following JSON merge-patch rules:
/// objects merge recursively, `null` removes a key, anything else replaces.
pub fn merge_context(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_context(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Copy the outputs of kept `Completed` nodes into `context[ref_name]`.
/// A ref whose kept run has no output (or that reconciliation dropped)
/// loses any output left by a superseded run.
fn project_outputs(context: &mut Value, kept: &[SchedNodeInst], rows: &[NodeInst]) {
    if !context.is_object() {
        *context = Value::Object(Default::default());
    }
    let Value::Object(map) = context else { return };
    let node_refs: HashSet<&str> = rows.iter().map(|n| n.ref_name.as_str()).collect();
    for ref_name in node_refs {
        map.remove(ref_name);
    }
    let by_id: HashMap<i64, &NodeInst> = rows.iter().map(|n| (n.node_inst_id, n)).collect();
    // Oldest first so the latest output of a ref wins.
    for s in kept.iter().rev() {
        if s.status != NodeStatus::Completed {
            continue;
        }
        if let Some(output) = by_id.get(&s.node_inst_id).and_then(|n| n.output.as_ref()) {
            map.insert(s.ref_name.clone(), output.clone());
        }
    }
}

/// Append one decider wavefront to the instance's execute path.
pub fn record_wavefront(inst: &mut WorkflowInst, refs: Vec<String>) {
    if !refs.is_empty() {
        inst.execute_path.push(refs);
    }
}

// ---------------------------------------------------------------------------
// WorkflowUpdater
// ---------------------------------------------------------------------------

/// Applies persisted node state and caller patches to instances.
pub struct WorkflowUpdater<S: WorkflowStore> {
    store: Arc<S>,
}

impl<S: WorkflowStore> WorkflowUpdater<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Recompute `sched_node_insts` from the persisted node rows, project
    /// completed outputs into the context, and return every row.
    pub async fn refresh(&self, inst: &mut WorkflowInst) -> Result<Vec<NodeInst>, EngineError> {
        let rows = self.store.list_node_insts(inst.inst_id).await?;
        let all: Vec<SchedNodeInst> = rows
            .iter()
            .map(|n| SchedNodeInst::new(n.node_inst_id, &n.ref_name, n.status))
            .collect();
        let kept = reconcile_sched_nodes(&all, inst.restart_mark().as_ref());
        project_outputs(&mut inst.context, &kept, &rows);
        inst.cur_node_inst = kept
            .iter()
            .find(|s| !s.status.is_terminal())
            .map(|s| s.node_inst_id);
        inst.sched_node_insts = kept;
        debug!(
            inst_id = inst.inst_id,
            rows = rows.len(),
            kept = inst.sched_node_insts.len(),
            "refreshed scheduled nodes"
        );
        Ok(rows)
    }

    /// Merge `patch` into the stored context of a live instance.
    pub async fn update_context(&self, inst_id: i64, patch: &Value) -> Result<WorkflowInst, EngineError> {
        let mut inst = self
            .store
            .get_instance(inst_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("instance {inst_id}")))?;
        merge_context(&mut inst.context, patch);
        if !self.store.save_instance(&inst).await? {
            return Err(EngineError::not_found(format!("instance {inst_id}")));
        }
        Ok(inst)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn s(id: i64, r: &str) -> SchedNodeInst {
        SchedNodeInst::new(id, r, NodeStatus::Completed)
    }

    fn ids(kept: &[SchedNodeInst]) -> Vec<(&str, i64)> {
        kept.iter().map(|n| (n.ref_name.as_str(), n.node_inst_id)).collect()
    }

    fn mark(r: &str, boundary: i64) -> RestartMark {
        RestartMark {
            ref_name: r.to_string(),
            boundary,
        }
    }

    // -- Reconciliation fixtures --

    #[test]
    fn test_no_restart_keeps_latest_per_ref() {
        let nodes = vec![s(1, "t1"), s(3, "t2"), s(2, "t3"), s(4, "t2")];
        let kept = reconcile_sched_nodes(&nodes, None);
        assert_eq!(ids(&kept), vec![("t2", 4), ("t3", 2), ("t1", 1)]);
    }

    #[test]
    fn test_unseen_restart_target_changes_nothing() {
        let nodes = vec![s(1, "t1"), s(3, "t2"), s(2, "t3"), s(4, "t2")];
        let kept = reconcile_sched_nodes(&nodes, Some(&mark("t4", 3)));
        assert_eq!(ids(&kept), vec![("t2", 4), ("t3", 2), ("t1", 1)]);
    }

    #[test]
    fn test_restart_from_t3_keeps_only_pre_path() {
        let nodes = vec![s(1, "t1"), s(3, "t2"), s(2, "t3"), s(4, "t2")];
        let kept = reconcile_sched_nodes(&nodes, Some(&mark("t3", 4)));
        assert_eq!(ids(&kept), vec![("t1", 1)]);
    }

    #[test]
    fn test_restart_from_t2_keeps_post_boundary_runs() {
        let nodes = vec![s(1, "t1"), s(2, "t2"), s(3, "t3"), s(4, "t2"), s(5, "t4")];
        let kept = reconcile_sched_nodes(&nodes, Some(&mark("t2", 3)));
        assert_eq!(ids(&kept), vec![("t4", 5), ("t2", 4), ("t1", 1)]);
    }

    #[test]
    fn test_reconcile_is_order_independent() {
        let mut nodes = vec![s(5, "t4"), s(2, "t2"), s(4, "t2"), s(1, "t1"), s(3, "t3")];
        let a = reconcile_sched_nodes(&nodes, Some(&mark("t2", 3)));
        nodes.reverse();
        let b = reconcile_sched_nodes(&nodes, Some(&mark("t2", 3)));
        assert_eq!(a, b);
    }

    // -- Context --

    #[test]
    fn test_merge_context_deep() {
        let mut ctx = json!({"order": {"id": 1, "items": 2}, "keep": true, "drop": 1});
        merge_context(
            &mut ctx,
            &json!({"order": {"items": 3, "paid": true}, "drop": null, "new": "x"}),
        );
        assert_eq!(
            ctx,
            json!({"order": {"id": 1, "items": 3, "paid": true}, "keep": true, "new": "x"})
        );
    }

    #[test]
    fn test_merge_into_non_object_target() {
        let mut ctx = Value::Null;
        merge_context(&mut ctx, &json!({"a": 1}));
        assert_eq!(ctx, json!({"a": 1}));
    }

    #[test]
    fn test_mark_restart_and_wavefront() {
        let now = Utc::now();
        let mut inst = WorkflowInst {
            inst_id: 1,
            def_id: 1,
            version: 1,
            status: dagflow_types::instance::InstStatus::Running,
            context: json!({}),
            execute_path: vec![],
            sched_node_insts: vec![],
            cur_node_inst: None,
            parent_inst_id: None,
            parent_node_inst_id: None,
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
        mark_restart(&mut inst, "t2", 9, now);
        assert_eq!(inst.restart_mark(), Some(mark("t2", 9)));

        record_wavefront(&mut inst, vec![]);
        record_wavefront(&mut inst, vec!["a".into(), "b".into()]);
        assert_eq!(inst.execute_path, vec![vec!["a".to_string(), "b".to_string()]]);
    }
}
