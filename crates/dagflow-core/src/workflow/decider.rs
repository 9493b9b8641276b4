//! The decider: a pure function from (DAG, node outcomes, context) to the
//! next wavefront and, when the instance is done, its terminal status.
//!
//! Eligibility rules:
//! - a node with a live (reconciled) instance is never eligible again
//! - a node is eligible when every parent's latest instance is satisfied:
//!   `Completed`, `Skipped`, `Cancelled` on a non-blocking parent, or
//!   `Failed` on a skippable parent
//! - a false condition on any incoming edge resolves the node to `Skipped`
//!
//! Output ordering is by declared index, then ref name, so the same inputs
//! always produce the same wavefront.

use std::collections::HashMap;

use dagflow_types::definition::{NodeDef, WorkflowDef};
use dagflow_types::error::EngineError;
use dagflow_types::instance::{InstStatus, SchedNodeInst};
use dagflow_types::node::NodeStatus;
use serde_json::{Map, Value, json};

use super::expression::ConditionEvaluator;

/// One node of the next wavefront.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyNode {
    pub ref_name: String,
    pub index: u32,
    /// Resolve straight to `Skipped` (an incoming condition was false).
    pub skip: bool,
}

/// Terminal verdict for the instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub status: InstStatus,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decision {
    pub wavefront: Vec<ReadyNode>,
    pub verdict: Option<Verdict>,
}

fn is_satisfied(node: &NodeDef, status: NodeStatus) -> bool {
    match status {
        NodeStatus::Completed | NodeStatus::Skipped => true,
        NodeStatus::Cancelled => !node.blocking,
        NodeStatus::Failed => node.skippable,
        _ => false,
    }
}

/// Compute the next wavefront for an instance.
///
/// `sched` is the reconciled set of node instances (latest per ref). Edges
/// to unknown nodes and conditions that fail to evaluate are definition
/// errors (`InvalidArgument`).
pub fn decide(
    def: &WorkflowDef,
    sched: &[SchedNodeInst],
    context: &Value,
    evaluator: &dyn ConditionEvaluator,
) -> Result<Decision, EngineError> {
    for (ref_name, node) in &def.nodes {
        if let Some(edge) = node.nexts.iter().find(|e| !def.nodes.contains_key(&e.ref_name)) {
            return Err(EngineError::invalid(format!(
                "node '{ref_name}' points to unknown node '{}'",
                edge.ref_name
            )));
        }
    }

    let mut latest: HashMap<&str, &SchedNodeInst> = HashMap::new();
    for s in sched {
        let slot = latest.entry(s.ref_name.as_str()).or_insert(s);
        if s.node_inst_id > slot.node_inst_id {
            *slot = s;
        }
    }

    let ordered = def.ordered_nodes();

    // Failures win over further progress.
    for (ref_name, node) in &ordered {
        let Some(s) = latest.get(ref_name) else { continue };
        let verdict = match s.status {
            NodeStatus::Failed if !node.skippable => Some(Verdict {
                status: InstStatus::Failed,
                reason: format!("node '{ref_name}' failed"),
            }),
            NodeStatus::Timeout => Some(Verdict {
                status: InstStatus::Failed,
                reason: format!("node '{ref_name}' timed out"),
            }),
            NodeStatus::Cancelled if node.blocking => Some(Verdict {
                status: InstStatus::Cancelled,
                reason: format!("blocking node '{ref_name}' was cancelled"),
            }),
            _ => None,
        };
        if verdict.is_some() {
            return Ok(Decision {
                wavefront: Vec::new(),
                verdict,
            });
        }
    }

    let satisfied = |ref_name: &str| -> bool {
        match (latest.get(ref_name), def.nodes.get(ref_name)) {
            (Some(s), Some(node)) => is_satisfied(node, s.status),
            _ => false,
        }
    };

    let mut condition_ctx: Option<Value> = None;
    let mut wavefront = Vec::new();
    for (ref_name, node) in &ordered {
        if latest.contains_key(ref_name) {
            continue;
        }
        let parents = def.parents_of(ref_name);
        if !parents.iter().all(|p| satisfied(*p)) {
            continue;
        }

        let mut skip = false;
        for parent in &parents {
            let conditions = def.nodes[*parent]
                .nexts
                .iter()
                .filter(|e| e.ref_name == *ref_name)
                .filter_map(|e| e.condition.as_deref());
            for condition in conditions {
                let ctx = condition_ctx.get_or_insert_with(|| condition_context(context, &latest));
                let passed = evaluator.evaluate(condition, ctx).map_err(|e| {
                    EngineError::invalid(format!(
                        "condition on edge '{parent}' -> '{ref_name}': {e}"
                    ))
                })?;
                if !passed {
                    skip = true;
                }
            }
        }

        wavefront.push(ReadyNode {
            ref_name: ref_name.to_string(),
            index: node.index,
            skip,
        });
    }

    if !wavefront.is_empty() {
        return Ok(Decision {
            wavefront,
            verdict: None,
        });
    }

    let any_live = latest.values().any(|s| !s.status.is_terminal());
    let sinks_done = ordered
        .iter()
        .filter(|(_, n)| n.nexts.is_empty())
        .all(|(r, _)| satisfied(*r));

    let verdict = (!any_live && sinks_done).then(|| Verdict {
        status: InstStatus::Succeed,
        reason: "all nodes finished".to_string(),
    });
    Ok(Decision { wavefront, verdict })
}

/// The object conditions are evaluated against:
/// `{ "context": <instance context>, "nodes": { "<ref>": "<status>" } }`.
fn condition_context(context: &Value, latest: &HashMap<&str, &SchedNodeInst>) -> Value {
    let nodes: Map<String, Value> = latest
        .iter()
        .map(|(r, s)| (r.to_string(), json!(s.status.as_str())))
        .collect();
    json!({ "context": context, "nodes": nodes })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::expression::{ExpressionError, WorkflowEvaluator};
    use chrono::Utc;
    use dagflow_types::definition::{DefStatus, NodeType};
    use std::collections::BTreeMap;

    fn def_of(nodes: Vec<(&str, NodeDef)>) -> WorkflowDef {
        let now = Utc::now();
        WorkflowDef {
            def_id: 1,
            version: 1,
            name: "t".into(),
            creator: "ops".into(),
            description: String::new(),
            nodes: nodes
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect::<BTreeMap<_, _>>(),
            status: DefStatus::Enabled,
            parent_def_id: None,
            ref_name: None,
            timeout_secs: None,
            triggers: vec![],
            inst_triggers: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    /// a -> {b, c} -> d
    fn diamond() -> WorkflowDef {
        def_of(vec![
            ("a", NodeDef::new(NodeType::Noop, 0).with_next("b").with_next("c")),
            ("c", NodeDef::new(NodeType::Noop, 1).with_next("d")),
            ("b", NodeDef::new(NodeType::Noop, 2).with_next("d")),
            ("d", NodeDef::new(NodeType::Noop, 3)),
        ])
    }

    fn refs(d: &Decision) -> Vec<&str> {
        d.wavefront.iter().map(|n| n.ref_name.as_str()).collect()
    }

    fn eval() -> WorkflowEvaluator {
        WorkflowEvaluator::new()
    }

    #[test]
    fn test_roots_eligible_at_start() {
        let d = decide(&diamond(), &[], &json!({}), &eval()).unwrap();
        assert_eq!(refs(&d), vec!["a"]);
        assert!(d.verdict.is_none());
    }

    #[test]
    fn test_wavefront_ordered_by_index() {
        let sched = vec![SchedNodeInst::new(1, "a", NodeStatus::Completed)];
        let d = decide(&diamond(), &sched, &json!({}), &eval()).unwrap();
        // c has index 1, b index 2.
        assert_eq!(refs(&d), vec!["c", "b"]);
    }

    #[test]
    fn test_join_waits_for_all_parents() {
        let sched = vec![
            SchedNodeInst::new(1, "a", NodeStatus::Completed),
            SchedNodeInst::new(2, "c", NodeStatus::Completed),
            SchedNodeInst::new(3, "b", NodeStatus::Waiting),
        ];
        let d = decide(&diamond(), &sched, &json!({}), &eval()).unwrap();
        assert!(d.wavefront.is_empty());
        assert!(d.verdict.is_none());
    }

    #[test]
    fn test_decision_is_deterministic() {
        let sched = vec![
            SchedNodeInst::new(1, "a", NodeStatus::Completed),
            SchedNodeInst::new(2, "c", NodeStatus::Skipped),
        ];
        let first = decide(&diamond(), &sched, &json!({}), &eval()).unwrap();
        for _ in 0..10 {
            assert_eq!(decide(&diamond(), &sched, &json!({}), &eval()).unwrap(), first);
        }
    }

    #[test]
    fn test_all_sinks_satisfied_succeeds() {
        let sched = vec![
            SchedNodeInst::new(4, "d", NodeStatus::Completed),
            SchedNodeInst::new(3, "b", NodeStatus::Completed),
            SchedNodeInst::new(2, "c", NodeStatus::Skipped),
            SchedNodeInst::new(1, "a", NodeStatus::Completed),
        ];
        let d = decide(&diamond(), &sched, &json!({}), &eval()).unwrap();
        assert_eq!(d.verdict.unwrap().status, InstStatus::Succeed);
    }

    #[test]
    fn test_failed_node_fails_instance() {
        let sched = vec![
            SchedNodeInst::new(1, "a", NodeStatus::Completed),
            SchedNodeInst::new(2, "c", NodeStatus::Failed),
            SchedNodeInst::new(3, "b", NodeStatus::Running),
        ];
        let d = decide(&diamond(), &sched, &json!({}), &eval()).unwrap();
        let verdict = d.verdict.unwrap();
        assert_eq!(verdict.status, InstStatus::Failed);
        assert!(verdict.reason.contains("'c'"));
    }

    #[test]
    fn test_timeout_node_fails_instance() {
        let sched = vec![SchedNodeInst::new(1, "a", NodeStatus::Timeout)];
        let d = decide(&diamond(), &sched, &json!({}), &eval()).unwrap();
        assert_eq!(d.verdict.unwrap().status, InstStatus::Failed);
    }

    #[test]
    fn test_cancelled_node_blocking_semantics() {
        let mut blocking = NodeDef::new(NodeType::Wait, 0).with_next("z");
        blocking.blocking = true;
        let def = def_of(vec![("w", blocking), ("z", NodeDef::new(NodeType::Noop, 1))]);
        let sched = vec![SchedNodeInst::new(1, "w", NodeStatus::Cancelled)];
        let d = decide(&def, &sched, &json!({}), &eval()).unwrap();
        assert_eq!(d.verdict.unwrap().status, InstStatus::Cancelled);

        let def = def_of(vec![
            ("w", NodeDef::new(NodeType::Wait, 0).with_next("z")),
            ("z", NodeDef::new(NodeType::Noop, 1)),
        ]);
        let d = decide(&def, &sched, &json!({}), &eval()).unwrap();
        assert_eq!(refs(&d), vec!["z"]);
    }

    #[test]
    fn test_skippable_failure_satisfies_children() {
        let mut flaky = NodeDef::new(NodeType::Http, 0).with_next("z");
        flaky.skippable = true;
        let def = def_of(vec![("h", flaky), ("z", NodeDef::new(NodeType::Noop, 1))]);
        let sched = vec![SchedNodeInst::new(1, "h", NodeStatus::Failed)];
        let d = decide(&def, &sched, &json!({}), &eval()).unwrap();
        assert_eq!(refs(&d), vec!["z"]);
    }

    #[test]
    fn test_false_condition_resolves_to_skip() {
        let def = def_of(vec![
            (
                "a",
                NodeDef::new(NodeType::Noop, 0)
                    .with_conditional_next("big", "context.amount > 100")
                    .with_conditional_next("small", "context.amount <= 100"),
            ),
            ("big", NodeDef::new(NodeType::Noop, 1)),
            ("small", NodeDef::new(NodeType::Noop, 2)),
        ]);
        let sched = vec![SchedNodeInst::new(1, "a", NodeStatus::Completed)];
        let d = decide(&def, &sched, &json!({"amount": 7}), &eval()).unwrap();
        assert_eq!(
            d.wavefront,
            vec![
                ReadyNode { ref_name: "big".into(), index: 1, skip: true },
                ReadyNode { ref_name: "small".into(), index: 2, skip: false },
            ]
        );
    }

    #[test]
    fn test_condition_can_read_node_statuses() {
        let def = def_of(vec![
            ("a", NodeDef::new(NodeType::Noop, 0).with_conditional_next("b", "nodes.a == 'completed'")),
            ("b", NodeDef::new(NodeType::Noop, 1)),
        ]);
        let sched = vec![SchedNodeInst::new(1, "a", NodeStatus::Completed)];
        let d = decide(&def, &sched, &json!({}), &eval()).unwrap();
        assert!(!d.wavefront[0].skip);
    }

    struct Broken;

    impl ConditionEvaluator for Broken {
        fn evaluate(&self, _: &str, _: &Value) -> Result<bool, ExpressionError> {
            Err(ExpressionError::EvalFailed("boom".into()))
        }
    }

    #[test]
    fn test_unevaluable_condition_is_invalid_argument() {
        let def = def_of(vec![
            ("a", NodeDef::new(NodeType::Noop, 0).with_conditional_next("b", "???")),
            ("b", NodeDef::new(NodeType::Noop, 1)),
        ]);
        let sched = vec![SchedNodeInst::new(1, "a", NodeStatus::Completed)];
        let err = decide(&def, &sched, &json!({}), &Broken).unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[test]
    fn test_unknown_edge_is_invalid_argument() {
        let def = def_of(vec![("a", NodeDef::new(NodeType::Noop, 0).with_next("ghost"))]);
        let err = decide(&def, &[], &json!({}), &eval()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }
}
