//! Definition DAG validation.
//!
//! Uses `petgraph` to model `nexts` edges as a directed graph. Topological
//! sort detects cycles; per-type parameter checks catch definitions that
//! could never run before they are stored.

use std::collections::{BTreeMap, HashMap, HashSet};

use dagflow_types::definition::{NodeDef, NodeType};
use dagflow_types::error::EngineError;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// A malformed definition. Always surfaced as `InvalidArgument`.
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("definition has no nodes")]
    Empty,

    #[error("invalid ref name '{0}'")]
    InvalidRefName(String),

    #[error("node '{from}' points to unknown node '{to}'")]
    UnknownNext { from: String, to: String },

    #[error("node '{from}' lists '{to}' more than once")]
    DuplicateEdge { from: String, to: String },

    #[error("cycle detected involving node '{0}'")]
    Cycle(String),

    #[error("node '{ref_name}': {message}")]
    InvalidParams { ref_name: String, message: String },
}

impl From<DefinitionError> for EngineError {
    fn from(e: DefinitionError) -> Self {
        EngineError::InvalidArgument(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate that `nodes` form a runnable DAG: known edge targets, no
/// duplicate edges, no cycles, and well-formed per-type parameters.
pub fn validate_nodes(nodes: &BTreeMap<String, NodeDef>) -> Result<(), DefinitionError> {
    if nodes.is_empty() {
        return Err(DefinitionError::Empty);
    }

    let mut graph = DiGraph::<&str, ()>::new();
    let indices: HashMap<&str, _> = nodes
        .keys()
        .map(|k| (k.as_str(), graph.add_node(k.as_str())))
        .collect();

    for (ref_name, node) in nodes {
        if !is_valid_ref_name(ref_name) {
            return Err(DefinitionError::InvalidRefName(ref_name.clone()));
        }
        validate_params(ref_name, node)?;

        let mut seen = HashSet::new();
        for edge in &node.nexts {
            let to = indices.get(edge.ref_name.as_str()).ok_or_else(|| {
                DefinitionError::UnknownNext {
                    from: ref_name.clone(),
                    to: edge.ref_name.clone(),
                }
            })?;
            if !seen.insert(edge.ref_name.as_str()) {
                return Err(DefinitionError::DuplicateEdge {
                    from: ref_name.clone(),
                    to: edge.ref_name.clone(),
                });
            }
            graph.add_edge(indices[ref_name.as_str()], *to, ());
        }
    }

    toposort(&graph, None)
        .map_err(|cycle| DefinitionError::Cycle(graph[cycle.node_id()].to_string()))?;
    Ok(())
}

fn is_valid_ref_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn validate_params(ref_name: &str, node: &NodeDef) -> Result<(), DefinitionError> {
    let invalid = |message: &str| DefinitionError::InvalidParams {
        ref_name: ref_name.to_string(),
        message: message.to_string(),
    };

    if let (Some(near), Some(hard)) = (node.near_timeout_secs, node.timeout_secs) {
        if near >= hard {
            return Err(invalid("near_timeout_secs must be shorter than timeout_secs"));
        }
    }
    if node.poll_interval_secs == Some(0) {
        return Err(invalid("poll_interval_secs must be positive"));
    }

    match node.node_type {
        NodeType::Noop | NodeType::Wait => Ok(()),
        NodeType::Delay => node
            .params
            .get("secs")
            .and_then(|v| v.as_u64())
            .map(|_| ())
            .ok_or_else(|| invalid("delay node requires integer params.secs")),
        NodeType::SubWorkflow => node
            .params
            .get("def_id")
            .and_then(|v| v.as_i64())
            .map(|_| ())
            .ok_or_else(|| invalid("sub_workflow node requires integer params.def_id")),
        NodeType::Http => {
            let url = node.params.get("url").and_then(|v| v.as_str()).unwrap_or("");
            if url.starts_with("http://") || url.starts_with("https://") {
                Ok(())
            } else {
                Err(invalid("http node requires an http(s) params.url"))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dag(edges: &[(&str, &[&str])]) -> BTreeMap<String, NodeDef> {
        edges
            .iter()
            .enumerate()
            .map(|(i, (name, nexts))| {
                let mut node = NodeDef::new(NodeType::Noop, i as u32);
                for n in *nexts {
                    node = node.with_next(n);
                }
                (name.to_string(), node)
            })
            .collect()
    }

    #[test]
    fn test_diamond_is_valid() {
        let nodes = dag(&[("a", &["b", "c"]), ("b", &["d"]), ("c", &["d"]), ("d", &[])]);
        assert!(validate_nodes(&nodes).is_ok());
    }

    #[test]
    fn test_empty_definition_rejected() {
        assert!(matches!(validate_nodes(&BTreeMap::new()), Err(DefinitionError::Empty)));
    }

    #[test]
    fn test_cycle_detected() {
        let nodes = dag(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"])]);
        let err = validate_nodes(&nodes).unwrap_err();
        assert!(err.to_string().contains("cycle detected"), "got: {err}");
    }

    #[test]
    fn test_self_loop_detected() {
        let nodes = dag(&[("a", &["a"])]);
        assert!(matches!(validate_nodes(&nodes), Err(DefinitionError::Cycle(_))));
    }

    #[test]
    fn test_unknown_next_rejected() {
        let nodes = dag(&[("a", &["missing"])]);
        let err = validate_nodes(&nodes).unwrap_err();
        assert!(matches!(err, DefinitionError::UnknownNext { .. }));
        let engine: EngineError = err.into();
        assert!(matches!(engine, EngineError::InvalidArgument(_)));
    }

    #[test]
    fn test_duplicate_edge_rejected() {
        let nodes = dag(&[("a", &["b", "b"]), ("b", &[])]);
        assert!(matches!(
            validate_nodes(&nodes),
            Err(DefinitionError::DuplicateEdge { .. })
        ));
    }

    #[test]
    fn test_bad_ref_name_rejected() {
        let nodes = dag(&[("has space", &[])]);
        assert!(matches!(
            validate_nodes(&nodes),
            Err(DefinitionError::InvalidRefName(_))
        ));
    }

    // -- Parameters --

    #[test]
    fn test_delay_requires_secs() {
        let mut nodes = BTreeMap::new();
        nodes.insert("d".to_string(), NodeDef::new(NodeType::Delay, 0));
        assert!(validate_nodes(&nodes).is_err());

        nodes.insert(
            "d".to_string(),
            NodeDef::new(NodeType::Delay, 0).with_params(json!({"secs": 30})),
        );
        assert!(validate_nodes(&nodes).is_ok());
    }

    #[test]
    fn test_http_requires_url_and_sub_workflow_requires_def() {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "h".to_string(),
            NodeDef::new(NodeType::Http, 0).with_params(json!({"url": "ftp://x"})),
        );
        assert!(validate_nodes(&nodes).is_err());

        let mut nodes = BTreeMap::new();
        nodes.insert("s".to_string(), NodeDef::new(NodeType::SubWorkflow, 0));
        assert!(validate_nodes(&nodes).is_err());
    }

    #[test]
    fn test_near_timeout_must_precede_timeout() {
        let mut node = NodeDef::new(NodeType::Wait, 0);
        node.timeout_secs = Some(10);
        node.near_timeout_secs = Some(10);
        let mut nodes = BTreeMap::new();
        nodes.insert("w".to_string(), node);
        assert!(matches!(
            validate_nodes(&nodes),
            Err(DefinitionError::InvalidParams { .. })
        ));
    }
}
