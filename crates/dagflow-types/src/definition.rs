//! Workflow definition types.
//!
//! A `WorkflowDef` is one immutable version of a DAG template. Its persisted
//! form is a JSON document whose `nodes` field maps each ref name to a node
//! object carrying the node type, declared index, outgoing edges, and
//! type-specific parameters.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Definition
// ---------------------------------------------------------------------------

/// One stored version of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDef {
    pub def_id: i64,
    /// Monotonically increasing within one `def_id`.
    pub version: i32,
    pub name: String,
    pub creator: String,
    #[serde(default)]
    pub description: String,
    /// `refName -> NodeDef`.
    pub nodes: BTreeMap<String, NodeDef>,
    pub status: DefStatus,
    /// Set together with `ref_name` when this definition is a sub-workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_def_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_name: Option<String>,
    /// Instance deadline in seconds, measured from instance start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Definition-level triggers: each fire starts a new instance.
    #[serde(default)]
    pub triggers: Vec<TriggerDef>,
    /// Instance-level triggers, registered for every running instance.
    #[serde(default)]
    pub inst_triggers: Vec<TriggerDef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDef {
    /// Nodes sorted by declared index (ties broken by ref name).
    pub fn ordered_nodes(&self) -> Vec<(&str, &NodeDef)> {
        let mut nodes: Vec<(&str, &NodeDef)> =
            self.nodes.iter().map(|(k, v)| (k.as_str(), v)).collect();
        nodes.sort_by(|a, b| a.1.index.cmp(&b.1.index).then_with(|| a.0.cmp(b.0)));
        nodes
    }

    /// Ref names of the direct parents of `ref_name` (inverted `nexts`).
    pub fn parents_of(&self, ref_name: &str) -> Vec<&str> {
        let mut parents: Vec<(&str, u32)> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.nexts.iter().any(|e| e.ref_name == ref_name))
            .map(|(k, n)| (k.as_str(), n.index))
            .collect();
        parents.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        parents.into_iter().map(|(k, _)| k).collect()
    }
}

/// Input for storing a new definition version.
///
/// `def_id = None` allocates a fresh definition at version 1; `Some(id)`
/// appends the next version of an existing definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkflowDef {
    pub def_id: Option<i64>,
    pub name: String,
    pub creator: String,
    #[serde(default)]
    pub description: String,
    pub nodes: BTreeMap<String, NodeDef>,
    #[serde(default)]
    pub status: DefStatus,
    #[serde(default)]
    pub parent_def_id: Option<i64>,
    #[serde(default)]
    pub ref_name: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub triggers: Vec<TriggerDef>,
    #[serde(default)]
    pub inst_triggers: Vec<TriggerDef>,
}

/// Definition lifecycle state. Only `Enabled` definitions are instantiable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefStatus {
    Disabled,
    Enabled,
}

impl DefStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DefStatus::Disabled => "disabled",
            DefStatus::Enabled => "enabled",
        }
    }
}

impl Default for DefStatus {
    fn default() -> Self {
        DefStatus::Disabled
    }
}

impl fmt::Display for DefStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DefStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "disabled" => Ok(DefStatus::Disabled),
            "enabled" => Ok(DefStatus::Enabled),
            other => Err(format!("invalid definition status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// A single node of the workflow DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// Declared order; drives deterministic wavefront ordering.
    #[serde(default)]
    pub index: u32,
    /// Outgoing edges.
    #[serde(default)]
    pub nexts: Vec<NodeEdge>,
    /// Node-type-specific parameters.
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub near_timeout_secs: Option<u64>,
    /// A terminal failure resolves to `Skipped` instead of failing the instance.
    #[serde(default)]
    pub skippable: bool,
    /// A cancelled blocking node does not satisfy its children.
    #[serde(default)]
    pub blocking: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_secs: Option<u64>,
    /// Node-level triggers, active while an instance of this node is waiting.
    #[serde(default)]
    pub triggers: Vec<TriggerDef>,
}

impl NodeDef {
    pub fn new(node_type: NodeType, index: u32) -> Self {
        Self {
            node_type,
            index,
            nexts: Vec::new(),
            params: serde_json::Value::Null,
            timeout_secs: None,
            near_timeout_secs: None,
            skippable: false,
            blocking: false,
            poll_interval_secs: None,
            triggers: Vec::new(),
        }
    }

    pub fn with_next(mut self, ref_name: &str) -> Self {
        self.nexts.push(NodeEdge::new(ref_name));
        self
    }

    pub fn with_conditional_next(mut self, ref_name: &str, condition: &str) -> Self {
        self.nexts.push(NodeEdge {
            ref_name: ref_name.to_string(),
            condition: Some(condition.to_string()),
        });
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

/// An outgoing edge, optionally gated by a JEXL condition.
///
/// Accepts either a bare ref name (`"b"`) or an object
/// (`{"ref": "b", "condition": "context.ok"}`) in the persisted document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "EdgeRepr")]
pub struct NodeEdge {
    #[serde(rename = "ref")]
    pub ref_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl NodeEdge {
    pub fn new(ref_name: &str) -> Self {
        Self {
            ref_name: ref_name.to_string(),
            condition: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EdgeRepr {
    Bare(String),
    Full {
        #[serde(rename = "ref")]
        ref_name: String,
        #[serde(default)]
        condition: Option<String>,
    },
}

impl From<EdgeRepr> for NodeEdge {
    fn from(repr: EdgeRepr) -> Self {
        match repr {
            EdgeRepr::Bare(ref_name) => NodeEdge {
                ref_name,
                condition: None,
            },
            EdgeRepr::Full {
                ref_name,
                condition,
            } => NodeEdge {
                ref_name,
                condition,
            },
        }
    }
}

/// The kind of node. Dispatch goes through a `NodeType -> handler` table
/// built at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Synchronous pass-through; output equals params.
    Noop,
    /// Synchronous HTTP call.
    Http,
    /// Parks until completed externally.
    Wait,
    /// Parks until a timer elapses.
    Delay,
    /// Starts a child instance and parks until it ends.
    SubWorkflow,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Noop => "noop",
            NodeType::Http => "http",
            NodeType::Wait => "wait",
            NodeType::Delay => "delay",
            NodeType::SubWorkflow => "sub_workflow",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "noop" => Ok(NodeType::Noop),
            "http" => Ok(NodeType::Http),
            "wait" => Ok(NodeType::Wait),
            "delay" => Ok(NodeType::Delay),
            "sub_workflow" => Ok(NodeType::SubWorkflow),
            other => Err(format!("invalid node type: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Trigger declarations
// ---------------------------------------------------------------------------

/// A trigger declared on a definition, an instance template, or a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerDef {
    /// Fires on a cron schedule (standard 5/6-field or human-readable).
    Cron {
        expr: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
    /// Fires when an external event with this name arrives.
    Event {
        event: String,
        /// Optional JEXL filter evaluated against `{event, payload}`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        when: Option<String>,
        #[serde(default)]
        payload: serde_json::Value,
    },
}
