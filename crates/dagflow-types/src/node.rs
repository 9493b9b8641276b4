//! Node instance types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::definition::NodeType;

/// One execution record of a DAG node within an instance.
///
/// A ref name may own many rows over time; the row with the largest
/// `node_inst_id` is the current one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInst {
    pub node_inst_id: i64,
    pub def_id: i64,
    pub inst_id: i64,
    pub ref_name: String,
    pub node_type: NodeType,
    pub status: NodeStatus,
    #[serde(default)]
    pub input: Option<serde_json::Value>,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub poll_input: Option<serde_json::Value>,
    #[serde(default)]
    pub poll_output: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub nexts: Vec<String>,
    #[serde(default)]
    pub parents: Vec<String>,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timeout_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub near_timeout_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub near_timeout_alerted: bool,
    #[serde(default)]
    pub next_poll_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a node instance. The store assigns the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNodeInst {
    pub def_id: i64,
    pub inst_id: i64,
    pub ref_name: String,
    pub node_type: NodeType,
    pub status: NodeStatus,
    pub nexts: Vec<String>,
    pub parents: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default)]
    pub timeout_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub near_timeout_at: Option<DateTime<Utc>>,
}

/// Field changes applied together with a node status transition.
///
/// `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct NodeUpdate {
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub poll_input: Option<serde_json::Value>,
    pub poll_output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_poll_at: Option<DateTime<Utc>>,
}

impl NodeUpdate {
    pub fn completed(output: serde_json::Value, at: DateTime<Utc>) -> Self {
        Self {
            output: Some(output),
            completed_at: Some(at),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            error: Some(error.into()),
            completed_at: Some(at),
            ..Default::default()
        }
    }
}

/// Node lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Scheduled,
    Waiting,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    Skipped,
}

impl NodeStatus {
    /// States a node can still leave.
    pub const LIVE: [NodeStatus; 3] = [NodeStatus::Scheduled, NodeStatus::Waiting, NodeStatus::Running];

    pub fn is_terminal(&self) -> bool {
        !Self::LIVE.contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Scheduled => "scheduled",
            NodeStatus::Waiting => "waiting",
            NodeStatus::Running => "running",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
            NodeStatus::Cancelled => "cancelled",
            NodeStatus::Timeout => "timeout",
            NodeStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "scheduled" => Ok(NodeStatus::Scheduled),
            "waiting" => Ok(NodeStatus::Waiting),
            "running" => Ok(NodeStatus::Running),
            "completed" => Ok(NodeStatus::Completed),
            "failed" => Ok(NodeStatus::Failed),
            "cancelled" => Ok(NodeStatus::Cancelled),
            "timeout" => Ok(NodeStatus::Timeout),
            "skipped" => Ok(NodeStatus::Skipped),
            other => Err(format!("invalid node status: '{other}'")),
        }
    }
}
