//! Workflow instance types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::node::NodeStatus;

/// One execution of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInst {
    pub inst_id: i64,
    pub def_id: i64,
    pub version: i32,
    pub status: InstStatus,
    /// Key-value store merged over the instance's life. Completed node
    /// outputs are projected under their ref name.
    pub context: serde_json::Value,
    /// One group of ref names per decider wavefront, index-ordered.
    #[serde(default)]
    pub execute_path: Vec<Vec<String>>,
    /// Node instances considered live under the current restart state.
    #[serde(default)]
    pub sched_node_insts: Vec<SchedNodeInst>,
    #[serde(default)]
    pub cur_node_inst: Option<i64>,
    #[serde(default)]
    pub parent_inst_id: Option<i64>,
    #[serde(default)]
    pub parent_node_inst_id: Option<i64>,
    pub operator: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub last_restart_node: Option<String>,
    #[serde(default)]
    pub last_restart_at: Option<DateTime<Utc>>,
    /// Restart boundary: highest node instance id at the last restart.
    #[serde(default)]
    pub before_last_restart_max_node_inst_id: i64,
    #[serde(default)]
    pub timeout_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl WorkflowInst {
    /// The restart mark recorded on this instance, if any.
    pub fn restart_mark(&self) -> Option<RestartMark> {
        self.last_restart_node.as_ref().map(|ref_name| RestartMark {
            ref_name: ref_name.clone(),
            boundary: self.before_last_restart_max_node_inst_id,
        })
    }

    /// Latest scheduled node instance for `ref_name`.
    pub fn sched_node(&self, ref_name: &str) -> Option<&SchedNodeInst> {
        self.sched_node_insts
            .iter()
            .filter(|n| n.ref_name == ref_name)
            .max_by_key(|n| n.node_inst_id)
    }
}

/// Input for creating an instance. The store assigns the id and timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkflowInst {
    pub def_id: i64,
    pub version: i32,
    pub context: serde_json::Value,
    pub operator: String,
    #[serde(default)]
    pub parent_inst_id: Option<i64>,
    #[serde(default)]
    pub parent_node_inst_id: Option<i64>,
    #[serde(default)]
    pub timeout_at: Option<DateTime<Utc>>,
}

/// Field changes applied together with an instance status transition.
#[derive(Debug, Clone, Default)]
pub struct InstTransition {
    pub operator: Option<String>,
    pub reason: Option<String>,
    /// Written as-is: `None` clears `ended_at` when re-entering a live state.
    pub ended_at: Option<DateTime<Utc>>,
}

/// Projection of a node instance kept in `sched_node_insts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedNodeInst {
    pub node_inst_id: i64,
    pub ref_name: String,
    pub status: NodeStatus,
}

impl SchedNodeInst {
    pub fn new(node_inst_id: i64, ref_name: &str, status: NodeStatus) -> Self {
        Self {
            node_inst_id,
            ref_name: ref_name.to_string(),
            status,
        }
    }
}

/// Restart bookkeeping consumed by the reconciliation algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartMark {
    pub ref_name: String,
    pub boundary: i64,
}

/// Instance lifecycle states.
///
/// - Running/Paused: live
/// - Succeed/Failed/Cancelled/Timeout: terminal, entered by compare-and-set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstStatus {
    Running,
    Paused,
    Succeed,
    Failed,
    Cancelled,
    Timeout,
}

impl InstStatus {
    pub const LIVE: [InstStatus; 2] = [InstStatus::Running, InstStatus::Paused];
    pub const ALL: [InstStatus; 6] = [
        InstStatus::Running,
        InstStatus::Paused,
        InstStatus::Succeed,
        InstStatus::Failed,
        InstStatus::Cancelled,
        InstStatus::Timeout,
    ];

    pub fn is_terminal(&self) -> bool {
        !matches!(self, InstStatus::Running | InstStatus::Paused)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstStatus::Running => "running",
            InstStatus::Paused => "paused",
            InstStatus::Succeed => "succeed",
            InstStatus::Failed => "failed",
            InstStatus::Cancelled => "cancelled",
            InstStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for InstStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(InstStatus::Running),
            "paused" => Ok(InstStatus::Paused),
            "succeed" => Ok(InstStatus::Succeed),
            "failed" => Ok(InstStatus::Failed),
            "cancelled" => Ok(InstStatus::Cancelled),
            "timeout" => Ok(InstStatus::Timeout),
            other => Err(format!("invalid instance status: '{other}'")),
        }
    }
}
