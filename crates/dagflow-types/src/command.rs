//! Command and query DTOs for the engine's command surface.
//!
//! Every mutating command carries the caller's `operator` identity
//! explicitly; adapters fill it in from their own session handling.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::definition::{DefStatus, NodeDef, TriggerDef};
use crate::instance::{InstStatus, WorkflowInst};
use crate::node::NodeInst;

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

/// `def_id = None` creates a new definition; `Some` appends a version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDefCmd {
    #[serde(default)]
    pub def_id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub nodes: BTreeMap<String, NodeDef>,
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
    pub operator: String,
}

/// Metadata-only update of one stored version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateDefCmd {
    pub def_id: i64,
    pub version: i32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub operator: String,
}

/// Target of EnableDef / DisableDef.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefRefCmd {
    pub def_id: i64,
    pub version: i32,
    pub operator: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefQuery {
    /// Case-sensitive substring match on the name.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<DefStatus>,
}

// ---------------------------------------------------------------------------
// Instances
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartInstCmd {
    pub def_id: i64,
    /// Latest version when absent.
    #[serde(default)]
    pub version: Option<i32>,
    #[serde(default)]
    pub context: serde_json::Value,
    pub operator: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartInstCmd {
    pub inst_id: i64,
    pub ref_name: String,
    pub operator: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Target of CancelInst / PauseInst / ResumeInst / CompleteInst.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstCmd {
    pub inst_id: i64,
    pub operator: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateInstContextCmd {
    pub inst_id: i64,
    /// Deep-merged into the instance context.
    pub context: serde_json::Value,
    pub operator: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstQuery {
    #[serde(default)]
    pub def_id: Option<i64>,
    #[serde(default)]
    pub status: Option<InstStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveHistoryCmd {
    pub def_id: i64,
    pub inst_ids: Vec<i64>,
    pub operator: String,
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// Target of RerunNode / ResumeNode / CancelNode / SkipNode / CancelSkipNode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCmd {
    pub node_inst_id: i64,
    pub operator: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteNodeCmd {
    pub node_inst_id: i64,
    #[serde(default)]
    pub output: serde_json::Value,
    pub operator: String,
}

/// Target of SetNodeTimeout / SetNodeNearTimeout: the deadline becomes
/// `now + secs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetNodeDeadlineCmd {
    pub node_inst_id: i64,
    pub secs: u64,
    pub operator: String,
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of an archival request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveReport {
    pub archived: Vec<i64>,
    /// Already archived (or gone); repeated archival is a no-op.
    pub skipped: Vec<i64>,
}

/// An instance with its node instances, live or archived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstDetail {
    pub inst: WorkflowInst,
    pub nodes: Vec<NodeInst>,
    pub archived: bool,
}

/// A page of results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

/// 1-based page request. Page sizes are clamped to `1..=MAX_PAGE_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub const MAX_PAGE_SIZE: u32 = 200;

    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.clamp(1, Self::MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.max(1) - 1) * u64::from(self.limit())
    }

    pub fn limit(&self) -> u32 {
        self.page_size.clamp(1, Self::MAX_PAGE_SIZE)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, 20)
    }
}
