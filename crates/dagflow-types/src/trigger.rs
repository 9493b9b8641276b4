//! Persisted trigger registrations.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An active or deactivated trigger registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub trigger_id: i64,
    pub level: TriggerLevel,
    pub kind: TriggerKind,
    /// Event name for `Event` triggers, cron expression for `Cron` triggers.
    pub target: String,
    #[serde(default)]
    pub when: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub status: TriggerStatus,
    pub def_id: i64,
    pub def_version: i32,
    #[serde(default)]
    pub inst_id: Option<i64>,
    #[serde(default)]
    pub ref_name: Option<String>,
    #[serde(default)]
    pub last_fired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trigger {
    pub fn scope(&self) -> TriggerScope {
        TriggerScope {
            level: self.level,
            def_id: self.def_id,
            def_version: self.def_version,
            inst_id: self.inst_id,
            ref_name: self.ref_name.clone(),
        }
    }
}

/// Input for registering a trigger. Upserts are keyed by scope, kind and
/// target, so registering twice re-activates the same row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTrigger {
    pub scope: TriggerScope,
    pub kind: TriggerKind,
    pub target: String,
    #[serde(default)]
    pub when: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// The owner of a set of triggers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriggerScope {
    pub level: TriggerLevel,
    pub def_id: i64,
    pub def_version: i32,
    #[serde(default)]
    pub inst_id: Option<i64>,
    #[serde(default)]
    pub ref_name: Option<String>,
}

impl TriggerScope {
    pub fn definition(def_id: i64, def_version: i32) -> Self {
        Self {
            level: TriggerLevel::WorkflowDef,
            def_id,
            def_version,
            inst_id: None,
            ref_name: None,
        }
    }

    pub fn instance(def_id: i64, def_version: i32, inst_id: i64) -> Self {
        Self {
            level: TriggerLevel::WorkflowInst,
            def_id,
            def_version,
            inst_id: Some(inst_id),
            ref_name: None,
        }
    }

    /// Node scope. `ref_name = None` matches every node of the instance
    /// when used as a filter.
    pub fn node(def_id: i64, def_version: i32, inst_id: i64, ref_name: Option<&str>) -> Self {
        Self {
            level: TriggerLevel::NodeInst,
            def_id,
            def_version,
            inst_id: Some(inst_id),
            ref_name: ref_name.map(str::to_string),
        }
    }

    /// Whether a trigger registered under `other` falls inside this scope
    /// (used as a filter: `None` fields match anything).
    pub fn contains(&self, other: &TriggerScope) -> bool {
        self.level == other.level
            && self.def_id == other.def_id
            && self.def_version == other.def_version
            && (self.inst_id.is_none() || self.inst_id == other.inst_id)
            && (self.ref_name.is_none() || self.ref_name == other.ref_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerLevel {
    WorkflowDef,
    WorkflowInst,
    NodeInst,
}

impl TriggerLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerLevel::WorkflowDef => "workflow_def",
            TriggerLevel::WorkflowInst => "workflow_inst",
            TriggerLevel::NodeInst => "node_inst",
        }
    }
}

impl fmt::Display for TriggerLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "workflow_def" => Ok(TriggerLevel::WorkflowDef),
            "workflow_inst" => Ok(TriggerLevel::WorkflowInst),
            "node_inst" => Ok(TriggerLevel::NodeInst),
            other => Err(format!("invalid trigger level: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Cron,
    Event,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Cron => "cron",
            TriggerKind::Event => "event",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cron" => Ok(TriggerKind::Cron),
            "event" => Ok(TriggerKind::Event),
            other => Err(format!("invalid trigger kind: '{other}'")),
        }
    }
}

/// Unregistering deactivates rather than deletes, preserving audit history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerStatus {
    Inactive,
    Active,
}

impl TriggerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerStatus::Inactive => "inactive",
            TriggerStatus::Active => "active",
        }
    }
}

impl FromStr for TriggerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inactive" => Ok(TriggerStatus::Inactive),
            "active" => Ok(TriggerStatus::Active),
            other => Err(format!("invalid trigger status: '{other}'")),
        }
    }
}
