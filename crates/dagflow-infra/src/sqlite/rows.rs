//! Row types and column codecs shared by the SQLite repositories.
//!
//! Live and history tables have identical columns, so the same row types
//! decode both.

use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use dagflow_types::definition::WorkflowDef;
use dagflow_types::error::RepositoryError;
use dagflow_types::instance::WorkflowInst;
use dagflow_types::node::NodeInst;
use dagflow_types::trigger::Trigger;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

pub(crate) const DEF_COLUMNS: &str = "def_id, version, name, creator, description, nodes, status, \
     parent_def_id, ref_name, timeout_secs, triggers, inst_triggers, created_at, updated_at";

pub(crate) const INST_COLUMNS: &str = "inst_id, def_id, version, status, context, execute_path, \
     sched_node_insts, cur_node_inst, parent_inst_id, parent_node_inst_id, operator, reason, \
     last_restart_node, last_restart_at, before_last_restart_max_node_inst_id, timeout_at, \
     created_at, updated_at, ended_at";

pub(crate) const NODE_COLUMNS: &str = "node_inst_id, def_id, inst_id, ref_name, node_type, status, \
     input, output, poll_input, poll_output, error, nexts, parents, scheduled_at, completed_at, \
     timeout_at, near_timeout_at, near_timeout_alerted, next_poll_at, updated_at";

pub(crate) const TRIGGER_COLUMNS: &str = "trigger_id, level, kind, target, when_expr, payload, \
     status, def_id, def_version, inst_id, ref_name, last_fired_at, created_at, updated_at";

// ---------------------------------------------------------------------------
// Codecs
// ---------------------------------------------------------------------------

pub(crate) fn query_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

/// Fixed-width UTC form; text order equals time order.
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn parse_opt_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    s.as_deref().map(parse_datetime).transpose()
}

pub(crate) fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize: {e}")))
}

pub(crate) fn opt_json(value: Option<&serde_json::Value>) -> Result<Option<String>, RepositoryError> {
    value.map(to_json).transpose()
}

fn from_json<T: DeserializeOwned>(s: &str, column: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {column} JSON: {e}")))
}

fn from_opt_json<T: DeserializeOwned>(s: Option<String>, column: &str) -> Result<Option<T>, RepositoryError> {
    s.as_deref().map(|s| from_json(s, column)).transpose()
}

fn parse_enum<T>(s: &str) -> Result<T, RepositoryError>
where
    T: FromStr,
    T::Err: Display,
{
    s.parse::<T>().map_err(|e| RepositoryError::Query(e.to_string()))
}

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

pub(crate) struct DefRow {
    def_id: i64,
    version: i32,
    name: String,
    creator: String,
    description: String,
    nodes: String,
    status: String,
    parent_def_id: Option<i64>,
    ref_name: Option<String>,
    timeout_secs: Option<i64>,
    triggers: String,
    inst_triggers: String,
    created_at: String,
    updated_at: String,
}

impl DefRow {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self, RepositoryError> {
        Self::decode(row).map_err(query_err)
    }

    fn decode(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            def_id: row.try_get("def_id")?,
            version: row.try_get("version")?,
            name: row.try_get("name")?,
            creator: row.try_get("creator")?,
            description: row.try_get("description")?,
            nodes: row.try_get("nodes")?,
            status: row.try_get("status")?,
            parent_def_id: row.try_get("parent_def_id")?,
            ref_name: row.try_get("ref_name")?,
            timeout_secs: row.try_get("timeout_secs")?,
            triggers: row.try_get("triggers")?,
            inst_triggers: row.try_get("inst_triggers")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    pub(crate) fn into_def(self) -> Result<WorkflowDef, RepositoryError> {
        Ok(WorkflowDef {
            def_id: self.def_id,
            version: self.version,
            name: self.name,
            creator: self.creator,
            description: self.description,
            nodes: from_json(&self.nodes, "nodes")?,
            status: parse_enum(&self.status)?,
            parent_def_id: self.parent_def_id,
            ref_name: self.ref_name,
            timeout_secs: self.timeout_secs.map(|s| s.max(0) as u64),
            triggers: from_json(&self.triggers, "triggers")?,
            inst_triggers: from_json(&self.inst_triggers, "inst_triggers")?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Instances
// ---------------------------------------------------------------------------

pub(crate) struct InstRow {
    inst_id: i64,
    def_id: i64,
    version: i32,
    status: String,
    context: String,
    execute_path: String,
    sched_node_insts: String,
    cur_node_inst: Option<i64>,
    parent_inst_id: Option<i64>,
    parent_node_inst_id: Option<i64>,
    operator: String,
    reason: Option<String>,
    last_restart_node: Option<String>,
    last_restart_at: Option<String>,
    before_last_restart_max_node_inst_id: i64,
    timeout_at: Option<String>,
    created_at: String,
    updated_at: String,
    ended_at: Option<String>,
}

impl InstRow {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self, RepositoryError> {
        Self::decode(row).map_err(query_err)
    }

    fn decode(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            inst_id: row.try_get("inst_id")?,
            def_id: row.try_get("def_id")?,
            version: row.try_get("version")?,
            status: row.try_get("status")?,
            context: row.try_get("context")?,
            execute_path: row.try_get("execute_path")?,
            sched_node_insts: row.try_get("sched_node_insts")?,
            cur_node_inst: row.try_get("cur_node_inst")?,
            parent_inst_id: row.try_get("parent_inst_id")?,
            parent_node_inst_id: row.try_get("parent_node_inst_id")?,
            operator: row.try_get("operator")?,
            reason: row.try_get("reason")?,
            last_restart_node: row.try_get("last_restart_node")?,
            last_restart_at: row.try_get("last_restart_at")?,
            before_last_restart_max_node_inst_id: row
                .try_get("before_last_restart_max_node_inst_id")?,
            timeout_at: row.try_get("timeout_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            ended_at: row.try_get("ended_at")?,
        })
    }

    pub(crate) fn into_inst(self) -> Result<WorkflowInst, RepositoryError> {
        Ok(WorkflowInst {
            inst_id: self.inst_id,
            def_id: self.def_id,
            version: self.version,
            status: parse_enum(&self.status)?,
            context: from_json(&self.context, "context")?,
            execute_path: from_json(&self.execute_path, "execute_path")?,
            sched_node_insts: from_json(&self.sched_node_insts, "sched_node_insts")?,
            cur_node_inst: self.cur_node_inst,
            parent_inst_id: self.parent_inst_id,
            parent_node_inst_id: self.parent_node_inst_id,
            operator: self.operator,
            reason: self.reason,
            last_restart_node: self.last_restart_node,
            last_restart_at: parse_opt_datetime(self.last_restart_at)?,
            before_last_restart_max_node_inst_id: self.before_last_restart_max_node_inst_id,
            timeout_at: parse_opt_datetime(self.timeout_at)?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            ended_at: parse_opt_datetime(self.ended_at)?,
        })
    }
}

pub(crate) fn decode_insts(rows: &[SqliteRow]) -> Result<Vec<WorkflowInst>, RepositoryError> {
    rows.iter()
        .map(|row| InstRow::from_row(row)?.into_inst())
        .collect()
}

// ---------------------------------------------------------------------------
// Node instances
// ---------------------------------------------------------------------------

pub(crate) struct NodeRow {
    node_inst_id: i64,
    def_id: i64,
    inst_id: i64,
    ref_name: String,
    node_type: String,
    status: String,
    input: Option<String>,
    output: Option<String>,
    poll_input: Option<String>,
    poll_output: Option<String>,
    error: Option<String>,
    nexts: String,
    parents: String,
    scheduled_at: String,
    completed_at: Option<String>,
    timeout_at: Option<String>,
    near_timeout_at: Option<String>,
    near_timeout_alerted: bool,
    next_poll_at: Option<String>,
    updated_at: String,
}

impl NodeRow {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self, RepositoryError> {
        Self::decode(row).map_err(query_err)
    }

    fn decode(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            node_inst_id: row.try_get("node_inst_id")?,
            def_id: row.try_get("def_id")?,
            inst_id: row.try_get("inst_id")?,
            ref_name: row.try_get("ref_name")?,
            node_type: row.try_get("node_type")?,
            status: row.try_get("status")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            poll_input: row.try_get("poll_input")?,
            poll_output: row.try_get("poll_output")?,
            error: row.try_get("error")?,
            nexts: row.try_get("nexts")?,
            parents: row.try_get("parents")?,
            scheduled_at: row.try_get("scheduled_at")?,
            completed_at: row.try_get("completed_at")?,
            timeout_at: row.try_get("timeout_at")?,
            near_timeout_at: row.try_get("near_timeout_at")?,
            near_timeout_alerted: row.try_get("near_timeout_alerted")?,
            next_poll_at: row.try_get("next_poll_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    pub(crate) fn into_node(self) -> Result<NodeInst, RepositoryError> {
        Ok(NodeInst {
            node_inst_id: self.node_inst_id,
            def_id: self.def_id,
            inst_id: self.inst_id,
            ref_name: self.ref_name,
            node_type: parse_enum(&self.node_type)?,
            status: parse_enum(&self.status)?,
            input: from_opt_json(self.input, "input")?,
            output: from_opt_json(self.output, "output")?,
            poll_input: from_opt_json(self.poll_input, "poll_input")?,
            poll_output: from_opt_json(self.poll_output, "poll_output")?,
            error: self.error,
            nexts: from_json(&self.nexts, "nexts")?,
            parents: from_json(&self.parents, "parents")?,
            scheduled_at: parse_datetime(&self.scheduled_at)?,
            completed_at: parse_opt_datetime(self.completed_at)?,
            timeout_at: parse_opt_datetime(self.timeout_at)?,
            near_timeout_at: parse_opt_datetime(self.near_timeout_at)?,
            near_timeout_alerted: self.near_timeout_alerted,
            next_poll_at: parse_opt_datetime(self.next_poll_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

pub(crate) fn decode_nodes(rows: &[SqliteRow]) -> Result<Vec<NodeInst>, RepositoryError> {
    rows.iter()
        .map(|row| NodeRow::from_row(row)?.into_node())
        .collect()
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

pub(crate) struct TriggerRow {
    trigger_id: i64,
    level: String,
    kind: String,
    target: String,
    when_expr: Option<String>,
    payload: String,
    status: String,
    def_id: i64,
    def_version: i32,
    inst_id: Option<i64>,
    ref_name: Option<String>,
    last_fired_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TriggerRow {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self, RepositoryError> {
        Self::decode(row).map_err(query_err)
    }

    fn decode(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            trigger_id: row.try_get("trigger_id")?,
            level: row.try_get("level")?,
            kind: row.try_get("kind")?,
            target: row.try_get("target")?,
            when_expr: row.try_get("when_expr")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            def_id: row.try_get("def_id")?,
            def_version: row.try_get("def_version")?,
            inst_id: row.try_get("inst_id")?,
            ref_name: row.try_get("ref_name")?,
            last_fired_at: row.try_get("last_fired_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    pub(crate) fn into_trigger(self) -> Result<Trigger, RepositoryError> {
        Ok(Trigger {
            trigger_id: self.trigger_id,
            level: parse_enum(&self.level)?,
            kind: parse_enum(&self.kind)?,
            target: self.target,
            when: self.when_expr,
            payload: from_json(&self.payload, "payload")?,
            status: parse_enum(&self.status)?,
            def_id: self.def_id,
            def_version: self.def_version,
            inst_id: self.inst_id,
            ref_name: self.ref_name,
            last_fired_at: parse_opt_datetime(self.last_fired_at)?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

pub(crate) fn decode_triggers(rows: &[SqliteRow]) -> Result<Vec<Trigger>, RepositoryError> {
    rows.iter()
        .map(|row| TriggerRow::from_row(row)?.into_trigger())
        .collect()
}

/// `?, ?, ...` with `n` placeholders.
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}
