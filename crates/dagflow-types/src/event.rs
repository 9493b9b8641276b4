//! Engine events published on the in-process event bus.
//!
//! These are observations, not commands: nothing in the engine depends on
//! them being delivered.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::instance::InstStatus;
use crate::message::Channel;
use crate::node::NodeStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    InstanceStarted {
        inst_id: i64,
        def_id: i64,
        version: i32,
    },
    InstanceFinished {
        inst_id: i64,
        status: InstStatus,
    },
    NodeScheduled {
        inst_id: i64,
        node_inst_id: i64,
        ref_name: String,
    },
    NodeFinished {
        inst_id: i64,
        node_inst_id: i64,
        ref_name: String,
        status: NodeStatus,
    },
    NodeNearTimeout {
        inst_id: i64,
        node_inst_id: i64,
        ref_name: String,
    },
    MessageDeadLettered {
        envelope_id: Uuid,
        channel: Channel,
        attempts: u32,
        error: String,
    },
}
