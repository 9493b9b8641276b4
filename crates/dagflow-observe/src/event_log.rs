//! Structured log of engine events.
//!
//! The server forwards every `EngineEvent` from the event bus here, so
//! lifecycle changes show up in logs (and spans, when OTel is on) without
//! the engine knowing about its observers.

use dagflow_types::event::EngineEvent;
use dagflow_types::instance::InstStatus;
use dagflow_types::node::NodeStatus;

/// Stable name of an event, used as the `event` log field.
pub fn event_name(event: &EngineEvent) -> &'static str {
    match event {
        EngineEvent::InstanceStarted { .. } => "instance_started",
        EngineEvent::InstanceFinished { .. } => "instance_finished",
        EngineEvent::NodeScheduled { .. } => "node_scheduled",
        EngineEvent::NodeFinished { .. } => "node_finished",
        EngineEvent::NodeNearTimeout { .. } => "node_near_timeout",
        EngineEvent::MessageDeadLettered { .. } => "message_dead_lettered",
    }
}

/// Whether an event deserves operator attention (logged at `warn`).
pub fn is_anomaly(event: &EngineEvent) -> bool {
    match event {
        EngineEvent::InstanceFinished { status, .. } => {
            matches!(status, InstStatus::Failed | InstStatus::Timeout)
        }
        EngineEvent::NodeFinished { status, .. } => {
            matches!(status, NodeStatus::Failed | NodeStatus::Timeout)
        }
        EngineEvent::NodeNearTimeout { .. } | EngineEvent::MessageDeadLettered { .. } => true,
        EngineEvent::InstanceStarted { .. } | EngineEvent::NodeScheduled { .. } => false,
    }
}

/// Emit one event as a structured log line.
pub fn log_event(event: &EngineEvent) {
    let name = event_name(event);
    let warn = is_anomaly(event);
    match event {
        EngineEvent::InstanceStarted {
            inst_id,
            def_id,
            version,
        } => tracing::info!(event = name, inst_id, def_id, version, "instance started"),
        EngineEvent::InstanceFinished { inst_id, status } if warn => {
            tracing::warn!(event = name, inst_id, status = %status, "instance finished")
        }
        EngineEvent::InstanceFinished { inst_id, status } => {
            tracing::info!(event = name, inst_id, status = %status, "instance finished")
        }
        EngineEvent::NodeScheduled {
            inst_id,
            node_inst_id,
            ref_name,
        } => tracing::debug!(event = name, inst_id, node_inst_id, ref_name = %ref_name, "node scheduled"),
        EngineEvent::NodeFinished {
            inst_id,
            node_inst_id,
            ref_name,
            status,
        } if warn => tracing::warn!(
            event = name,
            inst_id,
            node_inst_id,
            ref_name = %ref_name,
            status = %status,
            "node finished"
        ),
        EngineEvent::NodeFinished {
            inst_id,
            node_inst_id,
            ref_name,
            status,
        } => tracing::debug!(
            event = name,
            inst_id,
            node_inst_id,
            ref_name = %ref_name,
            status = %status,
            "node finished"
        ),
        EngineEvent::NodeNearTimeout {
            inst_id,
            node_inst_id,
            ref_name,
        } => tracing::warn!(event = name, inst_id, node_inst_id, ref_name = %ref_name, "node near timeout"),
        EngineEvent::MessageDeadLettered {
            envelope_id,
            channel,
            attempts,
            error,
        } => tracing::warn!(
            event = name,
            envelope_id = %envelope_id,
            channel = %channel,
            attempts,
            error = %error,
            "message dead-lettered"
        ),
    }
}
