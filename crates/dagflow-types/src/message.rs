//! Message bus payload types.
//!
//! Four logical channels carry work into the engine:
//! - **Drive:** internal DAG advancement for one instance.
//! - **External:** caller-supplied events awaited by triggers and waiting nodes.
//! - **Cron:** scheduled fires of cron triggers.
//! - **Trigger:** fan-out of matched trigger fires to their owners.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::trigger::TriggerLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Drive,
    External,
    Cron,
    Trigger,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::Drive,
        Channel::External,
        Channel::Cron,
        Channel::Trigger,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Drive => "drive",
            Channel::External => "external",
            Channel::Cron => "cron",
            Channel::Trigger => "trigger",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ask the executor to re-derive and advance an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriveEvent {
    pub inst_id: i64,
    /// Free-form cause, for logs only.
    pub cause: String,
}

/// An event supplied by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalEvent {
    pub name: String,
    /// Restricts delivery to triggers owned by this instance.
    #[serde(default)]
    pub inst_id: Option<i64>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// A cron tick for one trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronFire {
    pub trigger_id: i64,
    pub fired_at: DateTime<Utc>,
}

/// A matched trigger, routed to its owner by level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerFire {
    pub trigger_id: i64,
    pub level: TriggerLevel,
    pub def_id: i64,
    pub def_version: i32,
    #[serde(default)]
    pub inst_id: Option<i64>,
    #[serde(default)]
    pub ref_name: Option<String>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMessage {
    Drive(DriveEvent),
    External(ExternalEvent),
    Cron(CronFire),
    Trigger(TriggerFire),
}

impl BusMessage {
    pub fn drive(inst_id: i64, cause: impl Into<String>) -> Self {
        BusMessage::Drive(DriveEvent {
            inst_id,
            cause: cause.into(),
        })
    }

    pub fn channel(&self) -> Channel {
        match self {
            BusMessage::Drive(_) => Channel::Drive,
            BusMessage::External(_) => Channel::External,
            BusMessage::Cron(_) => Channel::Cron,
            BusMessage::Trigger(_) => Channel::Trigger,
        }
    }

    /// Routing key: the target instance when known, otherwise the owning
    /// definition or trigger.
    pub fn partition_key(&self) -> i64 {
        match self {
            BusMessage::Drive(d) => d.inst_id,
            BusMessage::External(e) => e.inst_id.unwrap_or(0),
            BusMessage::Cron(c) => c.trigger_id,
            BusMessage::Trigger(t) => t.inst_id.unwrap_or(t.def_id),
        }
    }
}

/// A message in flight, with delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub channel: Channel,
    pub partition_key: i64,
    /// 1 on first delivery.
    pub attempt: u32,
    pub published_at: DateTime<Utc>,
    pub message: BusMessage,
}

impl Envelope {
    pub fn new(message: BusMessage) -> Self {
        Self {
            id: Uuid::now_v7(),
            channel: message.channel(),
            partition_key: message.partition_key(),
            attempt: 1,
            published_at: Utc::now(),
            message,
        }
    }

    /// The same message, one delivery later.
    pub fn redelivery(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_routing_follows_instance() {
        let env = Envelope::new(BusMessage::drive(42, "start"));
        assert_eq!(env.channel, Channel::Drive);
        assert_eq!(env.partition_key, 42);
        assert_eq!(env.attempt, 1);

        let again = env.redelivery();
        assert_eq!(again.id, env.id);
        assert_eq!(again.attempt, 2);
    }

    #[test]
    fn test_trigger_fire_partitions_by_def_without_instance() {
        let msg = BusMessage::Trigger(TriggerFire {
            trigger_id: 9,
            level: TriggerLevel::WorkflowDef,
            def_id: 7,
            def_version: 1,
            inst_id: None,
            ref_name: None,
            payload: json!({}),
        });
        assert_eq!(msg.partition_key(), 7);
        assert_eq!(msg.channel(), Channel::Trigger);
    }

    #[test]
    fn test_bus_message_tagged_json() {
        let msg = BusMessage::External(ExternalEvent {
            name: "order.paid".into(),
            inst_id: Some(3),
            payload: json!({"amount": 12}),
        });
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "external");
        assert_eq!(v["name"], "order.paid");
    }
}
