//! Trigger registry: persists trigger registrations, schedules cron
//! triggers, and turns matching external events and cron ticks into
//! `TriggerFire` messages.
//!
//! Registration is scoped (definition, instance, or node) and idempotent;
//! unregistering deactivates rows instead of deleting them. An optional
//! `when` clause is evaluated with `WorkflowEvaluator` against
//! `{event, payload}` before an event trigger fires.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dagflow_types::definition::TriggerDef;
use dagflow_types::error::EngineError;
use dagflow_types::message::{BusMessage, CronFire, ExternalEvent, TriggerFire};
use dagflow_types::trigger::{NewTrigger, Trigger, TriggerKind, TriggerScope, TriggerStatus};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::expression::matches_when;
use super::scheduler::{CronCallback, CronScheduler, latest_missed_fire, validate_schedule};
use super::updater::merge_context;
use crate::message::MessageBus;
use crate::repository::WorkflowStore;

/// Check trigger declarations before anything is stored.
pub fn validate_trigger_defs(defs: &[TriggerDef]) -> Result<(), EngineError> {
    for def in defs {
        match def {
            TriggerDef::Cron { expr, .. } => validate_schedule(expr)?,
            TriggerDef::Event { event, .. } if event.trim().is_empty() => {
                return Err(EngineError::invalid("event trigger needs an event name"));
            }
            TriggerDef::Event { .. } => {}
        }
    }
    Ok(())
}

fn to_new_trigger(scope: &TriggerScope, def: &TriggerDef) -> NewTrigger {
    let (kind, target, when, payload) = match def {
        TriggerDef::Cron { expr, payload } => (TriggerKind::Cron, expr.clone(), None, payload.clone()),
        TriggerDef::Event {
            event,
            when,
            payload,
        } => (TriggerKind::Event, event.clone(), when.clone(), payload.clone()),
    };
    NewTrigger {
        scope: scope.clone(),
        kind,
        target,
        when,
        payload,
    }
}

fn fire_for(trigger: &Trigger, payload: Value) -> BusMessage {
    BusMessage::Trigger(TriggerFire {
        trigger_id: trigger.trigger_id,
        level: trigger.level,
        def_id: trigger.def_id,
        def_version: trigger.def_version,
        inst_id: trigger.inst_id,
        ref_name: trigger.ref_name.clone(),
        payload,
    })
}

/// Registry of persisted triggers backed by a `CronScheduler`.
pub struct TriggerRegistry<S: WorkflowStore> {
    store: Arc<S>,
    bus: MessageBus,
    scheduler: Arc<CronScheduler>,
}

impl<S: WorkflowStore> TriggerRegistry<S> {
    pub fn new(store: Arc<S>, bus: MessageBus, scheduler: Arc<CronScheduler>) -> Self {
        Self {
            store,
            bus,
            scheduler,
        }
    }

    pub fn scheduler(&self) -> &Arc<CronScheduler> {
        &self.scheduler
    }

    /// Cron ticks are not handled inline: they are published on the Cron
    /// channel so retries and partitioning apply to them like any message.
    fn cron_callback(&self) -> CronCallback {
        let bus = self.bus.clone();
        Arc::new(move |trigger_id, fired_at| {
            let bus = bus.clone();
            Box::pin(async move {
                if let Err(e) = bus.publish(BusMessage::Cron(CronFire {
                    trigger_id,
                    fired_at,
                })) {
                    warn!(trigger_id, error = %e, "failed to publish cron fire");
                }
            })
        })
    }

    async fn schedule(&self, trigger: &Trigger) -> Result<(), EngineError> {
        if !self.scheduler.is_running().await {
            debug!(trigger_id = trigger.trigger_id, "scheduler not running, cron trigger stored only");
            return Ok(());
        }
        self.scheduler
            .schedule_trigger(trigger.trigger_id, &trigger.target, self.cron_callback())
            .await?;
        Ok(())
    }

    /// Register (or re-activate) `defs` under `scope`.
    pub async fn register(
        &self,
        scope: &TriggerScope,
        defs: &[TriggerDef],
    ) -> Result<Vec<Trigger>, EngineError> {
        validate_trigger_defs(defs)?;
        let mut registered = Vec::with_capacity(defs.len());
        for def in defs {
            let trigger = self.store.upsert_trigger(&to_new_trigger(scope, def)).await?;
            if trigger.kind == TriggerKind::Cron {
                self.schedule(&trigger).await?;
            }
            registered.push(trigger);
        }
        if !registered.is_empty() {
            info!(
                level = %scope.level,
                def_id = scope.def_id,
                inst_id = ?scope.inst_id,
                count = registered.len(),
                "triggers registered"
            );
        }
        Ok(registered)
    }

    /// Deactivate every active trigger inside `scope`.
    pub async fn unregister(&self, scope: &TriggerScope) -> Result<u64, EngineError> {
        for trigger in self.store.list_triggers(scope).await? {
            if trigger.kind == TriggerKind::Cron && trigger.status == TriggerStatus::Active {
                self.scheduler.unschedule_trigger(trigger.trigger_id).await?;
            }
        }
        let count = self.store.deactivate_triggers(scope).await?;
        if count > 0 {
            debug!(level = %scope.level, def_id = scope.def_id, inst_id = ?scope.inst_id, count, "triggers deactivated");
        }
        Ok(count)
    }

    /// Match an external event against active event triggers and publish
    /// one `TriggerFire` per match. Returns the number of fires.
    ///
    /// An event scoped to an instance only reaches that instance's triggers.
    pub async fn on_external(&self, event: &ExternalEvent) -> Result<usize, EngineError> {
        let candidates = self
            .store
            .list_active_triggers(Some(TriggerKind::Event), Some(&event.name))
            .await?;
        let eval_ctx = json!({ "event": event.name, "payload": event.payload });

        let mut fired = 0;
        for trigger in candidates {
            if event.inst_id.is_some() && trigger.inst_id != event.inst_id {
                continue;
            }
            match matches_when(trigger.when.as_deref(), &eval_ctx) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(trigger_id = trigger.trigger_id, event = %event.name, "when clause rejected event");
                    continue;
                }
                Err(e) => {
                    warn!(trigger_id = trigger.trigger_id, error = %e, "when clause failed to evaluate");
                    continue;
                }
            }

            let mut payload = if trigger.payload.is_null() {
                json!({})
            } else {
                trigger.payload.clone()
            };
            merge_context(&mut payload, &event.payload);

            self.store.record_trigger_fire(trigger.trigger_id, Utc::now()).await?;
            self.bus.publish(fire_for(&trigger, payload))?;
            fired += 1;
        }
        debug!(event = %event.name, inst_id = ?event.inst_id, fired, "external event matched");
        Ok(fired)
    }

    /// Apply one cron tick. Ticks for triggers deactivated since scheduling
    /// are dropped.
    pub async fn on_cron(&self, fire: &CronFire) -> Result<bool, EngineError> {
        let Some(trigger) = self.store.get_trigger(fire.trigger_id).await? else {
            debug!(trigger_id = fire.trigger_id, "cron fire for unknown trigger dropped");
            return Ok(false);
        };
        if trigger.status != TriggerStatus::Active {
            debug!(trigger_id = fire.trigger_id, "cron fire for inactive trigger dropped");
            return Ok(false);
        }

        self.store.record_trigger_fire(trigger.trigger_id, fire.fired_at).await?;
        let mut payload = if trigger.payload.is_null() {
            json!({})
        } else {
            trigger.payload.clone()
        };
        merge_context(&mut payload, &json!({"fired_at": fire.fired_at.to_rfc3339()}));
        self.bus.publish(fire_for(&trigger, payload))?;
        Ok(true)
    }

    /// Re-schedule every active cron trigger. A trigger that missed fires
    /// while the engine was down gets one catch-up fire for the latest
    /// missed time. Returns the number of triggers scheduled.
    pub async fn restore(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let active = self
            .store
            .list_active_triggers(Some(TriggerKind::Cron), None)
            .await?;
        let mut scheduled = 0;
        for trigger in &active {
            if let Err(e) = self.schedule(trigger).await {
                warn!(trigger_id = trigger.trigger_id, error = %e, "failed to restore cron trigger");
                continue;
            }
            scheduled += 1;

            let Some(last) = trigger.last_fired_at else {
                continue;
            };
            if let Some(latest) = latest_missed_fire(&trigger.target, last, now) {
                warn!(
                    trigger_id = trigger.trigger_id,
                    %last,
                    %latest,
                    "cron trigger missed fires while stopped, catching up once"
                );
                self.bus.publish(BusMessage::Cron(CronFire {
                    trigger_id: trigger.trigger_id,
                    fired_at: latest,
                }))?;
            }
        }
        info!(scheduled, "cron triggers restored");
        Ok(scheduled)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;
    use crate::message::MessageHandler;
    use crate::repository::memory::MemoryWorkflowStore;
    use crate::repository::trigger::TriggerRepository;
    use dagflow_types::config::BusConfig;
    use dagflow_types::message::Envelope;
    use dagflow_types::trigger::TriggerLevel;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<BusMessage>>);

    impl MessageHandler for Collect {
        async fn handle(&self, envelope: &Envelope) -> Result<(), EngineError> {
            self.0.lock().unwrap().push(envelope.message.clone());
            Ok(())
        }
    }

    fn registry() -> (TriggerRegistry<MemoryWorkflowStore>, MessageBus) {
        let bus = MessageBus::new(BusConfig::default(), EventBus::default());
        let store = Arc::new(MemoryWorkflowStore::new());
        (
            TriggerRegistry::new(store, bus.clone(), Arc::new(CronScheduler::new())),
            bus,
        )
    }

    fn event_def(name: &str, when: Option<&str>) -> TriggerDef {
        TriggerDef::Event {
            event: name.to_string(),
            when: when.map(str::to_string),
            payload: json!({"source": "trigger"}),
        }
    }

    #[test]
    fn test_validate_trigger_defs() {
        assert!(validate_trigger_defs(&[event_def("order.paid", None)]).is_ok());
        assert!(
            validate_trigger_defs(&[TriggerDef::Cron {
                expr: "every 5 minutes".into(),
                payload: Value::Null
            }])
            .is_ok()
        );
        assert!(validate_trigger_defs(&[event_def("  ", None)]).is_err());
        let err = validate_trigger_defs(&[TriggerDef::Cron {
            expr: "whenever".into(),
            payload: Value::Null,
        }])
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_register_is_idempotent_and_unregister_deactivates() {
        let (registry, _bus) = registry();
        let scope = TriggerScope::definition(1, 1);
        let defs = [event_def("order.paid", None)];

        let first = registry.register(&scope, &defs).await.unwrap();
        let second = registry.register(&scope, &defs).await.unwrap();
        assert_eq!(first[0].trigger_id, second[0].trigger_id);

        assert_eq!(registry.unregister(&scope).await.unwrap(), 1);
        assert_eq!(registry.unregister(&scope).await.unwrap(), 0);
        let all = registry.store.list_triggers(&scope).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, TriggerStatus::Inactive);
    }

    #[tokio::test]
    async fn test_external_event_fires_matching_triggers() {
        let (registry, bus) = registry();
        registry
            .register(
                &TriggerScope::definition(1, 1),
                &[event_def("order.paid", Some("payload.amount > 10"))],
            )
            .await
            .unwrap();
        registry
            .register(&TriggerScope::instance(1, 1, 5), &[event_def("order.paid", None)])
            .await
            .unwrap();

        let small = ExternalEvent {
            name: "order.paid".into(),
            inst_id: None,
            payload: json!({"amount": 3}),
        };
        assert_eq!(registry.on_external(&small).await.unwrap(), 1);

        let large = ExternalEvent {
            payload: json!({"amount": 30}),
            ..small.clone()
        };
        assert_eq!(registry.on_external(&large).await.unwrap(), 2);

        let scoped = ExternalEvent {
            inst_id: Some(5),
            ..large.clone()
        };
        assert_eq!(registry.on_external(&scoped).await.unwrap(), 1);

        let collect = Collect::default();
        bus.process_pending(&collect).await;
        let fires = collect.0.lock().unwrap();
        assert_eq!(fires.len(), 4);
        let BusMessage::Trigger(fire) = &fires[3] else {
            panic!("expected trigger fire");
        };
        assert_eq!(fire.level, TriggerLevel::WorkflowInst);
        assert_eq!(fire.payload["source"], "trigger");
        assert_eq!(fire.payload["amount"], 30);
    }

    #[tokio::test]
    async fn test_cron_fire_dropped_for_inactive_trigger() {
        let (registry, bus) = registry();
        let scope = TriggerScope::definition(2, 1);
        let triggers = registry
            .register(
                &scope,
                &[TriggerDef::Cron {
                    expr: "every minute".into(),
                    payload: json!({"k": 1}),
                }],
            )
            .await
            .unwrap();
        let fire = CronFire {
            trigger_id: triggers[0].trigger_id,
            fired_at: Utc::now(),
        };
        assert!(registry.on_cron(&fire).await.unwrap());

        registry.unregister(&scope).await.unwrap();
        assert!(!registry.on_cron(&fire).await.unwrap());

        let collect = Collect::default();
        assert_eq!(bus.process_pending(&collect).await, 1);
        let stored = registry.store.get_trigger(fire.trigger_id).await.unwrap().unwrap();
        assert!(stored.last_fired_at.is_some());

        let fires = collect.0.lock().unwrap();
        let BusMessage::Trigger(published) = &fires[0] else {
            panic!("expected trigger fire");
        };
        assert_eq!(published.level, TriggerLevel::WorkflowDef);
        assert_eq!(published.payload["k"], 1);
        assert_eq!(published.payload["fired_at"], fire.fired_at.to_rfc3339());
        assert!(published.payload.get("trigger").is_none());
    }

    #[tokio::test]
    async fn test_restore_schedules_and_catches_up() {
        let (registry, bus) = registry();
        let triggers = registry
            .register(
                &TriggerScope::definition(3, 1),
                &[TriggerDef::Cron {
                    expr: "every minute".into(),
                    payload: Value::Null,
                }],
            )
            .await
            .unwrap();
        let id = triggers[0].trigger_id;
        let now = Utc::now();
        registry
            .store
            .record_trigger_fire(id, now - chrono::Duration::minutes(30))
            .await
            .unwrap();

        registry.scheduler.start().await.unwrap();
        assert_eq!(registry.restore(now).await.unwrap(), 1);
        assert_eq!(registry.scheduler.scheduled_count().await, 1);

        let collect = Collect::default();
        bus.process_pending(&collect).await;
        let fires = collect.0.lock().unwrap();
        assert!(
            fires
                .iter()
                .any(|m| matches!(m, BusMessage::Cron(c) if c.trigger_id == id && c.fired_at < now))
        );
        registry.scheduler.stop().await.unwrap();
    }
}
