//! Bus consumer routing each channel to its engine component.

use std::sync::Arc;

use dagflow_types::error::EngineError;
use dagflow_types::message::{BusMessage, Envelope};
use crate::lock::InstanceLocker;
use crate::message::MessageHandler;
use crate::repository::WorkflowStore;
use crate::service::workflow::WorkflowService;
use crate::workflow::executor::WorkflowExecutor;
use crate::workflow::trigger::TriggerRegistry;

/// Handles every channel of the message bus:
/// - drive events advance an instance through the executor
/// - external events and cron ticks are matched against triggers
/// - trigger fires are applied to their owner by the command service
pub struct EngineConsumer<S: WorkflowStore, L: InstanceLocker> {
    executor: Arc<WorkflowExecutor<S, L>>,
    triggers: Arc<TriggerRegistry<S>>,
    service: Arc<WorkflowService<S, L>>,
}

impl<S: WorkflowStore, L: InstanceLocker> EngineConsumer<S, L> {
    pub fn new(
        executor: Arc<WorkflowExecutor<S, L>>,
        triggers: Arc<TriggerRegistry<S>>,
        service: Arc<WorkflowService<S, L>>,
    ) -> Self {
        Self {
            executor,
            triggers,
            service,
        }
    }
}

impl<S: WorkflowStore, L: InstanceLocker> MessageHandler for EngineConsumer<S, L> {
    async fn handle(&self, envelope: &Envelope) -> Result<(), EngineError> {
        match &envelope.message {
            BusMessage::Drive(event) => self.executor.drive(event).await,
            BusMessage::External(event) => {
                self.triggers.on_external(event).await?;
                Ok(())
            }
            BusMessage::Cron(fire) => {
                self.triggers.on_cron(fire).await?;
                Ok(())
            }
            BusMessage::Trigger(fire) => self.service.apply_trigger_fire(fire).await,
        }
    }
}
