//! Engine assembly.
//!
//! Wires one store and one locker into the full component graph. The
//! server builds one `Engine` at startup; tests build one per case over the
//! in-memory adapters.

use std::sync::Arc;

use chrono::Utc;
use dagflow_types::config::EngineConfig;
use dagflow_types::error::EngineError;
use dagflow_types::message::Channel;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::event::EventBus;
use crate::lock::InstanceLocker;
use crate::message::MessageBus;
use crate::repository::WorkflowStore;
use crate::service::consumer::EngineConsumer;
use crate::service::workflow::WorkflowService;
use crate::workflow::archiver::HistoryArchiver;
use crate::workflow::executor::WorkflowExecutor;
use crate::workflow::handlers::{DelayHandler, NoopHandler, SubWorkflowHandler, WaitHandler};
use crate::workflow::launcher::InstanceLauncher;
use crate::workflow::poller::NodePoller;
use crate::workflow::runner::{NodeHandlerRegistry, NodeRunner};
use crate::workflow::scheduler::CronScheduler;
use crate::workflow::timeout::TimeoutChecker;
use crate::workflow::trigger::TriggerRegistry;
use crate::workflow::updater::WorkflowUpdater;

/// Every engine component, sharing one store, locker, and bus.
pub struct Engine<S: WorkflowStore, L: InstanceLocker> {
    pub config: EngineConfig,
    pub store: Arc<S>,
    pub locker: Arc<L>,
    pub events: EventBus,
    pub bus: MessageBus,
    pub scheduler: Arc<CronScheduler>,
    pub triggers: Arc<TriggerRegistry<S>>,
    pub launcher: Arc<InstanceLauncher<S>>,
    pub executor: Arc<WorkflowExecutor<S, L>>,
    pub poller: Arc<NodePoller<S>>,
    pub checker: Arc<TimeoutChecker<S, L>>,
    pub archiver: Arc<HistoryArchiver<S, L>>,
    pub service: Arc<WorkflowService<S, L>>,
    pub consumer: Arc<EngineConsumer<S, L>>,
}

impl<S: WorkflowStore, L: InstanceLocker> Engine<S, L> {
    /// Build the engine. The built-in node handlers (noop, wait, delay,
    /// sub-workflow) are registered first; `extra_handlers` may add more or
    /// replace them.
    pub fn new(
        config: EngineConfig,
        store: Arc<S>,
        locker: Arc<L>,
        extra_handlers: impl FnOnce(&mut NodeHandlerRegistry),
    ) -> Self {
        let events = EventBus::new(config.bus.channel_capacity);
        let bus = MessageBus::new(config.bus.clone(), events.clone());
        let scheduler = Arc::new(CronScheduler::new());
        let triggers = Arc::new(TriggerRegistry::new(
            Arc::clone(&store),
            bus.clone(),
            Arc::clone(&scheduler),
        ));
        let launcher = Arc::new(InstanceLauncher::new(
            Arc::clone(&store),
            bus.clone(),
            Arc::clone(&triggers),
        ));

        let mut registry = NodeHandlerRegistry::new();
        registry
            .register(NoopHandler)
            .register(WaitHandler)
            .register(DelayHandler)
            .register(SubWorkflowHandler::new(Arc::clone(&store), Arc::clone(&launcher)));
        extra_handlers(&mut registry);
        let handlers = Arc::new(registry);

        let updater = Arc::new(WorkflowUpdater::new(Arc::clone(&store)));
        let runner = Arc::new(NodeRunner::new(
            Arc::clone(&store),
            Arc::clone(&handlers),
            Arc::clone(&triggers),
            events.clone(),
        ));
        let executor = Arc::new(WorkflowExecutor::new(
            Arc::clone(&store),
            Arc::clone(&locker),
            config.lock.clone(),
            config.executor.clone(),
            bus.clone(),
            Arc::clone(&updater),
            runner,
            Arc::clone(&triggers),
        ));
        let poller = Arc::new(NodePoller::new(
            Arc::clone(&store),
            handlers,
            bus.clone(),
            config.poller.clone(),
        ));
        let checker = Arc::new(TimeoutChecker::new(
            Arc::clone(&store),
            Arc::clone(&executor),
            bus.clone(),
            config.timeout_checker.clone(),
        ));
        let archiver = Arc::new(HistoryArchiver::new(
            Arc::clone(&store),
            Arc::clone(&locker),
            config.lock.clone(),
            config.archiver.clone(),
        ));
        let service = Arc::new(WorkflowService::new(
            Arc::clone(&store),
            Arc::clone(&locker),
            config.lock.clone(),
            bus.clone(),
            updater,
            Arc::clone(&executor),
            Arc::clone(&launcher),
            Arc::clone(&triggers),
            Arc::clone(&poller),
            Arc::clone(&archiver),
        ));
        let consumer = Arc::new(EngineConsumer::new(
            Arc::clone(&executor),
            Arc::clone(&triggers),
            Arc::clone(&service),
        ));

        Self {
            config,
            store,
            locker,
            events,
            bus,
            scheduler,
            triggers,
            launcher,
            executor,
            poller,
            checker,
            archiver,
            service,
            consumer,
        }
    }

    /// Start the cron scheduler, restore persisted cron triggers, and attach
    /// the consumer to every bus channel.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<Vec<JoinHandle<()>>, EngineError> {
        self.scheduler.start().await?;
        let restored = self.triggers.restore(Utc::now()).await?;
        let mut handles = Vec::new();
        for channel in Channel::ALL {
            handles.extend(self.bus.subscribe(
                channel,
                Arc::clone(&self.consumer),
                shutdown.clone(),
            )?);
        }
        info!(restored, workers = handles.len(), "engine started");
        Ok(handles)
    }

    pub async fn stop(&self) -> Result<(), EngineError> {
        self.scheduler.stop().await?;
        info!("engine stopped");
        Ok(())
    }
}
