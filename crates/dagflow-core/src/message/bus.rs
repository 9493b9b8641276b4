//! Partitioned message bus with redelivery and dead-lettering.
//!
//! Each channel owns `partitions` bounded `mpsc` queues. A message lands on
//! partition `partition_key mod partitions`, so messages for one instance are
//! consumed in publish order by a single worker. Receivers stay parked inside
//! the bus until a consumer subscribes; until then `process_pending` can
//! drain them inline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dagflow_types::config::BusConfig;
use dagflow_types::error::EngineError;
use dagflow_types::event::EngineEvent;
use dagflow_types::message::{BusMessage, Channel, Envelope};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::handler::MessageHandler;
use crate::event::EventBus;

/// Longest accepted publish delay.
pub const MAX_PUBLISH_DELAY: Duration = Duration::from_secs(10 * 24 * 60 * 60);

#[derive(Debug, Error)]
pub enum BusError {
    #[error("partition {partition} of channel {channel} is full")]
    ChannelFull { channel: Channel, partition: usize },

    #[error("channel {0} is closed")]
    Closed(Channel),

    #[error("channel {0} already has a consumer")]
    AlreadySubscribed(Channel),

    #[error("delay {0:?} exceeds the 10 day maximum")]
    DelayTooLong(Duration),
}

impl From<BusError> for EngineError {
    fn from(e: BusError) -> Self {
        match e {
            BusError::ChannelFull { .. } | BusError::Closed(_) => EngineError::retryable(e.to_string()),
            BusError::AlreadySubscribed(_) => EngineError::internal(e.to_string()),
            BusError::DelayTooLong(_) => EngineError::invalid(e.to_string()),
        }
    }
}

/// A message that exhausted its deliveries or failed permanently.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub envelope: Envelope,
    pub error: String,
}

struct BusInner {
    config: BusConfig,
    senders: HashMap<Channel, Vec<mpsc::Sender<Envelope>>>,
    /// Receivers not yet claimed by `subscribe`.
    parked: DashMap<Channel, Vec<mpsc::Receiver<Envelope>>>,
    dead_letters: DashMap<Uuid, DeadLetter>,
    events: EventBus,
}

/// Cheaply cloneable handle to the engine's message bus.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn new(config: BusConfig, events: EventBus) -> Self {
        let partitions = config.partitions.max(1);
        let capacity = config.channel_capacity.max(1);
        let mut senders = HashMap::new();
        let parked = DashMap::new();
        for channel in Channel::ALL {
            let (txs, rxs): (Vec<_>, Vec<_>) =
                (0..partitions).map(|_| mpsc::channel(capacity)).unzip();
            senders.insert(channel, txs);
            parked.insert(channel, rxs);
        }
        Self {
            inner: Arc::new(BusInner {
                config,
                senders,
                parked,
                dead_letters: DashMap::new(),
                events,
            }),
        }
    }

    /// Publish a message for immediate delivery. Returns the envelope id.
    pub fn publish(&self, message: BusMessage) -> Result<Uuid, EngineError> {
        let envelope = Envelope::new(message);
        let id = envelope.id;
        self.enqueue(envelope)?;
        Ok(id)
    }

    /// Publish a message that becomes visible after `delay`.
    pub fn publish_delayed(&self, message: BusMessage, delay: Duration) -> Result<Uuid, EngineError> {
        if delay > MAX_PUBLISH_DELAY {
            return Err(BusError::DelayTooLong(delay).into());
        }
        let envelope = Envelope::new(message);
        let id = envelope.id;
        self.enqueue_after(envelope, delay);
        Ok(id)
    }

    fn enqueue(&self, envelope: Envelope) -> Result<(), BusError> {
        let channel = envelope.channel;
        let (sender, partition) = self.partition_sender(&envelope)?;
        sender.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BusError::ChannelFull { channel, partition },
            mpsc::error::TrySendError::Closed(_) => BusError::Closed(channel),
        })
    }

    fn partition_sender(&self, envelope: &Envelope) -> Result<(&mpsc::Sender<Envelope>, usize), BusError> {
        let senders = self
            .inner
            .senders
            .get(&envelope.channel)
            .ok_or(BusError::Closed(envelope.channel))?;
        let partition = envelope.partition_key.rem_euclid(senders.len() as i64) as usize;
        Ok((&senders[partition], partition))
    }

    /// Deliver `envelope` after `delay`, waiting for room on a full
    /// partition. A closed partition dead-letters the message.
    fn enqueue_after(&self, envelope: Envelope, delay: Duration) {
        let bus = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let channel = envelope.channel;
            let sender = match bus.partition_sender(&envelope) {
                Ok((sender, _)) => sender.clone(),
                Err(e) => return bus.dead_letter(envelope, e.to_string()),
            };
            if let Err(mpsc::error::SendError(envelope)) = sender.send(envelope).await {
                bus.dead_letter(envelope, BusError::Closed(channel).to_string());
            }
        });
    }

    /// Start one worker per partition of `channel`, each feeding `handler`
    /// until `shutdown` is cancelled.
    pub fn subscribe<H: MessageHandler>(
        &self,
        channel: Channel,
        handler: Arc<H>,
        shutdown: CancellationToken,
    ) -> Result<Vec<JoinHandle<()>>, EngineError> {
        let (_, receivers) = self
            .inner
            .parked
            .remove(&channel)
            .ok_or(BusError::AlreadySubscribed(channel))?;

        let handles = receivers
            .into_iter()
            .enumerate()
            .map(|(partition, mut rx)| {
                let bus = self.clone();
                let handler = Arc::clone(&handler);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    debug!(%channel, partition, "bus worker started");
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            next = rx.recv() => match next {
                                Some(envelope) => bus.deliver(handler.as_ref(), envelope).await,
                                None => break,
                            },
                        }
                    }
                    debug!(%channel, partition, "bus worker stopped");
                })
            })
            .collect();
        Ok(handles)
    }

    /// Deliver everything queued on unsubscribed channels to `handler`
    /// inline, repeating until the queues are empty. Returns the number of
    /// deliveries made.
    pub async fn process_pending<H: MessageHandler>(&self, handler: &H) -> usize {
        let mut delivered = 0;
        loop {
            let batch = self.drain_parked();
            if batch.is_empty() {
                return delivered;
            }
            for envelope in batch {
                self.deliver(handler, envelope).await;
                delivered += 1;
            }
        }
    }

    fn drain_parked(&self) -> Vec<Envelope> {
        let mut batch = Vec::new();
        for channel in Channel::ALL {
            if let Some(mut receivers) = self.inner.parked.get_mut(&channel) {
                for rx in receivers.iter_mut() {
                    while let Ok(envelope) = rx.try_recv() {
                        batch.push(envelope);
                    }
                }
            }
        }
        batch
    }

    async fn deliver<H: MessageHandler + ?Sized>(&self, handler: &H, envelope: Envelope) {
        match handler.handle(&envelope).await {
            Ok(()) => {
                debug!(
                    envelope_id = %envelope.id,
                    channel = %envelope.channel,
                    attempt = envelope.attempt,
                    "message handled"
                );
            }
            Err(e) if e.is_retryable() && envelope.attempt < self.inner.config.max_deliveries => {
                let delay = self.backoff(envelope.attempt);
                warn!(
                    envelope_id = %envelope.id,
                    channel = %envelope.channel,
                    attempt = envelope.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "message failed, scheduling redelivery"
                );
                self.enqueue_after(envelope.redelivery(), delay);
            }
            Err(e) => self.dead_letter(envelope, e.to_string()),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ms = self
            .inner
            .config
            .base_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.inner.config.max_backoff_ms);
        Duration::from_millis(ms)
    }

    fn dead_letter(&self, envelope: Envelope, error: String) {
        warn!(
            envelope_id = %envelope.id,
            channel = %envelope.channel,
            attempts = envelope.attempt,
            error = %error,
            "message dead-lettered"
        );
        self.inner.events.publish(EngineEvent::MessageDeadLettered {
            envelope_id: envelope.id,
            channel: envelope.channel,
            attempts: envelope.attempt,
            error: error.clone(),
        });
        self.inner
            .dead_letters
            .insert(envelope.id, DeadLetter { envelope, error });
    }

    /// Dead letters recorded since startup, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        let mut letters: Vec<DeadLetter> =
            self.inner.dead_letters.iter().map(|d| d.clone()).collect();
        letters.sort_by_key(|d| d.envelope.published_at);
        letters
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("partitions", &self.inner.config.partitions)
            .field("parked_channels", &self.inner.parked.len())
            .field("dead_letters", &self.inner.dead_letters.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
