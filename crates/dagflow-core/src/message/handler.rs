//! Consumer trait for bus messages.

use dagflow_types::error::EngineError;
use dagflow_types::message::Envelope;

/// Handles one delivered envelope.
///
/// Delivery is at-least-once, so implementations must be idempotent.
/// Returning a retryable error schedules a redelivery; any other error
/// dead-letters the message.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(
        &self,
        envelope: &Envelope,
    ) -> impl std::future::Future<Output = Result<(), EngineError>> + Send;
}
