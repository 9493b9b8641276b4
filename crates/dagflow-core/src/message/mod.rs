//! Partitioned at-least-once message bus.
//!
//! - `bus` -- `MessageBus` with per-channel partitions, delayed publish,
//!   redelivery with exponential backoff, and dead-lettering
//! - `handler` -- `MessageHandler` trait implemented by bus consumers

pub mod bus;
pub mod handler;

pub use bus::{BusError, DeadLetter, MessageBus};
pub use handler::MessageHandler;
