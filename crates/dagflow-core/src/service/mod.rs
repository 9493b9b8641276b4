//! Command service and engine assembly.
//!
//! - `workflow` -- `WorkflowService`, the command surface
//! - `consumer` -- `EngineConsumer`, the message bus handler
//! - `engine` -- `Engine`, wiring of every component over one store

pub mod consumer;
pub mod engine;
pub mod workflow;

pub use consumer::EngineConsumer;
pub use engine::Engine;
pub use workflow::WorkflowService;
