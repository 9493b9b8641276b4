//! Observability for dagflow: tracing subscriber setup and the engine event
//! log.

pub mod event_log;
pub mod tracing_setup;
