//! Shared domain types for dagflow.
//!
//! This crate contains the core domain types of the workflow engine:
//! definitions, instances, node instances, triggers, bus messages, engine
//! events, command DTOs, configuration, and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod command;
pub mod config;
pub mod definition;
pub mod error;
pub mod event;
pub mod instance;
pub mod message;
pub mod node;
pub mod trigger;
