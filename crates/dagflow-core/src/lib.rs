//! Workflow engine logic and repository trait definitions for dagflow.
//!
//! This crate defines the "ports" (repository, lock, and node handler traits)
//! that the infrastructure layer implements, plus the engine itself: decider,
//! updater, executor, node runner and poller, timeout checker, history
//! archiver, trigger registry, message bus, and the command service. It
//! depends only on `dagflow-types` -- never on `dagflow-infra` or any
//! database/IO crate.

pub mod event;
pub mod lock;
pub mod message;
pub mod repository;
pub mod service;
pub mod workflow;

#[cfg(test)]
pub(crate) mod test_support;
