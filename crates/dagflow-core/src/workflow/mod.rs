//! Workflow engine core: DAG validation, decisions, node execution, and the
//! background sweepers.
//!
//! - `dag` -- definition validation (ref names, edges, cycles, node params)
//! - `expression` -- JEXL evaluator for edge conditions and trigger filters
//! - `decider` -- pure next-wavefront and verdict computation
//! - `updater` -- restart reconciliation, context merging, instance refresh
//! - `runner` -- node handler port, handler registry, node runner
//! - `handlers` -- built-in Noop, Wait, Delay and SubWorkflow handlers
//! - `launcher` -- instance creation
//! - `executor` -- per-instance drive loop and terminal transitions
//! - `poller` -- completes waiting nodes that can be polled
//! - `timeout` -- node and instance deadlines
//! - `archiver` -- moves ended instances into history
//! - `scheduler` -- cron scheduler for cron triggers
//! - `trigger` -- trigger registry (cron and event triggers)

pub mod archiver;
pub mod dag;
pub mod decider;
pub mod executor;
pub mod expression;
pub mod handlers;
pub mod launcher;
pub mod poller;
pub mod runner;
pub mod scheduler;
pub mod timeout;
pub mod trigger;
pub mod updater;
