//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (dagflow-infra) implements. The core crate never depends on any
//! specific storage technology.
//!
//! All updates are scoped by the owning identity (`inst_id` for nodes,
//! `def_id` for instances) so a stray id can never touch another tenant's
//! rows. Status changes are compare-and-set: they name the statuses they may
//! leave and report whether they won.

pub mod definition;
pub mod history;
pub mod instance;
pub mod memory;
pub mod node;
pub mod trigger;

pub use dagflow_types::command::{Page, PageRequest};

use self::definition::DefinitionRepository;
use self::history::HistoryRepository;
use self::instance::InstanceRepository;
use self::node::NodeRepository;
use self::trigger::TriggerRepository;

/// Everything the engine needs from persistence, as one bound.
pub trait WorkflowStore:
    DefinitionRepository
    + InstanceRepository
    + NodeRepository
    + TriggerRepository
    + HistoryRepository
    + Send
    + Sync
    + 'static
{
}

impl<T> WorkflowStore for T where
    T: DefinitionRepository
        + InstanceRepository
        + NodeRepository
        + TriggerRepository
        + HistoryRepository
        + Send
        + Sync
        + 'static
{
}
