//! SQLite storage layer.
//!
//! `SqliteWorkflowStore` implements every repository port of `dagflow-core`
//! over one `DatabasePool`; `SqliteLocker` implements the instance lock as a
//! lease table. Each port's impl lives in its own module.

pub mod definition;
pub mod history;
pub mod instance;
pub mod lock;
pub mod node;
pub mod pool;
pub(crate) mod rows;
pub mod trigger;

pub use lock::SqliteLocker;
pub use pool::DatabasePool;

/// SQLite-backed `WorkflowStore`.
#[derive(Clone)]
pub struct SqliteWorkflowStore {
    pool: DatabasePool,
}

impl SqliteWorkflowStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }
}
