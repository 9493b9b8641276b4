//! History storage trait.

use dagflow_types::error::RepositoryError;
use dagflow_types::instance::WorkflowInst;
use dagflow_types::node::NodeInst;

/// Repository trait for archived instances and node instances.
///
/// Inserts are duplicate tolerant: rows that already exist are skipped, not
/// reported as errors. The returned count is the number actually inserted.
pub trait HistoryRepository: Send + Sync {
    fn insert_instance_history(
        &self,
        insts: &[WorkflowInst],
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    fn insert_node_history(
        &self,
        nodes: &[NodeInst],
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    fn get_history_instance(
        &self,
        inst_id: i64,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowInst>, RepositoryError>> + Send;

    /// Archived node instances of an instance, ordered by `node_inst_id ASC`.
    fn list_history_nodes(
        &self,
        inst_id: i64,
    ) -> impl std::future::Future<Output = Result<Vec<NodeInst>, RepositoryError>> + Send;
}
