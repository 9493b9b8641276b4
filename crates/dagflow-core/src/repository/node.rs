//! Node instance repository trait.

use chrono::{DateTime, Utc};
use dagflow_types::error::RepositoryError;
use dagflow_types::node::{NewNodeInst, NodeInst, NodeStatus, NodeUpdate};

/// Repository trait for node instances.
///
/// Ids are assigned monotonically by the store; ordering by id is the
/// engine's happens-before relation.
pub trait NodeRepository: Send + Sync {
    fn create_node_inst(
        &self,
        new: &NewNodeInst,
    ) -> impl std::future::Future<Output = Result<NodeInst, RepositoryError>> + Send;

    fn get_node_inst(
        &self,
        node_inst_id: i64,
    ) -> impl std::future::Future<Output = Result<Option<NodeInst>, RepositoryError>> + Send;

    /// All node instances of an instance, ordered by `node_inst_id ASC`.
    fn list_node_insts(
        &self,
        inst_id: i64,
    ) -> impl std::future::Future<Output = Result<Vec<NodeInst>, RepositoryError>> + Send;

    /// Highest node instance id of an instance (0 when it has none).
    fn max_node_inst_id(
        &self,
        inst_id: i64,
    ) -> impl std::future::Future<Output = Result<i64, RepositoryError>> + Send;

    /// Compare-and-set the status from any of `from` to `to`, applying the
    /// non-`None` fields of `update`. Scoped by `(node_inst_id, inst_id)`.
    fn transition_node(
        &self,
        node_inst_id: i64,
        inst_id: i64,
        from: &[NodeStatus],
        to: NodeStatus,
        update: &NodeUpdate,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Set the hard deadline of a live node.
    fn set_node_timeout(
        &self,
        node_inst_id: i64,
        inst_id: i64,
        at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Set the near-timeout warning time of a live node and re-arm the alert.
    fn set_node_near_timeout(
        &self,
        node_inst_id: i64,
        inst_id: i64,
        at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Flip `near_timeout_alerted` from false to true. Only the first caller wins.
    fn mark_near_timeout_alerted(
        &self,
        node_inst_id: i64,
        inst_id: i64,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// `Waiting` nodes whose `next_poll_at` is due.
    fn list_pollable_nodes(
        &self,
        due: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<NodeInst>, RepositoryError>> + Send;

    fn set_next_poll(
        &self,
        node_inst_id: i64,
        inst_id: i64,
        at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Live nodes past their hard deadline, or past an un-alerted
    /// near-timeout.
    fn list_deadline_nodes(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<NodeInst>, RepositoryError>> + Send;

    /// Hard-delete all node instances of the given instances.
    fn delete_node_insts(
        &self,
        inst_ids: &[i64],
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}
