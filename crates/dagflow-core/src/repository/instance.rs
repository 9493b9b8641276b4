//! Workflow instance repository trait.

use chrono::{DateTime, Utc};
use dagflow_types::command::{InstQuery, Page, PageRequest};
use dagflow_types::error::RepositoryError;
use dagflow_types::instance::{InstStatus, InstTransition, NewWorkflowInst, WorkflowInst};

/// Repository trait for live workflow instances.
pub trait InstanceRepository: Send + Sync {
    /// Create a `Running` instance and assign its id.
    fn create_instance(
        &self,
        new: &NewWorkflowInst,
    ) -> impl std::future::Future<Output = Result<WorkflowInst, RepositoryError>> + Send;

    fn get_instance(
        &self,
        inst_id: i64,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowInst>, RepositoryError>> + Send;

    /// Persist the bookkeeping fields of an instance (context, execute path,
    /// scheduled nodes, current node, audit and restart fields, deadline).
    /// Never touches `status`. Scoped by `(inst_id, def_id)`; returns `false`
    /// when no row matched.
    fn save_instance(
        &self,
        inst: &WorkflowInst,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Compare-and-set the status from any of `from` to `to`.
    ///
    /// Returns `true` only for the writer that performed the transition.
    fn transition_instance(
        &self,
        inst_id: i64,
        def_id: i64,
        from: &[InstStatus],
        to: InstStatus,
        change: &InstTransition,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// List instances ordered by `inst_id DESC`.
    fn list_instances(
        &self,
        query: &InstQuery,
        page: PageRequest,
    ) -> impl std::future::Future<Output = Result<Page<WorkflowInst>, RepositoryError>> + Send;

    /// Terminal instances whose `ended_at` is before `before`, oldest first.
    fn list_archivable_instances(
        &self,
        before: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInst>, RepositoryError>> + Send;

    /// Live instances whose `timeout_at` has passed.
    fn list_expired_instances(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInst>, RepositoryError>> + Send;

    /// Hard-delete instances. Returns the number of rows removed.
    fn delete_instances(
        &self,
        inst_ids: &[i64],
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}
