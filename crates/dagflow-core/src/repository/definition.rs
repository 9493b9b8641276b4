//! Workflow definition repository trait.

use dagflow_types::command::{DefQuery, Page, PageRequest};
use dagflow_types::definition::{DefStatus, NewWorkflowDef, WorkflowDef};
use dagflow_types::error::RepositoryError;

/// Repository trait for versioned workflow definitions.
///
/// Versions are append-only: a stored version's DAG never changes, only its
/// metadata and status do.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait DefinitionRepository: Send + Sync {
    /// Store a new version. Allocates a `def_id` when `new.def_id` is `None`,
    /// otherwise appends `max(version) + 1` (`NotFound` if the id is unknown).
    fn create_definition(
        &self,
        new: &NewWorkflowDef,
    ) -> impl std::future::Future<Output = Result<WorkflowDef, RepositoryError>> + Send;

    /// Get one version, or the latest when `version` is `None`.
    fn get_definition(
        &self,
        def_id: i64,
        version: Option<i32>,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDef>, RepositoryError>> + Send;

    /// Update name/description of one version. Returns `false` if absent.
    fn update_definition_meta(
        &self,
        def_id: i64,
        version: i32,
        name: Option<&str>,
        description: Option<&str>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Set the status of one version. Returns `false` if absent.
    fn set_definition_status(
        &self,
        def_id: i64,
        version: i32,
        status: DefStatus,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// List definitions ordered by `(def_id DESC, version DESC)`.
    fn list_definitions(
        &self,
        query: &DefQuery,
        page: PageRequest,
    ) -> impl std::future::Future<Output = Result<Page<WorkflowDef>, RepositoryError>> + Send;
}
