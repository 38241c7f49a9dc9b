//! Workflow repository trait definition.
//!
//! A workflow is stored as one record: the definition together with its
//! triggers, steps, capped execution history and analytics. The
//! infrastructure layer (stepwise-infra) implements this trait in memory and
//! on SQLite.

use stepwise_types::error::RepositoryError;
use stepwise_types::workflow::{WorkflowDefinition, WorkflowOwner};
use uuid::Uuid;

/// Repository trait for workflow persistence.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    /// Upsert a workflow record (insert or replace by ID).
    fn save_workflow(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a workflow by its UUID.
    fn get_workflow(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// Get a workflow by name and owner.
    fn get_workflow_by_name(
        &self,
        name: &str,
        owner: &WorkflowOwner,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// List workflows, optionally filtered by owner, ordered by name.
    fn list_workflows(
        &self,
        owner: Option<&WorkflowOwner>,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    /// Delete a workflow by ID. Returns `true` if it existed.
    ///
    /// Callers are responsible for refusing deletion of workflows that
    /// still have execution history.
    fn delete_workflow(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
