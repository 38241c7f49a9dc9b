//! In-memory workflow repository.
//!
//! Backed by a `DashMap` keyed by workflow id. Used for embedded engines and
//! tests; nothing survives the process.

use dashmap::DashMap;
use stepwise_types::error::RepositoryError;
use stepwise_types::workflow::{WorkflowDefinition, WorkflowOwner};
use uuid::Uuid;

use super::workflow::WorkflowRepository;

/// `WorkflowRepository` holding every workflow in process memory.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowRepository {
    workflows: DashMap<Uuid, WorkflowDefinition>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    /// Snapshot of a stored workflow without going through the async port.
    pub fn get(&self, id: &Uuid) -> Option<WorkflowDefinition> {
        self.workflows.get(id).map(|w| w.value().clone())
    }
}

impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn save_workflow(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let clash = self
            .workflows
            .iter()
            .any(|w| w.id != def.id && w.name == def.name && w.owner == def.owner);
        if clash {
            return Err(RepositoryError::Conflict(format!(
                "workflow name '{}' already exists for this owner",
                def.name
            )));
        }
        self.workflows.insert(def.id, def.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.get(id))
    }

    async fn get_workflow_by_name(
        &self,
        name: &str,
        owner: &WorkflowOwner,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self
            .workflows
            .iter()
            .find(|w| w.name == name && &w.owner == owner)
            .map(|w| w.value().clone()))
    }

    async fn list_workflows(&self, owner: Option<&WorkflowOwner>) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let mut defs: Vec<WorkflowDefinition> = self
            .workflows
            .iter()
            .filter(|w| owner.is_none_or(|o| &w.owner == o))
            .map(|w| w.value().clone())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(defs)
    }

    async fn delete_workflow(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.workflows.remove(id).is_some())
    }
}
