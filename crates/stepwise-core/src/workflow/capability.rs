//! Capability interfaces the engine consumes but never implements.
//!
//! Steps that touch the outside world (creating entities, sending
//! notifications, assigning human tasks, calling integrations) go through
//! these traits. They return boxed futures so they stay object safe and can
//! be held as `Arc<dyn Trait>` inside [`Capabilities`].

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::{Map, Value};

/// Failure reported by an external capability.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CapabilityError {
    /// The capability does not handle this request.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The call was attempted and failed.
    #[error("{0}")]
    Failed(String),
}

pub type CapabilityResult<T> = Result<T, CapabilityError>;

/// Creates domain entities for `create_*` action steps.
pub trait EntityStore: Send + Sync {
    /// Create an entity and return its identifier.
    fn create_entity<'a>(
        &'a self,
        entity_type: &'a str,
        payload: Value,
    ) -> BoxFuture<'a, CapabilityResult<String>>;
}

/// Hands rendered notifications to a delivery transport.
pub trait NotificationDispatch: Send + Sync {
    /// Schedule delivery and return a delivery identifier.
    fn schedule_notification<'a>(
        &'a self,
        recipient: &'a str,
        message: &'a str,
        metadata: &'a Map<String, Value>,
    ) -> BoxFuture<'a, CapabilityResult<String>>;
}

/// Resolves recipient and assignee references (roles, teams, `{{owner}}`)
/// into concrete identities.
pub trait StakeholderResolver: Send + Sync {
    fn resolve<'a>(
        &'a self,
        references: &'a [String],
        context: &'a Value,
    ) -> BoxFuture<'a, CapabilityResult<Vec<String>>>;
}

/// A human task to be created for one or more assignees.
#[derive(Debug, Clone)]
pub struct HumanTaskRequest {
    pub execution_id: uuid::Uuid,
    pub step_id: String,
    pub title: String,
    pub description: Option<String>,
    pub assignees: Vec<String>,
}

/// Creates human tasks and reports their responses.
pub trait HumanTaskGateway: Send + Sync {
    /// Create the task and return its identifier.
    fn create_task(&self, request: HumanTaskRequest) -> BoxFuture<'_, CapabilityResult<String>>;

    /// Resolve once the task has been answered, yielding the response.
    fn await_response<'a>(&'a self, task_id: &'a str) -> BoxFuture<'a, CapabilityResult<Value>>;

    /// Move the task to new assignees.
    fn reassign<'a>(
        &'a self,
        task_id: &'a str,
        assignees: &'a [String],
    ) -> BoxFuture<'a, CapabilityResult<()>>;
}

/// Calls third-party integrations.
pub trait IntegrationGateway: Send + Sync {
    fn invoke<'a>(
        &'a self,
        provider: &'a str,
        operation: &'a str,
        parameters: Value,
    ) -> BoxFuture<'a, CapabilityResult<Value>>;
}

/// Runs another workflow to completion and returns its output.
pub trait SubWorkflowRunner: Send + Sync {
    fn run<'a>(
        &'a self,
        workflow_id: &'a str,
        input: Value,
        depth: u32,
    ) -> BoxFuture<'a, CapabilityResult<Value>>;
}

/// Reshapes data for `data_transform` steps.
pub trait DataTransformer: Send + Sync {
    fn transform<'a>(
        &'a self,
        transform: &'a str,
        parameters: Value,
        context: Value,
    ) -> BoxFuture<'a, CapabilityResult<Value>>;
}

/// Handles one named action type.
pub trait ActionHandler: Send + Sync {
    fn invoke<'a>(&'a self, action_type: &'a str, payload: Value) -> BoxFuture<'a, CapabilityResult<Value>>;
}

/// Bundle of the capabilities available to the step runner.
///
/// Every slot is optional; a step that needs a missing capability fails
/// with `StepError::CapabilityUnavailable`.
#[derive(Clone, Default)]
pub struct Capabilities {
    pub entities: Option<Arc<dyn EntityStore>>,
    pub notifications: Option<Arc<dyn NotificationDispatch>>,
    pub stakeholders: Option<Arc<dyn StakeholderResolver>>,
    pub human_tasks: Option<Arc<dyn HumanTaskGateway>>,
    pub integrations: Option<Arc<dyn IntegrationGateway>>,
    pub sub_workflows: Option<Arc<dyn SubWorkflowRunner>>,
    pub transformer: Option<Arc<dyn DataTransformer>>,
    pub actions: HashMap<String, Arc<dyn ActionHandler>>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entities(mut self, store: Arc<dyn EntityStore>) -> Self {
        self.entities = Some(store);
        self
    }

    pub fn with_notifications(mut self, dispatch: Arc<dyn NotificationDispatch>) -> Self {
        self.notifications = Some(dispatch);
        self
    }

    pub fn with_stakeholders(mut self, resolver: Arc<dyn StakeholderResolver>) -> Self {
        self.stakeholders = Some(resolver);
        self
    }

    pub fn with_human_tasks(mut self, gateway: Arc<dyn HumanTaskGateway>) -> Self {
        self.human_tasks = Some(gateway);
        self
    }

    pub fn with_integrations(mut self, gateway: Arc<dyn IntegrationGateway>) -> Self {
        self.integrations = Some(gateway);
        self
    }

    pub fn with_sub_workflows(mut self, runner: Arc<dyn SubWorkflowRunner>) -> Self {
        self.sub_workflows = Some(runner);
        self
    }

    pub fn with_transformer(mut self, transformer: Arc<dyn DataTransformer>) -> Self {
        self.transformer = Some(transformer);
        self
    }

    /// Register a handler for one action type.
    pub fn with_action(mut self, action_type: &str, handler: Arc<dyn ActionHandler>) -> Self {
        self.actions.insert(action_type.to_string(), handler);
        self
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut actions: Vec<&String> = self.actions.keys().collect();
        actions.sort();
        f.debug_struct("Capabilities")
            .field("entities", &self.entities.is_some())
            .field("notifications", &self.notifications.is_some())
            .field("stakeholders", &self.stakeholders.is_some())
            .field("human_tasks", &self.human_tasks.is_some())
            .field("integrations", &self.integrations.is_some())
            .field("sub_workflows", &self.sub_workflows.is_some())
            .field("transformer", &self.transformer.is_some())
            .field("actions", &actions)
            .finish()
    }
}
