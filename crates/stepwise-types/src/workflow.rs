//! Workflow domain types for Stepwise.
//!
//! Defines the canonical representation of a workflow: its triggers, its
//! steps, its configuration, and the bounded execution history embedded in
//! the definition. Executions own their step attempt records and a snapshot
//! of the execution context.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::TransitionError;

fn default_true() -> bool {
    true
}

fn default_version() -> u32 {
    1
}

// ---------------------------------------------------------------------------
// Workflow Definition (aggregate root)
// ---------------------------------------------------------------------------

/// The canonical workflow definition.
///
/// The durable unit the orchestrator operates on. Triggers, steps, and the
/// execution history are embedded by value and addressed by stable IDs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// UUIDv7 assigned on creation.
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Who owns this workflow.
    #[serde(default)]
    pub owner: WorkflowOwner,
    /// Free-form category used for grouping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Structural version, bumped whenever steps or triggers change.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Lifecycle status.
    #[serde(default)]
    pub status: WorkflowStatus,
    /// Execution configuration and defaults.
    #[serde(default)]
    pub config: WorkflowConfig,
    /// Trigger definitions.
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    /// Step definitions forming the step graph.
    pub steps: Vec<StepDefinition>,
    /// Bounded execution history, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub executions: Vec<Execution>,
    /// Aggregate counters over all executions (not just retained ones).
    #[serde(default)]
    pub analytics: WorkflowAnalytics,
    /// Extensible metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// Look up a step by ID.
    pub fn step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Look up a trigger by ID.
    pub fn trigger(&self, trigger_id: &str) -> Option<&Trigger> {
        self.triggers.iter().find(|t| t.id == trigger_id)
    }

    /// Look up a retained execution by ID.
    pub fn execution(&self, execution_id: &Uuid) -> Option<&Execution> {
        self.executions.iter().find(|e| e.id == *execution_id)
    }
}

/// Who owns a workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowOwner {
    /// Owned by a single user.
    User { user_id: String },
    /// Owned by a team.
    Team { team_id: String },
    /// System-owned workflow.
    #[default]
    System,
}

/// Lifecycle status of a workflow definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Active,
    Archived,
    Deprecated,
}

// ---------------------------------------------------------------------------
// Workflow configuration
// ---------------------------------------------------------------------------

/// Execution configuration for a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Overall shape of the workflow.
    #[serde(default, rename = "type")]
    pub workflow_type: WorkflowType,
    /// Whether non-manual triggers start executions automatically.
    #[serde(default = "default_true")]
    pub auto_start: bool,
    /// Retry defaults applied to steps that do not override them.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Workflow-level timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Default step timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_timeout_secs: Option<u64>,
    /// Concurrency ceiling and queue discipline.
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    /// What happens when a `retry` step runs out of attempts.
    #[serde(default)]
    pub on_retry_exhausted: ExhaustedPolicy,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            workflow_type: WorkflowType::default(),
            auto_start: true,
            retry: RetryPolicy::default(),
            timeout_secs: None,
            step_timeout_secs: None,
            concurrency: ConcurrencyConfig::default(),
            on_retry_exhausted: ExhaustedPolicy::default(),
        }
    }
}

/// Overall shape of a workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    #[default]
    Sequential,
    Parallel,
    Conditional,
    Loop,
    StateMachine,
}

/// Per-workflow concurrency ceiling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Maximum concurrently running executions (None = unlimited).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<u32>,
    /// Order in which queued executions are admitted.
    #[serde(default)]
    pub queue: QueueDiscipline,
}

/// Admission order for executions waiting on the concurrency ceiling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueDiscipline {
    #[default]
    Fifo,
    Lifo,
    /// Highest `context.priority` first, FIFO among equals.
    Priority,
}

/// Fallback applied once a step's retries are used up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedPolicy {
    #[default]
    Stop,
    Skip,
    Continue,
}

// ---------------------------------------------------------------------------
// Retry configuration
// ---------------------------------------------------------------------------

/// Workflow-level retry defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    #[serde(default = "default_max_retries", alias = "max_attempts")]
    pub max_retries: u32,
    /// Delay growth between retries.
    #[serde(default)]
    pub strategy: BackoffStrategy,
    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            strategy: BackoffStrategy::default(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// How the delay between retries grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    #[default]
    Exponential,
}

// ---------------------------------------------------------------------------
// Conditions (closed expression language)
// ---------------------------------------------------------------------------

/// A boolean condition over named context values.
///
/// Either a structured tree of comparisons or a JEXL expression. Nothing
/// here is ever executed as code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Not(Box<Condition>),
    Compare(FieldCondition),
    /// JEXL expression, e.g. `variables.amount > 100`.
    Expression(String),
}

/// A single `(field, operator, value)` comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCondition {
    /// Dot-separated path into the evaluated document.
    pub field: String,
    pub operator: ConditionOperator,
    /// Comparison operand (ignored by `exists`).
    #[serde(default)]
    pub value: Value,
}

/// Comparison operator for field conditions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    LessThan,
    Exists,
    /// Operator name not recognised; rejected at evaluation time.
    #[serde(untagged)]
    Unknown(String),
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

/// A condition or event source that starts executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    /// Unique within the workflow.
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub config: TriggerConfig,
    #[serde(default)]
    pub stats: TriggerStats,
}

/// Type-specific trigger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    /// Started explicitly by a user or API caller.
    Manual {},
    /// Cron schedule evaluated against scheduler ticks.
    Scheduled {
        /// Cron expression (5 or 6 fields) or human-readable schedule.
        cron: String,
        /// IANA timezone (default UTC).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_date: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end_date: Option<DateTime<Utc>>,
        /// Stop firing after this many executions.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_runs: Option<u32>,
    },
    /// Generic named application event.
    Event {
        event_type: String,
        #[serde(default)]
        conditions: Vec<FieldCondition>,
        /// Burst-collapsing window in milliseconds (0 = off).
        #[serde(default)]
        debounce_ms: u64,
    },
    /// Create/update/delete of an external entity.
    EntityChange {
        entity_type: String,
        /// Empty means any operation.
        #[serde(default)]
        operations: Vec<EntityOperation>,
        #[serde(default)]
        conditions: Vec<FieldCondition>,
        #[serde(default)]
        debounce_ms: u64,
    },
    /// Inbound webhook call.
    Webhook {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth: Option<WebhookAuth>,
        #[serde(default)]
        conditions: Vec<FieldCondition>,
    },
    /// Inbound email.
    Email {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mailbox: Option<String>,
        #[serde(default)]
        conditions: Vec<FieldCondition>,
    },
    /// Direct API invocation.
    ApiCall {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
        #[serde(default)]
        conditions: Vec<FieldCondition>,
    },
    /// File uploaded to storage.
    FileUpload {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        folder: Option<String>,
        /// Empty means any MIME type.
        #[serde(default)]
        mime_types: Vec<String>,
        #[serde(default)]
        conditions: Vec<FieldCondition>,
    },
    /// Event from a third-party integration.
    Integration {
        provider: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event: Option<String>,
        #[serde(default)]
        conditions: Vec<FieldCondition>,
    },
}

impl TriggerConfig {
    /// The discriminant of this configuration.
    pub fn trigger_type(&self) -> TriggerType {
        match self {
            TriggerConfig::Manual {} => TriggerType::Manual,
            TriggerConfig::Scheduled { .. } => TriggerType::Scheduled,
            TriggerConfig::Event { .. } => TriggerType::Event,
            TriggerConfig::EntityChange { .. } => TriggerType::EntityChange,
            TriggerConfig::Webhook { .. } => TriggerType::Webhook,
            TriggerConfig::Email { .. } => TriggerType::Email,
            TriggerConfig::ApiCall { .. } => TriggerType::ApiCall,
            TriggerConfig::FileUpload { .. } => TriggerType::FileUpload,
            TriggerConfig::Integration { .. } => TriggerType::Integration,
        }
    }
}

/// Trigger kind, used for provenance and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Scheduled,
    Event,
    EntityChange,
    Webhook,
    Email,
    ApiCall,
    FileUpload,
    Integration,
    /// Manual re-run of a failed execution.
    Rerun,
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TriggerType::Manual => "manual",
            TriggerType::Scheduled => "scheduled",
            TriggerType::Event => "event",
            TriggerType::EntityChange => "entity_change",
            TriggerType::Webhook => "webhook",
            TriggerType::Email => "email",
            TriggerType::ApiCall => "api_call",
            TriggerType::FileUpload => "file_upload",
            TriggerType::Integration => "integration",
            TriggerType::Rerun => "rerun",
        };
        f.write_str(s)
    }
}

/// Entity mutation kinds matched by entity-change triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityOperation {
    Create,
    Update,
    Delete,
}

/// Authentication configuration for webhook triggers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WebhookAuth {
    /// HMAC-SHA256 signature verification.
    HmacSha256 {
        /// Name of the secret holding the shared key.
        secret_name: String,
    },
    /// Bearer token verification.
    BearerToken { secret_name: String },
}

/// Running counters for a trigger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerStats {
    /// Stimuli that matched the trigger (including debounced ones).
    #[serde(default)]
    pub total_triggers: u64,
    /// Firings that started an execution.
    #[serde(default)]
    pub successful_triggers: u64,
    /// Evaluations that errored.
    #[serde(default)]
    pub failed_triggers: u64,
    /// Executions started by this trigger (bounded by `max_runs`).
    #[serde(default)]
    pub run_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_triggered_at: Option<DateTime<Utc>>,
    /// Tick instant of the last scheduled firing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// A single unit of work in the workflow's step graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within a workflow.
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Position for default sequential ordering.
    #[serde(default)]
    pub order: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Step IDs that must succeed before this step runs.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Successors activated when their guard passes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next_steps: Vec<NextStep>,
    #[serde(default)]
    pub error_handling: ErrorHandling,
    /// Per-attempt timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    pub config: StepConfig,
    #[serde(default)]
    pub stats: StepStats,
}

impl StepDefinition {
    pub fn kind(&self) -> StepKind {
        self.config.kind()
    }

    /// Display label: the name if set, otherwise the ID.
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// A guarded edge to a successor step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextStep {
    pub step_id: String,
    /// Guard; absent means always taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

/// What to do when a step fails.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorHandling {
    #[serde(default)]
    pub on_error: OnError,
    /// Step to route to on `escalate`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_step: Option<String>,
    /// Overrides `WorkflowConfig::retry.max_retries`.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "max_attempts")]
    pub max_retries: Option<u32>,
    /// Overrides `WorkflowConfig::retry.initial_delay_ms`.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "initial_delay_ms")]
    pub retry_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
}

/// Step failure policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    #[default]
    Stop,
    Continue,
    Retry,
    Skip,
    Escalate,
}

/// The kind of step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Action,
    Condition,
    Loop,
    Parallel,
    Wait,
    HumanTask,
    SubWorkflow,
    Integration,
    Notification,
    DataTransform,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepKind::Action => "action",
            StepKind::Condition => "condition",
            StepKind::Loop => "loop",
            StepKind::Parallel => "parallel",
            StepKind::Wait => "wait",
            StepKind::HumanTask => "human_task",
            StepKind::SubWorkflow => "sub_workflow",
            StepKind::Integration => "integration",
            StepKind::Notification => "notification",
            StepKind::DataTransform => "data_transform",
        };
        f.write_str(s)
    }
}

/// Step-specific configuration payload.
///
/// Internally tagged by `type`:
/// ```yaml
/// config:
///   type: action
///   action_type: create_task
///   parameters: { title: "Follow up" }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    /// Invoke a named external capability.
    Action {
        action_type: String,
        #[serde(default)]
        parameters: Map<String, Value>,
    },
    /// Branch on a condition over the context.
    Condition {
        condition: Condition,
        true_step: String,
        false_step: String,
    },
    /// Run `body` once per item or while `condition` holds.
    Loop {
        /// Context path of an array to iterate.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        items: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        condition: Option<Condition>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<u32>,
        body: Vec<String>,
    },
    /// Release branch steps concurrently.
    Parallel {
        branches: Vec<String>,
        #[serde(default = "default_true")]
        wait_for_all: bool,
    },
    /// Pause this branch for a duration or until a condition holds.
    Wait {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        until: Option<Condition>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    /// Assign a task to people and wait for their response.
    HumanTask {
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        assignees: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        escalation: Option<Escalation>,
    },
    /// Run another workflow.
    SubWorkflow {
        workflow_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
    },
    /// Call a third-party integration.
    Integration {
        provider: String,
        operation: String,
        #[serde(default)]
        parameters: Map<String, Value>,
    },
    /// Render and dispatch a notification.
    Notification {
        recipients: Vec<String>,
        message: String,
        #[serde(default)]
        metadata: Map<String, Value>,
    },
    /// Reshape data via an external transformer.
    DataTransform {
        transform: String,
        #[serde(default)]
        parameters: Map<String, Value>,
    },
}

impl StepConfig {
    pub fn kind(&self) -> StepKind {
        match self {
            StepConfig::Action { .. } => StepKind::Action,
            StepConfig::Condition { .. } => StepKind::Condition,
            StepConfig::Loop { .. } => StepKind::Loop,
            StepConfig::Parallel { .. } => StepKind::Parallel,
            StepConfig::Wait { .. } => StepKind::Wait,
            StepConfig::HumanTask { .. } => StepKind::HumanTask,
            StepConfig::SubWorkflow { .. } => StepKind::SubWorkflow,
            StepConfig::Integration { .. } => StepKind::Integration,
            StepConfig::Notification { .. } => StepKind::Notification,
            StepConfig::DataTransform { .. } => StepKind::DataTransform,
        }
    }
}

/// Human-task escalation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    /// How long to wait for a response before escalating.
    pub delay_ms: u64,
    /// Who the task is reassigned to.
    pub escalate_to: Vec<String>,
}

/// Running counters for a step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepStats {
    #[serde(default)]
    pub total_executions: u64,
    #[serde(default)]
    pub successful_executions: u64,
    #[serde(default)]
    pub failed_executions: u64,
    #[serde(default)]
    pub skipped_executions: u64,
    #[serde(default)]
    pub average_duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_executed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Execution status
// ---------------------------------------------------------------------------

/// Overall status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Paused)
                | (Paused, Running)
                | (Paused, Cancelled)
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Status of a single step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepExecutionStatus::Completed
                | StepExecutionStatus::Failed
                | StepExecutionStatus::Skipped
        )
    }
}

// ---------------------------------------------------------------------------
// Execution records
// ---------------------------------------------------------------------------

/// One run of a workflow from trigger to terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    /// UUIDv7 execution ID.
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// Definition version the execution ran against.
    pub workflow_version: u32,
    /// What started this execution.
    pub trigger: TriggerProvenance,
    pub status: ExecutionStatus,
    /// When the execution was admitted or queued.
    pub queued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Initial input built by the trigger.
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// One record per step attempt, in creation order.
    #[serde(default)]
    pub step_executions: Vec<StepExecution>,
    /// Snapshot of the execution context.
    #[serde(default)]
    pub context: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    /// Steps currently parked on an external event.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suspensions: Vec<Suspension>,
    /// The failed execution this one re-runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<Uuid>,
}

impl Execution {
    /// Create a pending execution.
    pub fn new(
        workflow_id: Uuid,
        workflow_version: u32,
        trigger: TriggerProvenance,
        input: Value,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            workflow_version,
            trigger,
            status: ExecutionStatus::Pending,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            input,
            output: None,
            step_executions: Vec::new(),
            context: Value::Null,
            error: None,
            suspensions: Vec::new(),
            resumed_from: None,
        }
    }

    /// Move to `next`, refusing any transition out of a terminal state.
    pub fn transition(&mut self, next: ExecutionStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        if next == ExecutionStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
            let started = self.started_at.unwrap_or(self.queued_at);
            self.duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
            self.suspensions.clear();
        }
        self.status = next;
        Ok(())
    }

    /// Attempt records for one step, in order.
    pub fn attempts_for<'a>(&'a self, step_id: &'a str) -> impl Iterator<Item = &'a StepExecution> {
        self.step_executions.iter().filter(move |s| s.step_id == step_id)
    }
}

/// What started an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerProvenance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<String>,
    pub trigger_type: TriggerType,
    pub fired_at: DateTime<Utc>,
    /// External event ID, when the stimulus carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

impl TriggerProvenance {
    pub fn manual() -> Self {
        Self {
            trigger_id: None,
            trigger_type: TriggerType::Manual,
            fired_at: Utc::now(),
            event_id: None,
        }
    }
}

/// Terminal error of a failed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub message: String,
    /// Step the failure originated from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Whether a manual re-run from the failed step is permitted.
    pub recoverable: bool,
}

/// A step waiting on something outside the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suspension {
    pub step_id: String,
    pub reason: String,
    pub since: DateTime<Utc>,
    /// Escalation or timeout deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

/// One attempt of one step within an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    /// UUIDv7 attempt ID.
    pub id: Uuid,
    pub step_id: String,
    pub status: StepExecutionStatus,
    /// Attempt number (1-based).
    pub attempt: u32,
    /// Retries preceding this attempt.
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
}

impl StepExecution {
    /// Start a new running attempt.
    pub fn start(step_id: &str, attempt: u32, input: Option<Value>) -> Self {
        Self {
            id: Uuid::now_v7(),
            step_id: step_id.to_string(),
            status: StepExecutionStatus::Running,
            attempt,
            retry_count: attempt.saturating_sub(1),
            started_at: Some(Utc::now()),
            completed_at: None,
            duration_ms: None,
            input,
            output: None,
            error: None,
            logs: Vec::new(),
        }
    }

    /// Record for a step that was never attempted.
    pub fn skipped(step_id: &str, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            step_id: step_id.to_string(),
            status: StepExecutionStatus::Skipped,
            attempt: 0,
            retry_count: 0,
            started_at: None,
            completed_at: Some(now),
            duration_ms: Some(0),
            input: None,
            output: None,
            error: None,
            logs: vec![reason.into()],
        }
    }

    /// Close the attempt with a terminal status.
    pub fn finish(&mut self, status: StepExecutionStatus) {
        let now = Utc::now();
        self.status = status;
        self.completed_at = Some(now);
        if let Some(started) = self.started_at {
            self.duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
        }
    }
}

// ---------------------------------------------------------------------------
// Analytics
// ---------------------------------------------------------------------------

/// Aggregate counters across every execution of a workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowAnalytics {
    #[serde(default)]
    pub total_executions: u64,
    #[serde(default)]
    pub successful_executions: u64,
    #[serde(default)]
    pub failed_executions: u64,
    #[serde(default)]
    pub cancelled_executions: u64,
    /// Running mean over terminal executions.
    #[serde(default)]
    pub average_duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_executed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SAMPLE_YAML: &str = r#"
name: invoice-approval
owner:
  type: user
  user_id: u-42
category: finance
config:
  type: sequential
  concurrency:
    max_concurrent: 2
    queue: priority
  retry:
    max_attempts: 2
    strategy: exponential
    initial_delay_ms: 1000
    max_delay_ms: 5000
triggers:
  - id: nightly
    config:
      type: scheduled
      cron: "0 2 * * *"
      timezone: Europe/Berlin
      max_runs: 10
  - id: on-invoice
    config:
      type: entity_change
      entity_type: invoice
      operations: [create]
      conditions:
        - field: amount
          operator: greater_than
          value: 1000
        - field: currency
          operator: matches_regex
          value: EUR
      debounce_ms: 500
steps:
  - id: check
    order: 1
    config:
      type: condition
      condition:
        compare:
          field: variables.amount
          operator: greater_than
          value: 5000
      true_step: review
      false_step: approve
  - id: review
    order: 2
    config:
      type: human_task
      title: "Review invoice {{invoice_id}}"
      assignees: [finance-lead]
      escalation:
        delay_ms: 3600000
        escalate_to: [cfo]
  - id: approve
    order: 3
    error_handling:
      on_error: retry
      max_attempts: 2
    config:
      type: action
      action_type: approve_invoice
      parameters:
        mode: auto
"#;

    #[test]
    fn test_workflow_definition_yaml_parse() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(SAMPLE_YAML).unwrap();
        assert_eq!(def.name, "invoice-approval");
        assert_eq!(def.version, 1);
        assert_eq!(def.status, WorkflowStatus::Active);
        assert_eq!(def.config.workflow_type, WorkflowType::Sequential);
        assert!(def.config.auto_start);
        assert_eq!(def.config.retry.max_retries, 2);
        assert_eq!(def.config.concurrency.max_concurrent, Some(2));
        assert_eq!(def.config.concurrency.queue, QueueDiscipline::Priority);
        assert_eq!(def.triggers.len(), 2);
        assert_eq!(def.steps.len(), 3);
        assert_eq!(def.steps[0].kind(), StepKind::Condition);
        assert_eq!(def.steps[1].kind(), StepKind::HumanTask);
        assert_eq!(def.steps[2].error_handling.on_error, OnError::Retry);
        assert_eq!(def.steps[2].error_handling.max_retries, Some(2));
        assert!(def.steps.iter().all(|s| s.enabled));
    }

    #[test]
    fn test_unknown_operator_is_preserved() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(SAMPLE_YAML).unwrap();
        let trigger = def.trigger("on-invoice").unwrap();
        match &trigger.config {
            TriggerConfig::EntityChange {
                conditions,
                debounce_ms,
                operations,
                ..
            } => {
                assert_eq!(*debounce_ms, 500);
                assert_eq!(operations, &vec![EntityOperation::Create]);
                assert_eq!(conditions[0].operator, ConditionOperator::GreaterThan);
                assert_eq!(
                    conditions[1].operator,
                    ConditionOperator::Unknown("matches_regex".to_string())
                );
            }
            other => panic!("expected entity_change trigger, got {other:?}"),
        }
    }

    #[test]
    fn test_parallel_wait_for_all_defaults_true() {
        let step: StepDefinition = serde_json::from_value(json!({
            "id": "fan-out",
            "config": { "type": "parallel", "branches": ["x", "y"] }
        }))
        .unwrap();
        match step.config {
            StepConfig::Parallel { wait_for_all, .. } => assert!(wait_for_all),
            _ => panic!("expected parallel"),
        }
        assert_eq!(step.label(), "fan-out");
    }

    #[test]
    fn test_condition_tree_json_shape() {
        let cond: Condition = serde_json::from_value(json!({
            "all": [
                { "compare": { "field": "status", "operator": "equals", "value": "open" } },
                { "not": { "expression": "variables.archived" } }
            ]
        }))
        .unwrap();
        match cond {
            Condition::All(children) => assert_eq!(children.len(), 2),
            _ => panic!("expected all"),
        }
    }

    #[test]
    fn test_execution_status_terminal_monotonic() {
        use ExecutionStatus::*;
        for terminal in [Completed, Failed, Cancelled] {
            for next in [Pending, Running, Paused, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn test_execution_transition_sets_timing() {
        let mut exec = Execution::new(Uuid::now_v7(), 1, TriggerProvenance::manual(), json!({}));
        exec.transition(ExecutionStatus::Running).unwrap();
        assert!(exec.started_at.is_some());
        exec.transition(ExecutionStatus::Completed).unwrap();
        assert!(exec.completed_at.is_some());
        assert!(exec.duration_ms.is_some());

        let err = exec.transition(ExecutionStatus::Running).unwrap_err();
        assert_eq!(err.from, ExecutionStatus::Completed);
    }

    #[test]
    fn test_step_execution_retry_count_tracks_attempt() {
        let mut attempt = StepExecution::start("a", 3, None);
        assert_eq!(attempt.retry_count, 2);
        attempt.finish(StepExecutionStatus::Failed);
        assert!(attempt.status.is_terminal());
        assert!(attempt.completed_at.is_some());
    }

    #[test]
    fn test_trigger_type_display() {
        assert_eq!(TriggerType::EntityChange.to_string(), "entity_change");
        assert_eq!(StepKind::HumanTask.to_string(), "human_task");
    }
}
