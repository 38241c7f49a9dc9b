//! Step runner: executes one step given its kind and the current context.
//!
//! `StepRunner` dispatches on the `StepConfig` variant. Each handler renders
//! templates from the execution context, calls out through the
//! [`Capabilities`] bundle where needed, and returns a `StepOutput`. The
//! step-level timeout is enforced here, around the whole dispatch.
//!
//! Loop and parallel steps are driven by the orchestrator, which owns the
//! step graph they fan out over.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use stepwise_types::config::EngineConfig;
use stepwise_types::workflow::{Condition, Escalation, StepConfig, StepDefinition};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::capability::{Capabilities, CapabilityError, HumanTaskRequest};
use super::context::ExecutionContext;
use super::expression::{ExpressionError, evaluate_condition};

/// Extra time granted past a wait step's own bound before the step timeout fires.
const WAIT_GRACE: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// StepOutput
// ---------------------------------------------------------------------------

/// Output from a step execution.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutput {
    /// Generic JSON output.
    Value(Value),
    /// Condition result selecting a branch target.
    Branch {
        /// Whether the condition held.
        result: bool,
        /// The selected target step ID.
        selected: String,
    },
}

impl StepOutput {
    /// Convert the step output to a JSON value for context storage.
    pub fn to_value(&self) -> Value {
        match self {
            StepOutput::Value(v) => v.clone(),
            StepOutput::Branch { result, selected } => json!({
                "result": result,
                "selected": selected,
            }),
        }
    }

    /// The branch result of a condition step.
    pub fn branch(&self) -> Option<bool> {
        match self {
            StepOutput::Branch { result, .. } => Some(*result),
            StepOutput::Value(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Typed failure of a single step attempt.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StepError {
    /// No handler knows this action type.
    #[error("unsupported action: {0}")]
    UnsupportedAction(String),

    /// The attempt exceeded its timeout.
    #[error("step timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    /// An external capability returned an error.
    #[error("external call failed: {0}")]
    ExternalCallFailed(String),

    /// The step needs a capability that was not configured.
    #[error("capability unavailable: {0}")]
    CapabilityUnavailable(&'static str),

    /// Template or input rendering failed.
    #[error("template error: {0}")]
    Template(String),

    /// Condition evaluation failed.
    #[error("expression error: {0}")]
    Expression(String),

    /// The execution was cancelled while the step was suspended.
    #[error("cancelled")]
    Cancelled,

    /// Sub-workflow depth exceeded.
    #[error("sub-workflow depth {depth} exceeds maximum {max}")]
    SubWorkflowDepthExceeded { depth: u32, max: u32 },

    /// The step's output could not be stored in the context.
    #[error("context error: {0}")]
    Context(String),

    /// A parallel step's branches did not succeed.
    #[error("parallel branches failed: {0}")]
    BranchFailed(String),

    /// A `retry` step failed on every allowed attempt.
    #[error("step '{step_id}' failed after {retries} retries: {last}")]
    RetryExhausted {
        step_id: String,
        retries: u32,
        last: String,
    },
}

impl StepError {
    /// Whether a later re-run could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StepError::Timeout { .. } | StepError::ExternalCallFailed(_) | StepError::RetryExhausted { .. }
        )
    }
}

impl From<ExpressionError> for StepError {
    fn from(e: ExpressionError) -> Self {
        StepError::Expression(e.to_string())
    }
}

impl From<CapabilityError> for StepError {
    fn from(e: CapabilityError) -> Self {
        match e {
            CapabilityError::Unsupported(what) => StepError::UnsupportedAction(what),
            CapabilityError::Failed(msg) => StepError::ExternalCallFailed(msg),
        }
    }
}

// ---------------------------------------------------------------------------
// StepInput / signals
// ---------------------------------------------------------------------------

/// Out-of-band notices a running step sends to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum StepSignal {
    /// The step is parked on an external event.
    Suspended {
        step_id: String,
        reason: String,
        deadline: Option<DateTime<Utc>>,
    },
    /// A human task was reassigned after its escalation delay.
    Escalated {
        step_id: String,
        task_id: String,
        escalate_to: Vec<String>,
    },
}

/// Everything an attempt needs besides its definition.
#[derive(Debug, Clone)]
pub struct StepInput {
    pub execution_id: Uuid,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Sub-workflow nesting depth of this execution (0 = top level).
    pub depth: u32,
    /// Workflow-level default step timeout.
    pub workflow_step_timeout_secs: Option<u64>,
    /// Live view of the execution context.
    pub context: watch::Receiver<Arc<ExecutionContext>>,
    pub signals: Option<mpsc::UnboundedSender<StepSignal>>,
    pub cancel: CancellationToken,
}

impl StepInput {
    /// Current context snapshot.
    pub fn snapshot(&self) -> Arc<ExecutionContext> {
        self.context.borrow().clone()
    }

    fn signal(&self, signal: StepSignal) {
        if let Some(tx) = &self.signals {
            let _ = tx.send(signal);
        }
    }
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

/// Executes individual workflow steps by dispatching to kind-specific handlers.
#[derive(Debug, Clone)]
pub struct StepRunner {
    capabilities: Capabilities,
    default_timeout: Duration,
    human_task_timeout: Duration,
    max_sub_workflow_depth: u32,
}

impl StepRunner {
    pub fn new(capabilities: Capabilities, config: &EngineConfig) -> Self {
        Self {
            capabilities,
            default_timeout: Duration::from_secs(config.default_step_timeout_secs),
            human_task_timeout: Duration::from_secs(config.human_task_timeout_secs),
            max_sub_workflow_depth: config.max_sub_workflow_depth,
        }
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Timeout for one attempt of `step`.
    ///
    /// An explicit step timeout always wins. Wait steps are otherwise bounded
    /// by their own duration/timeout, human tasks by the engine's human-task
    /// limit, and everything else by the workflow or engine default.
    pub fn timeout_for(&self, step: &StepDefinition, workflow_default_secs: Option<u64>) -> Duration {
        if let Some(secs) = step.timeout_secs {
            return Duration::from_secs(secs);
        }
        let default = workflow_default_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);
        match &step.config {
            StepConfig::HumanTask { .. } => self.human_task_timeout,
            StepConfig::Wait {
                duration_ms,
                timeout_ms,
                ..
            } => timeout_ms
                .or(*duration_ms)
                .map(|ms| Duration::from_millis(ms) + WAIT_GRACE)
                .unwrap_or(default),
            _ => default,
        }
    }

    /// Run one attempt of a step under its timeout.
    pub async fn execute(&self, step: &StepDefinition, input: &StepInput) -> Result<StepOutput, StepError> {
        let timeout = self.timeout_for(step, input.workflow_step_timeout_secs);
        match tokio::time::timeout(timeout, self.dispatch(step, input)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    execution_id = %input.execution_id,
                    step_id = %step.id,
                    attempt = input.attempt,
                    timeout_ms = timeout.as_millis() as u64,
                    "step timed out"
                );
                Err(StepError::Timeout {
                    after_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn dispatch(&self, step: &StepDefinition, input: &StepInput) -> Result<StepOutput, StepError> {
        match &step.config {
            StepConfig::Action {
                action_type,
                parameters,
            } => self.run_action(action_type, parameters, input).await,
            StepConfig::Condition {
                condition,
                true_step,
                false_step,
            } => {
                let ctx = input.snapshot();
                let result = evaluate_condition(condition, ctx.as_ref())?;
                let selected = if result { true_step } else { false_step };
                Ok(StepOutput::Branch {
                    result,
                    selected: selected.clone(),
                })
            }
            StepConfig::Wait {
                duration_ms,
                until,
                timeout_ms,
            } => {
                self.run_wait(&step.id, *duration_ms, until.as_ref(), *timeout_ms, input)
                    .await
            }
            StepConfig::Notification {
                recipients,
                message,
                metadata,
            } => self.run_notification(recipients, message, metadata, input).await,
            StepConfig::HumanTask {
                title,
                description,
                assignees,
                escalation,
            } => {
                self.run_human_task(
                    &step.id,
                    title,
                    description.as_deref(),
                    assignees,
                    escalation.as_ref(),
                    input,
                )
                .await
            }
            StepConfig::SubWorkflow { workflow_id, input: sub_input } => {
                self.run_sub_workflow(workflow_id, sub_input.as_ref(), input).await
            }
            StepConfig::Integration {
                provider,
                operation,
                parameters,
            } => {
                let gateway = self
                    .capabilities
                    .integrations
                    .as_ref()
                    .ok_or(StepError::CapabilityUnavailable("integration gateway"))?;
                let ctx = input.snapshot();
                let params = render_json(&ctx, &Value::Object(parameters.clone()));
                let output = gateway.invoke(provider, operation, params).await?;
                Ok(StepOutput::Value(output))
            }
            StepConfig::DataTransform {
                transform,
                parameters,
            } => {
                let transformer = self
                    .capabilities
                    .transformer
                    .as_ref()
                    .ok_or(StepError::CapabilityUnavailable("data transformer"))?;
                let ctx = input.snapshot();
                let params = render_json(&ctx, &Value::Object(parameters.clone()));
                let output = transformer
                    .transform(transform, params, ctx.to_expression_context())
                    .await?;
                Ok(StepOutput::Value(output))
            }
            StepConfig::Loop { .. } | StepConfig::Parallel { .. } => Err(StepError::UnsupportedAction(
                format!("{} steps are driven by the orchestrator", step.kind()),
            )),
        }
    }

    async fn run_action(
        &self,
        action_type: &str,
        parameters: &Map<String, Value>,
        input: &StepInput,
    ) -> Result<StepOutput, StepError> {
        let ctx = input.snapshot();

        // Execution input first, rendered parameters on top.
        let mut payload = match &ctx.trigger_payload {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        if let Value::Object(rendered) = render_json(&ctx, &Value::Object(parameters.clone())) {
            payload.extend(rendered);
        }

        if let Some(handler) = self.capabilities.actions.get(action_type) {
            let output = handler.invoke(action_type, Value::Object(payload)).await?;
            return Ok(StepOutput::Value(output));
        }

        if let Some(entity_type) = action_type.strip_prefix("create_") {
            let store = self
                .capabilities
                .entities
                .as_ref()
                .ok_or(StepError::CapabilityUnavailable("entity store"))?;
            let id = store.create_entity(entity_type, Value::Object(payload)).await?;
            return Ok(StepOutput::Value(json!({
                "id": id,
                "entity_type": entity_type,
            })));
        }

        Err(StepError::UnsupportedAction(action_type.to_string()))
    }

    async fn run_wait(
        &self,
        step_id: &str,
        duration_ms: Option<u64>,
        until: Option<&Condition>,
        timeout_ms: Option<u64>,
        input: &StepInput,
    ) -> Result<StepOutput, StepError> {
        let started = tokio::time::Instant::now();
        let waited = |reason: &str| {
            Ok(StepOutput::Value(json!({
                "waited_ms": started.elapsed().as_millis() as u64,
                "reason": reason,
            })))
        };

        if let Some(cond) = until {
            if evaluate_condition(cond, input.snapshot().as_ref())? {
                return waited("condition");
            }
        }

        let bound_ms = timeout_ms.or(duration_ms);
        input.signal(StepSignal::Suspended {
            step_id: step_id.to_string(),
            reason: match until {
                Some(_) => "waiting for condition".to_string(),
                None => "waiting for duration".to_string(),
            },
            deadline: bound_ms.map(|ms| Utc::now() + chrono::Duration::milliseconds(ms as i64)),
        });

        let duration = async {
            match duration_ms {
                Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
                None => std::future::pending::<()>().await,
            }
        };
        let deadline = async {
            match timeout_ms {
                Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
                None => std::future::pending::<()>().await,
            }
        };
        let condition = async {
            let Some(cond) = until else {
                return std::future::pending::<Result<(), StepError>>().await;
            };
            let mut rx = input.context.clone();
            loop {
                if rx.changed().await.is_err() {
                    // Context owner is gone; nothing can satisfy the condition.
                    return std::future::pending().await;
                }
                let ctx = rx.borrow_and_update().clone();
                if evaluate_condition(cond, ctx.as_ref())? {
                    return Ok(());
                }
            }
        };

        tokio::select! {
            _ = duration => waited("duration"),
            res = condition => res.and_then(|_| waited("condition")),
            _ = deadline => Err(StepError::Timeout { after_ms: timeout_ms.unwrap_or_default() }),
            _ = input.cancel.cancelled() => Err(StepError::Cancelled),
        }
    }

    async fn run_notification(
        &self,
        recipients: &[String],
        message: &str,
        metadata: &Map<String, Value>,
        input: &StepInput,
    ) -> Result<StepOutput, StepError> {
        let dispatch = self
            .capabilities
            .notifications
            .as_ref()
            .ok_or(StepError::CapabilityUnavailable("notification dispatch"))?;
        let ctx = input.snapshot();
        let recipients = self.resolve_people(recipients, &ctx).await?;
        let rendered = ctx.render_template(message);

        let mut deliveries = Vec::with_capacity(recipients.len());
        for recipient in &recipients {
            let id = dispatch
                .schedule_notification(recipient, &rendered, metadata)
                .await?;
            deliveries.push(id);
        }
        tracing::debug!(
            execution_id = %input.execution_id,
            sent = deliveries.len(),
            "notifications scheduled"
        );

        Ok(StepOutput::Value(json!({
            "sent": deliveries.len(),
            "deliveries": deliveries,
        })))
    }

    async fn run_human_task(
        &self,
        step_id: &str,
        title: &str,
        description: Option<&str>,
        assignees: &[String],
        escalation: Option<&Escalation>,
        input: &StepInput,
    ) -> Result<StepOutput, StepError> {
        let gateway = self
            .capabilities
            .human_tasks
            .as_ref()
            .ok_or(StepError::CapabilityUnavailable("human task gateway"))?;
        let ctx = input.snapshot();
        let assignees = self.resolve_people(assignees, &ctx).await?;
        let title = ctx.render_template(title);

        let task_id = gateway
            .create_task(HumanTaskRequest {
                execution_id: input.execution_id,
                step_id: step_id.to_string(),
                title: title.clone(),
                description: description.map(|d| ctx.render_template(d)),
                assignees: assignees.clone(),
            })
            .await?;

        let delay = escalation.map(|e| Duration::from_millis(e.delay_ms));
        let mut escalations = 0u32;
        let mut current = assignees;

        loop {
            input.signal(StepSignal::Suspended {
                step_id: step_id.to_string(),
                reason: format!("awaiting human task '{title}'"),
                deadline: delay.map(|d| {
                    Utc::now() + chrono::Duration::milliseconds(d.as_millis() as i64)
                }),
            });

            let escalate_after = async {
                match delay {
                    Some(d) => tokio::time::sleep(d).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                response = gateway.await_response(&task_id) => {
                    let response = response?;
                    return Ok(StepOutput::Value(json!({
                        "task_id": task_id,
                        "response": response,
                        "assignees": current,
                        "escalations": escalations,
                    })));
                }
                _ = escalate_after => {
                    let Some(escalation) = escalation else { continue };
                    let targets = self.resolve_people(&escalation.escalate_to, &ctx).await?;
                    gateway.reassign(&task_id, &targets).await?;
                    escalations += 1;
                    tracing::info!(
                        execution_id = %input.execution_id,
                        step_id,
                        task_id = %task_id,
                        escalations,
                        "human task escalated"
                    );
                    input.signal(StepSignal::Escalated {
                        step_id: step_id.to_string(),
                        task_id: task_id.clone(),
                        escalate_to: targets.clone(),
                    });
                    current = targets;
                }
                _ = input.cancel.cancelled() => return Err(StepError::Cancelled),
            }
        }
    }

    async fn run_sub_workflow(
        &self,
        workflow_id: &str,
        sub_input: Option<&Value>,
        input: &StepInput,
    ) -> Result<StepOutput, StepError> {
        let depth = input.depth + 1;
        if depth > self.max_sub_workflow_depth {
            return Err(StepError::SubWorkflowDepthExceeded {
                depth,
                max: self.max_sub_workflow_depth,
            });
        }
        let runner = self
            .capabilities
            .sub_workflows
            .as_ref()
            .ok_or(StepError::CapabilityUnavailable("sub-workflow runner"))?;
        let ctx = input.snapshot();
        let rendered = sub_input
            .map(|v| render_json(&ctx, v))
            .unwrap_or_else(|| ctx.trigger_payload.clone());
        let output = runner.run(workflow_id, rendered, depth).await?;
        Ok(StepOutput::Value(output))
    }

    /// Resolve people references through the stakeholder resolver when one
    /// is configured; otherwise render them as literal identities.
    async fn resolve_people(
        &self,
        references: &[String],
        ctx: &ExecutionContext,
    ) -> Result<Vec<String>, StepError> {
        let rendered: Vec<String> = references.iter().map(|r| ctx.render_template(r)).collect();
        match &self.capabilities.stakeholders {
            Some(resolver) => Ok(resolver.resolve(&rendered, &ctx.to_expression_context()).await?),
            None => Ok(rendered),
        }
    }
}

/// Render every string inside a JSON value as a template.
pub fn render_json(ctx: &ExecutionContext, value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(ctx.render_template(s)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_json(ctx, v)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_json(ctx, v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
