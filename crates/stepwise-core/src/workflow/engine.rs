//! Workflow engine facade.
//!
//! `WorkflowEngine` owns the registered definitions, routes stimuli through
//! the trigger evaluator, admits executions through each workflow's queue,
//! drives them with the [`Orchestrator`], and folds the results into the
//! workflow's history before persisting the record.
//!
//! Definitions live in a `DashMap`. Trigger statistics, history, and
//! analytics are only mutated while holding the entry's write guard, and no
//! guard is ever held across an `.await`.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::one::Ref;
use futures_util::future::BoxFuture;
use serde_json::Value;
use stepwise_types::config::EngineConfig;
use stepwise_types::error::RepositoryError;
use stepwise_types::event::WorkflowEvent;
use stepwise_types::workflow::{
    Execution, ExecutionStatus, StepDefinition, Trigger, TriggerConfig, TriggerProvenance,
    TriggerType, WorkflowDefinition, WorkflowStatus,
};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::workflow::WorkflowRepository;

use super::capability::{Capabilities, CapabilityError, CapabilityResult, SubWorkflowRunner};
use super::context::ExecutionContext;
use super::dag::StepGraph;
use super::definition::{
    WorkflowError, ensure_deletable, replace_steps, replace_triggers, set_status, validate_definition,
};
use super::history;
use super::orchestrator::{ExecutionControl, Orchestrator, RunRequest};
use super::queue::{Admission, ExecutionQueue, QueuePermit};
use super::step_runner::StepRunner;
use super::trigger::{Stimulus, TriggerError, TriggerEvaluator, TriggerManager, TriggerOutcome};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("workflow '{0}' is not active")]
    Inactive(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("execution {0} cannot be re-run: {1}")]
    NotRecoverable(Uuid, String),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Trigger(#[from] TriggerError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("execution task failed: {0}")]
    TaskFailed(String),
}

// ---------------------------------------------------------------------------
// Public handles
// ---------------------------------------------------------------------------

/// A spawned execution.
#[derive(Debug)]
pub struct ExecutionHandle {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    join: JoinHandle<Execution>,
}

impl ExecutionHandle {
    /// Wait for the execution to reach a terminal status.
    pub async fn wait(self) -> Result<Execution, EngineError> {
        self.join
            .await
            .map_err(|e| EngineError::TaskFailed(e.to_string()))
    }
}

/// A trigger that failed to evaluate against a stimulus.
#[derive(Debug)]
pub struct TriggerFailure {
    pub workflow_id: Uuid,
    pub trigger_id: String,
    pub error: TriggerError,
}

/// What one stimulus did across all registered workflows.
#[derive(Debug, Default)]
pub struct StimulusReport {
    pub started: Vec<ExecutionHandle>,
    /// Matches held back by a debounce window.
    pub debounced: usize,
    pub errors: Vec<TriggerFailure>,
}

// ---------------------------------------------------------------------------
// Registered workflows
// ---------------------------------------------------------------------------

/// Structure used to run executions: the definition without its history,
/// plus the resolved step graph.
#[derive(Debug)]
struct Plan {
    def: WorkflowDefinition,
    graph: StepGraph,
}

#[derive(Debug)]
struct Registered {
    def: WorkflowDefinition,
    plan: Arc<Plan>,
}

impl Registered {
    fn new(def: WorkflowDefinition) -> Result<Self, EngineError> {
        validate_definition(&def)?;
        let plan = Arc::new(build_plan(&def)?);
        Ok(Self { def, plan })
    }

    /// Rebuild the plan after a structural change.
    fn refresh(&mut self) -> Result<(), EngineError> {
        self.plan = Arc::new(build_plan(&self.def)?);
        Ok(())
    }

    fn ensure_active(&self) -> Result<(), EngineError> {
        if self.def.status == WorkflowStatus::Active {
            Ok(())
        } else {
            Err(EngineError::Inactive(self.def.name.clone()))
        }
    }
}

fn build_plan(def: &WorkflowDefinition) -> Result<Plan, EngineError> {
    let mut structure = def.clone();
    structure.executions.clear();
    let graph = StepGraph::build(&structure)?;
    Ok(Plan {
        def: structure,
        graph,
    })
}

/// State carried into a re-run.
struct Resume {
    from: Uuid,
    context: ExecutionContext,
    completed: HashSet<String>,
}

/// An execution ready to be admitted.
struct Prepared {
    plan: Arc<Plan>,
    execution: Execution,
    context: ExecutionContext,
    depth: u32,
    completed: HashSet<String>,
    control: ExecutionControl,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Entry point for registering workflows and running executions.
///
/// Generic over `R: WorkflowRepository` for storage flexibility.
pub struct WorkflowEngine<R: WorkflowRepository> {
    repo: Arc<R>,
    config: EngineConfig,
    events: EventBus,
    orchestrator: Orchestrator,
    workflows: DashMap<Uuid, Registered>,
    queues: DashMap<Uuid, ExecutionQueue>,
    /// Controls of executions that are queued or running.
    controls: DashMap<Uuid, ExecutionControl>,
    evaluator: TriggerEvaluator,
    triggers: TriggerManager,
}

impl<R: WorkflowRepository + 'static> WorkflowEngine<R> {
    /// Build an engine. When `capabilities` has no sub-workflow runner the
    /// engine runs sub-workflows itself.
    pub fn new(repo: Arc<R>, capabilities: Capabilities, config: EngineConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let mut capabilities = capabilities;
            if capabilities.sub_workflows.is_none() {
                capabilities.sub_workflows = Some(Arc::new(EngineSubWorkflows {
                    engine: weak.clone(),
                }));
            }
            let events = EventBus::new(config.event_bus_capacity);
            let runner = Arc::new(StepRunner::new(capabilities, &config));
            let orchestrator = Orchestrator::new(
                runner,
                events.clone(),
                Duration::from_secs(config.default_workflow_timeout_secs),
            );
            Self {
                repo,
                config,
                events,
                orchestrator,
                workflows: DashMap::new(),
                queues: DashMap::new(),
                controls: DashMap::new(),
                evaluator: TriggerEvaluator::new(),
                triggers: TriggerManager::new(),
            }
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Webhook routes and schedules of the registered workflows.
    pub fn trigger_manager(&self) -> &TriggerManager {
        &self.triggers
    }

    // -----------------------------------------------------------------------
    // Registration and lifecycle
    // -----------------------------------------------------------------------

    /// Register every workflow in the repository. Invalid records are
    /// logged and skipped.
    pub async fn load_all(&self) -> Result<usize, EngineError> {
        let defs = self.repo.list_workflows(None).await?;
        let mut loaded = 0;
        for def in defs {
            let (id, name) = (def.id, def.name.clone());
            match Registered::new(def).and_then(|r| self.install(r)) {
                Ok(_) => loaded += 1,
                Err(e) => tracing::warn!(workflow_id = %id, workflow = %name, error = %e, "skipping invalid workflow"),
            }
        }
        tracing::info!(loaded, "workflows loaded");
        Ok(loaded)
    }

    /// Validate, persist, and activate a workflow definition.
    pub async fn register(&self, def: WorkflowDefinition) -> Result<Uuid, EngineError> {
        let registered = Registered::new(def)?;
        self.repo.save_workflow(&registered.def).await?;
        self.install(registered)
    }

    fn install(&self, registered: Registered) -> Result<Uuid, EngineError> {
        let id = registered.def.id;
        self.triggers
            .register_workflow(id, &registered.def.name, &registered.def.triggers)?;
        let concurrency = registered.def.config.concurrency.clone();
        self.queues
            .entry(id)
            .and_modify(|q| q.reconfigure(concurrency.max_concurrent, concurrency.queue))
            .or_insert_with(|| ExecutionQueue::new(concurrency.max_concurrent, concurrency.queue));
        tracing::info!(
            workflow_id = %id,
            workflow = %registered.def.name,
            version = registered.def.version,
            steps = registered.def.steps.len(),
            "workflow registered"
        );
        self.workflows.insert(id, registered);
        Ok(id)
    }

    pub fn get(&self, workflow_id: &Uuid) -> Option<WorkflowDefinition> {
        self.workflows.get(workflow_id).map(|r| r.def.clone())
    }

    pub fn find_by_name(&self, name: &str) -> Option<WorkflowDefinition> {
        self.workflows
            .iter()
            .find(|r| r.def.name == name)
            .map(|r| r.def.clone())
    }

    /// All registered workflows, ordered by name.
    pub fn list(&self) -> Vec<WorkflowDefinition> {
        let mut all: Vec<_> = self.workflows.iter().map(|r| r.def.clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Replace a workflow's steps. Returns the new version.
    pub async fn update_steps(&self, workflow_id: Uuid, steps: Vec<StepDefinition>) -> Result<u32, EngineError> {
        let version = {
            let mut entry = self.entry_mut(workflow_id)?;
            replace_steps(&mut entry.def, steps)?;
            entry.refresh()?;
            entry.def.version
        };
        self.persist_strict(workflow_id).await?;
        Ok(version)
    }

    /// Replace a workflow's triggers. Returns the new version.
    pub async fn update_triggers(&self, workflow_id: Uuid, triggers: Vec<Trigger>) -> Result<u32, EngineError> {
        let version = {
            let mut entry = self.entry_mut(workflow_id)?;
            replace_triggers(&mut entry.def, triggers)?;
            self.triggers
                .register_workflow(workflow_id, &entry.def.name, &entry.def.triggers)?;
            entry.refresh()?;
            entry.def.version
        };
        self.evaluator.debouncer().discard_workflow(workflow_id);
        self.persist_strict(workflow_id).await?;
        Ok(version)
    }

    /// Archive or deprecate a workflow. Inactive workflows keep their
    /// history but no longer start executions.
    pub async fn set_status(&self, workflow_id: Uuid, status: WorkflowStatus) -> Result<(), EngineError> {
        {
            let mut entry = self.entry_mut(workflow_id)?;
            set_status(&mut entry.def, status);
        }
        if status != WorkflowStatus::Active {
            self.evaluator.debouncer().discard_workflow(workflow_id);
        }
        self.persist_strict(workflow_id).await
    }

    /// Delete a workflow that has never executed.
    pub async fn delete(&self, workflow_id: Uuid) -> Result<(), EngineError> {
        {
            let entry = self.entry(workflow_id)?;
            ensure_deletable(&entry.def)?;
        }
        self.repo.delete_workflow(&workflow_id).await?;
        self.workflows.remove(&workflow_id);
        self.queues.remove(&workflow_id);
        self.triggers.unregister_workflow(workflow_id);
        self.evaluator.debouncer().discard_workflow(workflow_id);
        tracing::info!(%workflow_id, "workflow deleted");
        Ok(())
    }

    fn entry(&self, workflow_id: Uuid) -> Result<Ref<'_, Uuid, Registered>, EngineError> {
        self.workflows
            .get(&workflow_id)
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))
    }

    fn entry_mut(
        &self,
        workflow_id: Uuid,
    ) -> Result<dashmap::mapref::one::RefMut<'_, Uuid, Registered>, EngineError> {
        self.workflows
            .get_mut(&workflow_id)
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))
    }

    /// Resolve a workflow reference by ID or by name.
    fn resolve(&self, reference: &str) -> Option<Uuid> {
        if let Ok(id) = reference.parse::<Uuid>() {
            if self.workflows.contains_key(&id) {
                return Some(id);
            }
        }
        self.workflows
            .iter()
            .find(|r| r.def.name == reference)
            .map(|r| *r.key())
    }

    // -----------------------------------------------------------------------
    // Starting executions
    // -----------------------------------------------------------------------

    /// Evaluate a stimulus against the triggers of every active workflow
    /// and start an execution per firing.
    ///
    /// Workflows with `auto_start` disabled only react to manual stimuli.
    pub async fn handle_stimulus(self: &Arc<Self>, stimulus: &Stimulus) -> StimulusReport {
        let now = match stimulus {
            Stimulus::Tick { at } => *at,
            _ => Utc::now(),
        };
        let mut report = StimulusReport::default();
        let mut prepared = Vec::new();
        let mut touched = Vec::new();

        let ids: Vec<Uuid> = self.workflows.iter().map(|r| *r.key()).collect();
        for workflow_id in ids {
            let Some(mut entry) = self.workflows.get_mut(&workflow_id) else {
                continue;
            };
            if entry.def.status != WorkflowStatus::Active {
                continue;
            }
            if !entry.def.config.auto_start && !matches!(stimulus, Stimulus::Manual { .. }) {
                continue;
            }

            let mut firings = Vec::new();
            let mut changed = false;
            for trigger in entry.def.triggers.iter_mut() {
                match self.evaluator.evaluate(workflow_id, trigger, stimulus, now) {
                    Ok(TriggerOutcome::NoMatch) => {}
                    Ok(TriggerOutcome::Debounced { .. }) => {
                        changed = true;
                        report.debounced += 1;
                    }
                    Ok(TriggerOutcome::Fire(firing)) => {
                        changed = true;
                        TriggerEvaluator::record_started(trigger);
                        self.events.publish(WorkflowEvent::TriggerFired {
                            workflow_id,
                            trigger_id: firing.trigger_id.clone(),
                            trigger_type: firing.trigger_type.to_string(),
                        });
                        firings.push(firing);
                    }
                    Err(error) => {
                        changed = true;
                        self.events.publish(WorkflowEvent::TriggerFailed {
                            workflow_id,
                            trigger_id: trigger.id.clone(),
                            error: error.to_string(),
                        });
                        report.errors.push(TriggerFailure {
                            workflow_id,
                            trigger_id: trigger.id.clone(),
                            error,
                        });
                    }
                }
            }
            for firing in firings {
                prepared.push(self.prepare(&entry, firing.provenance(), firing.input, 0, None));
            }
            if changed {
                touched.push(workflow_id);
            }
        }

        for workflow_id in touched {
            self.persist(workflow_id).await;
        }
        report.started = prepared.into_iter().map(|p| self.spawn(p)).collect();
        report
    }

    /// Start every debounced firing whose window has elapsed.
    pub async fn flush_debounced(self: &Arc<Self>, now: DateTime<Utc>) -> Vec<ExecutionHandle> {
        let mut prepared = Vec::new();
        let mut touched = HashSet::new();
        for (workflow_id, firing) in self.evaluator.flush_due(now) {
            let Some(mut entry) = self.workflows.get_mut(&workflow_id) else {
                continue;
            };
            if entry.def.status != WorkflowStatus::Active {
                continue;
            }
            if let Some(trigger) = entry
                .def
                .triggers
                .iter_mut()
                .find(|t| t.id == firing.trigger_id)
            {
                TriggerEvaluator::record_started(trigger);
            }
            self.events.publish(WorkflowEvent::TriggerFired {
                workflow_id,
                trigger_id: firing.trigger_id.clone(),
                trigger_type: firing.trigger_type.to_string(),
            });
            prepared.push(self.prepare(&entry, firing.provenance(), firing.input, 0, None));
            touched.insert(workflow_id);
        }
        for workflow_id in touched {
            self.persist(workflow_id).await;
        }
        prepared.into_iter().map(|p| self.spawn(p)).collect()
    }

    /// Deliver a clock tick: scheduled triggers plus due debounced firings.
    pub async fn tick(self: &Arc<Self>, at: DateTime<Utc>) -> StimulusReport {
        let mut report = self.handle_stimulus(&Stimulus::Tick { at }).await;
        report.started.extend(self.flush_debounced(at).await);
        report
    }

    /// Start an execution by hand. An enabled manual trigger, if any, is
    /// credited with the firing.
    pub async fn start_manual(self: &Arc<Self>, workflow_id: Uuid, input: Value) -> Result<ExecutionHandle, EngineError> {
        let now = Utc::now();
        let prepared = {
            let mut entry = self.entry_mut(workflow_id)?;
            entry.ensure_active()?;

            let stimulus = Stimulus::Manual {
                payload: input.clone(),
            };
            let mut fired = None;
            for trigger in entry
                .def
                .triggers
                .iter_mut()
                .filter(|t| matches!(t.config, TriggerConfig::Manual {}))
            {
                if let Ok(TriggerOutcome::Fire(firing)) =
                    self.evaluator.evaluate(workflow_id, trigger, &stimulus, now)
                {
                    TriggerEvaluator::record_started(trigger);
                    fired = Some(firing);
                    break;
                }
            }
            let (provenance, input) = match fired {
                Some(firing) => (firing.provenance(), firing.input),
                None => (TriggerProvenance::manual(), input),
            };
            self.prepare(&entry, provenance, input, 0, None)
        };
        self.persist(workflow_id).await;
        Ok(self.spawn(prepared))
    }

    /// Start an execution by hand and wait for it to finish.
    pub async fn execute(self: &Arc<Self>, workflow_id: Uuid, input: Value) -> Result<Execution, EngineError> {
        self.start_manual(workflow_id, input).await?.wait().await
    }

    /// Re-run a recoverable failed execution from the step that failed.
    ///
    /// Steps that completed keep their outputs and are not run again.
    pub fn rerun_from_failure(self: &Arc<Self>, workflow_id: Uuid, execution_id: Uuid) -> Result<ExecutionHandle, EngineError> {
        let prepared = {
            let entry = self.entry(workflow_id)?;
            entry.ensure_active()?;
            let previous = entry
                .def
                .execution(&execution_id)
                .ok_or(EngineError::ExecutionNotFound(execution_id))?;
            if previous.status != ExecutionStatus::Failed {
                return Err(EngineError::NotRecoverable(
                    execution_id,
                    format!("status is {}", previous.status),
                ));
            }
            if !previous.error.as_ref().is_some_and(|e| e.recoverable) {
                return Err(EngineError::NotRecoverable(
                    execution_id,
                    "failure is not recoverable".to_string(),
                ));
            }

            let completed: HashSet<String> = previous
                .step_executions
                .iter()
                .filter(|s| s.status == stepwise_types::workflow::StepExecutionStatus::Completed)
                .map(|s| s.step_id.clone())
                .collect();
            let context = ExecutionContext::restore(previous.context.clone())
                .map_err(|e| EngineError::NotRecoverable(execution_id, e.to_string()))?;
            let provenance = TriggerProvenance {
                trigger_id: previous.trigger.trigger_id.clone(),
                trigger_type: TriggerType::Rerun,
                fired_at: Utc::now(),
                event_id: previous.trigger.event_id.clone(),
            };
            let input = previous.input.clone();
            tracing::info!(
                %workflow_id,
                %execution_id,
                completed = completed.len(),
                "re-running failed execution"
            );
            self.prepare(
                &entry,
                provenance,
                input,
                0,
                Some(Resume {
                    from: execution_id,
                    context,
                    completed,
                }),
            )
        };
        Ok(self.spawn(prepared))
    }

    /// Run a workflow inline as a sub-workflow of a step.
    async fn run_nested(&self, reference: &str, input: Value, depth: u32) -> Result<Execution, EngineError> {
        let workflow_id = self
            .resolve(reference)
            .ok_or_else(|| EngineError::WorkflowNotFound(reference.to_string()))?;
        let prepared = {
            let entry = self.entry(workflow_id)?;
            entry.ensure_active()?;
            self.prepare(&entry, TriggerProvenance::manual(), input, depth, None)
        };
        Ok(self.drive(prepared).await)
    }

    fn prepare(
        &self,
        registered: &Registered,
        provenance: TriggerProvenance,
        input: Value,
        depth: u32,
        resume: Option<Resume>,
    ) -> Prepared {
        let plan = registered.plan.clone();
        let mut execution = Execution::new(plan.def.id, plan.def.version, provenance, input.clone());

        let (context, completed) = match resume {
            Some(Resume {
                from,
                mut context,
                completed,
            }) => {
                execution.resumed_from = Some(from);
                context.execution_id = execution.id;
                (context, completed)
            }
            None => {
                let priority = input
                    .get("priority")
                    .and_then(Value::as_i64)
                    .map(|p| p.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32)
                    .unwrap_or(0);
                let environment = plan
                    .def
                    .metadata
                    .get("environment")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let context = ExecutionContext::new(plan.def.id, &plan.def.name, execution.id, input)
                    .with_priority(priority)
                    .with_environment(environment);
                (context, HashSet::new())
            }
        };

        let control = ExecutionControl::new();
        self.controls.insert(execution.id, control.clone());
        Prepared {
            plan,
            execution,
            context,
            depth,
            completed,
            control,
        }
    }

    fn spawn(self: &Arc<Self>, prepared: Prepared) -> ExecutionHandle {
        let execution_id = prepared.execution.id;
        let workflow_id = prepared.plan.def.id;
        let engine = Arc::clone(self);
        let join = tokio::spawn(async move { engine.drive(prepared).await });
        ExecutionHandle {
            execution_id,
            workflow_id,
            join,
        }
    }

    /// Admit, run, record.
    async fn drive(&self, prepared: Prepared) -> Execution {
        let Prepared {
            plan,
            mut execution,
            context,
            depth,
            completed,
            control,
        } = prepared;
        let execution_id = execution.id;
        let workflow_id = plan.def.id;

        // Nested runs bypass the queue; their parent already holds a slot.
        let permit = if depth > 0 {
            Some(QueuePermit::detached())
        } else {
            let queue = self
                .queues
                .entry(workflow_id)
                .or_insert_with(|| {
                    let c = &plan.def.config.concurrency;
                    ExecutionQueue::new(c.max_concurrent, c.queue)
                })
                .clone();
            match queue.admit(execution_id, context.priority) {
                Admission::Ready(permit) => Some(permit),
                Admission::Queued { position, ticket } => {
                    tracing::info!(%execution_id, %workflow_id, position, "execution queued");
                    self.events.publish(WorkflowEvent::ExecutionQueued {
                        execution_id,
                        workflow_id,
                        position,
                    });
                    tokio::select! {
                        admitted = ticket.wait() => admitted.ok(),
                        _ = control.cancelled() => None,
                    }
                }
            }
        };

        let execution = match permit {
            Some(permit) => {
                let finished = self
                    .orchestrator
                    .run(
                        &plan.def,
                        &plan.graph,
                        RunRequest {
                            execution,
                            context,
                            depth,
                            control,
                            completed,
                        },
                    )
                    .await;
                drop(permit);
                finished
            }
            None => {
                // Cancelled or withdrawn before a slot was free.
                execution.context = context.snapshot();
                if let Err(e) = execution.transition(ExecutionStatus::Cancelled) {
                    tracing::error!(%execution_id, error = %e, "invalid terminal transition");
                }
                tracing::info!(%execution_id, %workflow_id, "queued execution cancelled");
                self.events.publish(WorkflowEvent::ExecutionCancelled {
                    execution_id,
                    workflow_id,
                });
                execution
            }
        };

        self.controls.remove(&execution_id);
        self.record(execution.clone()).await;
        execution
    }

    // -----------------------------------------------------------------------
    // Controlling executions
    // -----------------------------------------------------------------------

    fn control(&self, execution_id: Uuid) -> Result<ExecutionControl, EngineError> {
        self.controls
            .get(&execution_id)
            .map(|c| c.clone())
            .ok_or(EngineError::ExecutionNotFound(execution_id))
    }

    /// Cancel a queued or running execution.
    pub fn cancel(&self, execution_id: Uuid) -> Result<(), EngineError> {
        self.control(execution_id)?.cancel();
        tracing::info!(%execution_id, "cancellation requested");
        Ok(())
    }

    /// Stop scheduling new steps. Returns `false` if already paused.
    pub fn pause(&self, execution_id: Uuid) -> Result<bool, EngineError> {
        Ok(self.control(execution_id)?.pause())
    }

    /// Resume scheduling. Returns `false` if not paused.
    pub fn resume(&self, execution_id: Uuid) -> Result<bool, EngineError> {
        Ok(self.control(execution_id)?.resume())
    }

    /// Executions that are queued or running.
    pub fn active_executions(&self) -> Vec<Uuid> {
        self.controls.iter().map(|c| *c.key()).collect()
    }

    /// `(running, waiting)` counts of a workflow's queue.
    pub fn queue_depth(&self, workflow_id: Uuid) -> Option<(usize, usize)> {
        self.queues
            .get(&workflow_id)
            .map(|q| (q.running(), q.waiting()))
    }

    // -----------------------------------------------------------------------
    // History and persistence
    // -----------------------------------------------------------------------

    async fn record(&self, execution: Execution) {
        let workflow_id = execution.workflow_id;
        {
            let Some(mut entry) = self.workflows.get_mut(&workflow_id) else {
                tracing::warn!(%workflow_id, execution_id = %execution.id, "workflow gone; execution not recorded");
                return;
            };
            history::record_execution(
                &mut entry.def,
                execution,
                &self.config.history_retention,
                Utc::now(),
            );
        }
        self.persist(workflow_id).await;
    }

    /// Save the current record, logging failures.
    async fn persist(&self, workflow_id: Uuid) {
        if let Err(e) = self.persist_strict(workflow_id).await {
            tracing::warn!(%workflow_id, error = %e, "failed to persist workflow");
        }
    }

    async fn persist_strict(&self, workflow_id: Uuid) -> Result<(), EngineError> {
        let Some(def) = self.get(&workflow_id) else {
            return Err(EngineError::WorkflowNotFound(workflow_id.to_string()));
        };
        self.repo.save_workflow(&def).await?;
        Ok(())
    }
}

impl<R: WorkflowRepository> std::fmt::Debug for WorkflowEngine<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("workflows", &self.workflows.len())
            .field("active_executions", &self.controls.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Sub-workflows
// ---------------------------------------------------------------------------

/// Runs sub-workflow steps on the engine that owns the step.
struct EngineSubWorkflows<R: WorkflowRepository> {
    engine: Weak<WorkflowEngine<R>>,
}

impl<R: WorkflowRepository + 'static> SubWorkflowRunner for EngineSubWorkflows<R> {
    fn run<'a>(&'a self, workflow_id: &'a str, input: Value, depth: u32) -> BoxFuture<'a, CapabilityResult<Value>> {
        Box::pin(async move {
            let engine = self
                .engine
                .upgrade()
                .ok_or_else(|| CapabilityError::Failed("engine is shutting down".to_string()))?;
            let execution = engine
                .run_nested(workflow_id, input, depth)
                .await
                .map_err(|e| CapabilityError::Failed(e.to_string()))?;
            match execution.status {
                ExecutionStatus::Completed => Ok(execution.output.unwrap_or(Value::Null)),
                status => Err(CapabilityError::Failed(format!(
                    "sub-workflow '{workflow_id}' ended {status}: {}",
                    execution
                        .error
                        .map(|e| e.message)
                        .unwrap_or_else(|| "no error recorded".to_string())
                ))),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::capability::ActionHandler;
    use crate::repository::memory::InMemoryWorkflowRepository;
    use crate::workflow::testing::{action, step, wait_step, workflow};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use stepwise_types::workflow::{
        ConcurrencyConfig, EntityOperation, ErrorHandling, OnError, QueueDiscipline, StepConfig,
        TriggerStats,
    };

    struct Counter(AtomicU32);

    impl ActionHandler for Counter {
        fn invoke<'a>(&'a self, _action_type: &'a str, payload: Value) -> BoxFuture<'a, CapabilityResult<Value>> {
            Box::pin(async move {
                let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(json!({ "n": n, "payload": payload }))
            })
        }
    }

    struct AlwaysFails;

    impl ActionHandler for AlwaysFails {
        fn invoke<'a>(&'a self, _action_type: &'a str, _payload: Value) -> BoxFuture<'a, CapabilityResult<Value>> {
            Box::pin(async { Err(CapabilityError::Failed("upstream unavailable".to_string())) })
        }
    }

    type Repo = InMemoryWorkflowRepository;

    fn engine(caps: Capabilities) -> (Arc<WorkflowEngine<Repo>>, Arc<Repo>) {
        let repo = Arc::new(Repo::new());
        (WorkflowEngine::new(repo.clone(), caps, EngineConfig::default()), repo)
    }

    fn trigger(id: &str, config: TriggerConfig) -> Trigger {
        Trigger {
            id: id.to_string(),
            name: id.to_string(),
            enabled: true,
            config,
            stats: TriggerStats::default(),
        }
    }

    fn counting() -> (Capabilities, Arc<Counter>) {
        let counter = Arc::new(Counter(AtomicU32::new(0)));
        (Capabilities::new().with_action("do_a", counter.clone()), counter)
    }

    #[tokio::test]
    async fn test_register_persists_and_executes() {
        let (caps, counter) = counting();
        let (engine, repo) = engine(caps);
        let id = engine.register(workflow(vec![action("a", 1)])).await.unwrap();
        assert!(repo.get(&id).is_some());

        let exec = engine.execute(id, json!({ "x": 1 })).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        let stored = repo.get(&id).unwrap();
        assert_eq!(stored.executions.len(), 1);
        assert_eq!(stored.analytics.successful_executions, 1);
        assert!(engine.active_executions().is_empty());
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_definition() {
        let (engine, repo) = engine(Capabilities::new());
        let mut a = action("a", 1);
        a.dependencies = vec!["ghost".to_string()];
        let def = workflow(vec![a]);
        let id = def.id;
        assert!(engine.register(def).await.is_err());
        assert!(repo.get(&id).is_none());
    }

    #[tokio::test]
    async fn test_event_stimulus_starts_matching_workflow() {
        let (caps, counter) = counting();
        let (engine, _) = engine(caps);
        let mut def = workflow(vec![action("a", 1)]);
        def.triggers = vec![trigger(
            "on-created",
            TriggerConfig::EntityChange {
                entity_type: "task".to_string(),
                operations: vec![EntityOperation::Create],
                conditions: Vec::new(),
                debounce_ms: 0,
            },
        )];
        let id = engine.register(def).await.unwrap();

        let report = engine
            .handle_stimulus(&Stimulus::EntityChange {
                entity_type: "task".to_string(),
                operation: EntityOperation::Create,
                payload: json!({ "id": "t-1" }),
            })
            .await;
        assert_eq!(report.started.len(), 1);
        for handle in report.started {
            let exec = handle.wait().await.unwrap();
            assert_eq!(exec.trigger.trigger_id.as_deref(), Some("on-created"));
        }
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        let stats = &engine.get(&id).unwrap().triggers[0].stats;
        assert_eq!(stats.total_triggers, 1);
        assert_eq!(stats.successful_triggers, 1);
    }

    #[tokio::test]
    async fn test_auto_start_off_ignores_non_manual_stimuli() {
        let (caps, _) = counting();
        let (engine, _) = engine(caps);
        let mut def = workflow(vec![action("a", 1)]);
        def.config.auto_start = false;
        def.triggers = vec![trigger(
            "hook",
            TriggerConfig::Webhook {
                path: "/hooks/x".to_string(),
                auth: None,
                conditions: Vec::new(),
            },
        )];
        engine.register(def).await.unwrap();

        let report = engine
            .handle_stimulus(&Stimulus::Webhook {
                path: "/hooks/x".to_string(),
                payload: json!({}),
            })
            .await;
        assert!(report.started.is_empty());
    }

    #[tokio::test]
    async fn test_inactive_workflow_refuses_manual_start() {
        let (engine, _) = engine(Capabilities::new());
        let id = engine.register(workflow(vec![action("a", 1)])).await.unwrap();
        engine.set_status(id, WorkflowStatus::Archived).await.unwrap();
        assert!(matches!(
            engine.start_manual(id, json!({})).await,
            Err(EngineError::Inactive(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_refused_with_history() {
        let (caps, _) = counting();
        let (engine, repo) = engine(caps);
        let id = engine.register(workflow(vec![action("a", 1)])).await.unwrap();
        engine.execute(id, json!({})).await.unwrap();
        assert!(engine.delete(id).await.is_err());

        let mut unused = workflow(vec![action("a", 1)]);
        unused.name = "unused".to_string();
        let fresh = engine.register(unused).await.unwrap();
        engine.delete(fresh).await.unwrap();
        assert!(repo.get(&fresh).is_none());
        assert!(engine.get(&fresh).is_none());
    }

    #[tokio::test]
    async fn test_update_steps_bumps_version() {
        let (engine, repo) = engine(Capabilities::new());
        let id = engine.register(workflow(vec![action("a", 1)])).await.unwrap();
        let version = engine
            .update_steps(id, vec![action("a", 1), action("b", 2)])
            .await
            .unwrap();
        assert_eq!(version, 2);
        assert_eq!(repo.get(&id).unwrap().steps.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_limit_queues_second_execution() {
        let (engine, _) = engine(Capabilities::new());
        let mut def = workflow(vec![wait_step("hold", 1, 100)]);
        def.config.concurrency = ConcurrencyConfig {
            max_concurrent: Some(1),
            queue: QueueDiscipline::Fifo,
        };
        let id = engine.register(def).await.unwrap();
        let mut rx = engine.events().subscribe();

        let first = engine.start_manual(id, json!({})).await.unwrap();
        let second = engine.start_manual(id, json!({})).await.unwrap();
        let a = first.wait().await.unwrap();
        let b = second.wait().await.unwrap();

        assert_eq!(a.status, ExecutionStatus::Completed);
        assert_eq!(b.status, ExecutionStatus::Completed);
        // The second only started after the first finished.
        assert!(b.started_at.unwrap() >= a.completed_at.unwrap());

        let mut queued = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, WorkflowEvent::ExecutionQueued { .. }) {
                queued += 1;
            }
        }
        assert_eq!(queued, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_queued() {
        let (engine, _) = engine(Capabilities::new());
        let mut def = workflow(vec![wait_step("hold", 1, 1_000)]);
        def.config.concurrency.max_concurrent = Some(1);
        let id = engine.register(def).await.unwrap();

        let first = engine.start_manual(id, json!({})).await.unwrap();
        let second = engine.start_manual(id, json!({})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.cancel(second.execution_id).unwrap();

        let b = second.wait().await.unwrap();
        assert_eq!(b.status, ExecutionStatus::Cancelled);
        assert!(b.step_executions.is_empty());
        assert_eq!(first.wait().await.unwrap().status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_rerun_from_failure_skips_completed_steps() {
        let counter = Arc::new(Counter(AtomicU32::new(0)));
        let caps = Capabilities::new()
            .with_action("do_a", counter.clone())
            .with_action("do_b", Arc::new(AlwaysFails));
        let (engine, _) = engine(caps);
        let mut b = action("b", 2);
        b.error_handling = ErrorHandling {
            on_error: OnError::Stop,
            ..Default::default()
        };
        let id = engine
            .register(workflow(vec![action("a", 1), b]))
            .await
            .unwrap();

        let failed = engine.execute(id, json!({})).await.unwrap();
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert!(failed.error.as_ref().unwrap().recoverable);

        let rerun = engine
            .rerun_from_failure(id, failed.id)
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(rerun.resumed_from, Some(failed.id));
        assert_eq!(rerun.trigger.trigger_type, TriggerType::Rerun);
        // "a" ran once, in the original execution only.
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert!(rerun.attempts_for("a").next().is_none());
    }

    #[tokio::test]
    async fn test_rerun_refuses_unrecoverable_failure() {
        let (engine, _) = engine(Capabilities::new());
        let id = engine.register(workflow(vec![action("a", 1)])).await.unwrap();
        // No handler for "do_a": unsupported actions are not recoverable.
        let failed = engine.execute(id, json!({})).await.unwrap();
        assert!(matches!(
            engine.rerun_from_failure(id, failed.id),
            Err(EngineError::NotRecoverable(..))
        ));
    }

    #[tokio::test]
    async fn test_sub_workflow_runs_on_engine() {
        let (caps, _) = counting();
        let (engine, _) = engine(caps);
        let mut child = workflow(vec![action("a", 1)]);
        child.name = "child".to_string();
        engine.register(child).await.unwrap();

        let mut parent = workflow(vec![step(
            "call",
            1,
            StepConfig::SubWorkflow {
                workflow_id: "child".to_string(),
                input: Some(json!({ "from": "parent" })),
            },
        )]);
        parent.name = "parent".to_string();
        let parent_id = engine.register(parent).await.unwrap();

        let exec = engine.execute(parent_id, json!({})).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        let output = exec.context["variables"]["call"].clone();
        assert_eq!(output["from"], json!("parent"));
        assert_eq!(output["a"]["n"], json!(1));
        // The child recorded its own execution.
        let child = engine.find_by_name("child").unwrap();
        assert_eq!(child.executions.len(), 1);
    }

    #[tokio::test]
    async fn test_load_all_registers_stored_workflows() {
        let repo = Arc::new(Repo::new());
        let def = workflow(vec![action("a", 1)]);
        let id = def.id;
        repo.save_workflow(&def).await.unwrap();

        let engine = WorkflowEngine::new(repo, Capabilities::new(), EngineConfig::default());
        assert_eq!(engine.load_all().await.unwrap(), 1);
        assert!(engine.get(&id).is_some());
    }

    #[tokio::test]
    async fn test_unknown_execution_controls_error() {
        let (engine, _) = engine(Capabilities::new());
        let ghost = Uuid::now_v7();
        assert!(matches!(engine.cancel(ghost), Err(EngineError::ExecutionNotFound(_))));
        assert!(engine.pause(ghost).is_err());
    }
}
