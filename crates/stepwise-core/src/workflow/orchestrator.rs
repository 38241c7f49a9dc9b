//! Step orchestrator: drives one execution over the step graph.
//!
//! Steps run as tasks in a `JoinSet`. After every task completes the
//! orchestrator resolves the outgoing edges of finished steps and dispatches
//! whatever became ready. Each attempt produces one `StepExecution`; failures
//! are routed through the step's `on_error` policy.
//!
//! Parallel steps have no task of their own: they release their branches and
//! complete when the branches do. Loop steps run their body sequentially in a
//! single task.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use stepwise_types::event::WorkflowEvent;
use stepwise_types::workflow::{
    Condition, Execution, ExecutionError, ExecutionStatus, ExhaustedPolicy, OnError, RetryPolicy,
    StepConfig, StepDefinition, StepExecution, StepExecutionStatus, Suspension, WorkflowDefinition,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::event::bus::EventBus;

use super::context::{ExecutionContext, lookup_path};
use super::dag::{EdgeKind, StepGraph};
use super::expression::{WorkflowEvaluator, evaluate_condition};
use super::retry::{RetryDecision, RetryHandler};
use super::step_runner::{StepError, StepInput, StepOutput, StepRunner, StepSignal};

/// Upper bound on loop iterations when a loop sets none.
pub const DEFAULT_MAX_ITERATIONS: u32 = 1000;

// ---------------------------------------------------------------------------
// ExecutionControl
// ---------------------------------------------------------------------------

/// Handle for cancelling, pausing and resuming a running execution.
#[derive(Debug, Clone)]
pub struct ExecutionControl {
    cancel: CancellationToken,
    pause: Arc<watch::Sender<bool>>,
}

impl ExecutionControl {
    pub fn new() -> Self {
        let (pause, _) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            pause: Arc::new(pause),
        }
    }

    /// Stop scheduling; in-flight attempts finish, suspended steps wake.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the execution is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Returns `false` if already paused.
    pub fn pause(&self) -> bool {
        self.pause.send_if_modified(|paused| !std::mem::replace(paused, true))
    }

    /// Returns `false` if not paused.
    pub fn resume(&self) -> bool {
        self.pause.send_if_modified(|paused| std::mem::replace(paused, false))
    }

    pub fn is_paused(&self) -> bool {
        *self.pause.borrow()
    }

    fn pause_receiver(&self) -> watch::Receiver<bool> {
        self.pause.subscribe()
    }
}

impl Default for ExecutionControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything needed to drive one execution.
#[derive(Debug)]
pub struct RunRequest {
    /// A pending execution.
    pub execution: Execution,
    pub context: ExecutionContext,
    /// Sub-workflow nesting depth.
    pub depth: u32,
    pub control: ExecutionControl,
    /// Steps already completed by an earlier execution; their outputs must
    /// be present in `context`.
    pub completed: HashSet<String>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives executions of workflow definitions.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    runner: Arc<StepRunner>,
    events: EventBus,
    default_workflow_timeout: Duration,
}

impl Orchestrator {
    pub fn new(runner: Arc<StepRunner>, events: EventBus, default_workflow_timeout: Duration) -> Self {
        Self {
            runner,
            events,
            default_workflow_timeout,
        }
    }

    /// Run an execution to a terminal status and return it.
    pub async fn run(&self, def: &WorkflowDefinition, graph: &StepGraph, request: RunRequest) -> Execution {
        let mut run = Run::new(self, def, graph, request);
        run.drive().await;
        run.finish()
    }
}

// ---------------------------------------------------------------------------
// Per-run state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepState {
    Pending,
    Running,
    Succeeded,
    /// Skipped by `on_error` policy after failing.
    PolicySkipped,
    /// Not reached because no incoming edge was taken.
    BranchSkipped,
    Failed { escalated: bool },
    /// Not reached because an upstream edge failed.
    Blocked,
}

impl StepState {
    fn is_terminal(self) -> bool {
        !matches!(self, StepState::Pending | StepState::Running)
    }

    fn is_success(self) -> bool {
        matches!(self, StepState::Succeeded | StepState::PolicySkipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    /// Ordering only; no say in activation.
    Neutral,
    Taken,
    NotTaken,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activation {
    Run,
    Block,
    Skip,
}

#[derive(Debug)]
struct ParallelRun {
    started_at: DateTime<Utc>,
    branches: Vec<String>,
    wait_for_all: bool,
}

/// Outcome of one task, reported back to the run loop.
#[derive(Debug)]
struct AttemptReport {
    step_id: String,
    attempt: u32,
    /// `None` when the attempt was cancelled before it began.
    started_at: Option<DateTime<Utc>>,
    input: Option<Value>,
    result: Result<StepOutput, StepError>,
    /// Loop body attempts.
    body: Vec<StepExecution>,
}

#[derive(Debug, Clone)]
struct LoopPlan {
    items: Option<String>,
    condition: Option<Condition>,
    max_iterations: u32,
    body: Vec<StepDefinition>,
    retry_defaults: RetryPolicy,
}

struct Run<'a> {
    orch: &'a Orchestrator,
    def: &'a WorkflowDefinition,
    graph: &'a StepGraph,
    steps: HashMap<&'a str, &'a StepDefinition>,
    execution: Execution,
    ctx: ExecutionContext,
    ctx_tx: watch::Sender<Arc<ExecutionContext>>,
    depth: u32,
    control: ExecutionControl,
    /// Cancels suspended steps and retry delays on user cancel or timeout.
    run_token: CancellationToken,
    states: HashMap<String, StepState>,
    attempts: HashMap<String, u32>,
    /// When the latest attempt of each step was dispatched.
    dispatched_at: HashMap<String, DateTime<Utc>>,
    branch_results: HashMap<String, bool>,
    guard_results: HashMap<(String, usize), Resolution>,
    parallels: HashMap<String, ParallelRun>,
    races_won: HashSet<String>,
    tasks: JoinSet<AttemptReport>,
    signals_tx: mpsc::UnboundedSender<StepSignal>,
    signals_rx: mpsc::UnboundedReceiver<StepSignal>,
    fatal: Option<ExecutionError>,
    cancelled: bool,
    timed_out: bool,
    steps_completed: u32,
    precompleted: HashSet<String>,
}

impl<'a> Run<'a> {
    fn new(orch: &'a Orchestrator, def: &'a WorkflowDefinition, graph: &'a StepGraph, request: RunRequest) -> Self {
        let steps = def.steps.iter().map(|s| (s.id.as_str(), s)).collect();
        let states = graph
            .step_ids()
            .map(|id| (id.to_string(), StepState::Pending))
            .collect();
        let (ctx_tx, _) = watch::channel(Arc::new(request.context.clone()));
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let run_token = request.control.cancel.child_token();

        Self {
            orch,
            def,
            graph,
            steps,
            execution: request.execution,
            ctx: request.context,
            ctx_tx,
            depth: request.depth,
            control: request.control,
            run_token,
            states,
            attempts: HashMap::new(),
            dispatched_at: HashMap::new(),
            branch_results: HashMap::new(),
            guard_results: HashMap::new(),
            parallels: HashMap::new(),
            races_won: HashSet::new(),
            tasks: JoinSet::new(),
            signals_tx,
            signals_rx,
            fatal: None,
            cancelled: false,
            timed_out: false,
            steps_completed: 0,
            precompleted: request.completed,
        }
    }

    fn publish(&self, event: WorkflowEvent) {
        self.orch.events.publish(event);
    }

    fn stopping(&self) -> bool {
        self.cancelled || self.fatal.is_some()
    }

    fn state(&self, step_id: &str) -> StepState {
        self.states.get(step_id).copied().unwrap_or(StepState::Pending)
    }

    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------

    async fn drive(&mut self) {
        if let Err(e) = self.execution.transition(ExecutionStatus::Running) {
            tracing::error!(execution_id = %self.execution.id, error = %e, "execution cannot start");
            self.fatal = Some(ExecutionError {
                message: e.to_string(),
                step_id: None,
                recoverable: false,
            });
            return;
        }
        self.publish(WorkflowEvent::ExecutionStarted {
            execution_id: self.execution.id,
            workflow_id: self.def.id,
            workflow_name: self.def.name.clone(),
            trigger_type: self.execution.trigger.trigger_type.to_string(),
        });
        tracing::info!(
            execution_id = %self.execution.id,
            workflow_id = %self.def.id,
            workflow = %self.def.name,
            steps = self.graph.len(),
            "execution started"
        );

        self.settle_precompleted();

        let timeout = self
            .def
            .config
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.orch.default_workflow_timeout);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let cancel = self.control.cancel.clone();
        let mut pause_rx = self.control.pause_receiver();
        if *pause_rx.borrow_and_update() {
            self.apply_pause(true);
        }

        loop {
            if !self.stopping() && !self.control.is_paused() {
                self.schedule();
            }

            if self.tasks.is_empty() {
                if self.stopping() || !self.has_pending_work() {
                    break;
                }
                if !self.control.is_paused() {
                    self.abandon_unreachable();
                    break;
                }
            }

            tokio::select! {
                Some(joined) = self.tasks.join_next() => match joined {
                    Ok(report) => self.handle_report(report),
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => {
                        tracing::error!(execution_id = %self.execution.id, error = %e, "step task panicked");
                        self.set_fatal(None, format!("step task panicked: {e}"), false);
                    }
                },
                Some(signal) = self.signals_rx.recv() => self.handle_signal(signal),
                _ = cancel.cancelled(), if !self.cancelled => {
                    tracing::info!(execution_id = %self.execution.id, "execution cancelled");
                    self.cancelled = true;
                }
                changed = pause_rx.changed() => {
                    if changed.is_ok() {
                        let paused = *pause_rx.borrow_and_update();
                        self.apply_pause(paused);
                    }
                }
                _ = &mut deadline, if !self.timed_out => {
                    self.timed_out = true;
                    tracing::warn!(
                        execution_id = %self.execution.id,
                        timeout_secs = timeout.as_secs(),
                        "workflow timed out"
                    );
                    let message = format!("workflow timed out after {}s", timeout.as_secs());
                    self.fail_in_flight(&message);
                    self.set_fatal(None, message, true);
                    self.run_token.cancel();
                    self.tasks.abort_all();
                }
            }
        }
    }

    /// Close out every running step with a failed attempt record. Their
    /// tasks are aborted right after, so no report will follow.
    fn fail_in_flight(&mut self, message: &str) {
        let running: Vec<&'a str> = self
            .graph
            .step_ids()
            .filter(|id| self.state(id) == StepState::Running)
            .collect();
        for id in running {
            let mut record = if self.parallels.contains_key(id) {
                self.parallel_record(id)
            } else {
                let attempt = self.attempts.get(id).copied().unwrap_or(1);
                let mut record = StepExecution::start(id, attempt, None);
                record.started_at = self.dispatched_at.get(id).copied().or(record.started_at);
                record
            };
            record.error = Some(message.to_string());
            tracing::warn!(execution_id = %self.execution.id, step_id = id, "step interrupted by workflow timeout");
            self.clear_suspension(id);
            self.states.insert(id.to_string(), StepState::Failed { escalated: false });
            self.push_failed(record, StepExecutionStatus::Failed, false);
        }
    }

    fn finish(mut self) -> Execution {
        let target = if self.cancelled {
            ExecutionStatus::Cancelled
        } else if self.fatal.is_some() {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        };

        if self.execution.status == ExecutionStatus::Paused && target != ExecutionStatus::Cancelled {
            let _ = self.execution.transition(ExecutionStatus::Running);
        }

        self.execution.context = self.ctx.snapshot();
        if target == ExecutionStatus::Completed {
            self.execution.output = Some(Value::Object(self.ctx.variables.clone()));
        }
        self.execution.error = self.fatal.take();
        if let Err(e) = self.execution.transition(target) {
            tracing::error!(execution_id = %self.execution.id, error = %e, "invalid terminal transition");
        }

        let execution_id = self.execution.id;
        let workflow_id = self.def.id;
        let duration_ms = self.execution.duration_ms.unwrap_or_default();
        match self.execution.status {
            ExecutionStatus::Completed => {
                tracing::info!(%execution_id, %workflow_id, duration_ms, steps = self.steps_completed, "execution completed");
                self.publish(WorkflowEvent::ExecutionCompleted {
                    execution_id,
                    workflow_id,
                    duration_ms,
                    steps_completed: self.steps_completed,
                });
            }
            ExecutionStatus::Cancelled => {
                self.publish(WorkflowEvent::ExecutionCancelled {
                    execution_id,
                    workflow_id,
                });
            }
            _ => {
                let error = self.execution.error.clone().unwrap_or(ExecutionError {
                    message: "execution failed".to_string(),
                    step_id: None,
                    recoverable: false,
                });
                tracing::error!(
                    %execution_id,
                    %workflow_id,
                    step_id = ?error.step_id,
                    error = %error.message,
                    recoverable = error.recoverable,
                    "execution failed"
                );
                self.publish(WorkflowEvent::ExecutionFailed {
                    execution_id,
                    workflow_id,
                    step_id: error.step_id,
                    error: error.message,
                    recoverable: error.recoverable,
                });
            }
        }
        self.execution
    }

    fn has_pending_work(&self) -> bool {
        self.states.values().any(|s| !s.is_terminal())
    }

    fn apply_pause(&mut self, paused: bool) {
        let (next, event) = match (paused, self.execution.status) {
            (true, ExecutionStatus::Running) => (
                ExecutionStatus::Paused,
                WorkflowEvent::ExecutionPaused {
                    execution_id: self.execution.id,
                    workflow_id: self.def.id,
                },
            ),
            (false, ExecutionStatus::Paused) => (
                ExecutionStatus::Running,
                WorkflowEvent::ExecutionResumed {
                    execution_id: self.execution.id,
                    workflow_id: self.def.id,
                },
            ),
            _ => return,
        };
        if self.execution.transition(next).is_ok() {
            tracing::info!(execution_id = %self.execution.id, status = %next, "execution status changed");
            self.publish(event);
        }
    }

    /// Steps left pending with nothing running can never activate; record
    /// them so the trace is complete.
    fn abandon_unreachable(&mut self) {
        let stuck: Vec<String> = self
            .graph
            .step_ids()
            .filter(|id| !self.state(id).is_terminal())
            .map(str::to_string)
            .collect();
        for id in stuck {
            tracing::warn!(execution_id = %self.execution.id, step_id = %id, "step unreachable");
            self.record_not_reached(&id, StepState::Blocked, "not reached");
        }
    }

    // -----------------------------------------------------------------------
    // Activation
    // -----------------------------------------------------------------------

    fn settle_precompleted(&mut self) {
        let done: Vec<&'a str> = self
            .graph
            .step_ids()
            .filter(|id| self.precompleted.contains(*id))
            .collect();
        for id in done {
            if let Some(step) = self.steps.get(id).copied() {
                if matches!(step.config, StepConfig::Condition { .. }) {
                    let result = self
                        .ctx
                        .step_output(id)
                        .and_then(|v| v.get("result"))
                        .and_then(Value::as_bool);
                    if let Some(result) = result {
                        self.branch_results.insert(id.to_string(), result);
                    }
                }
                self.states.insert(id.to_string(), StepState::Succeeded);
                self.evaluate_guards(step);
            }
        }
    }

    fn resolve_edge(&self, source: &str, kind: EdgeKind) -> Option<Resolution> {
        let state = self.state(source);
        if kind == EdgeKind::Release && self.parallels.contains_key(source) {
            return Some(Resolution::Taken);
        }
        if !state.is_terminal() {
            return None;
        }
        let upstream_failed = matches!(state, StepState::Failed { .. } | StepState::Blocked);
        let resolution = match kind {
            EdgeKind::Order => Resolution::Neutral,
            EdgeKind::Dependency | EdgeKind::Release => {
                if state.is_success() {
                    Resolution::Taken
                } else if upstream_failed {
                    Resolution::Failed
                } else {
                    Resolution::NotTaken
                }
            }
            EdgeKind::Branch { when } => {
                if upstream_failed {
                    Resolution::Failed
                } else if state == StepState::Succeeded && self.branch_results.get(source) == Some(&when) {
                    Resolution::Taken
                } else {
                    Resolution::NotTaken
                }
            }
            EdgeKind::Guard { index } => {
                if upstream_failed {
                    Resolution::Failed
                } else if state.is_success() {
                    self.guard_results
                        .get(&(source.to_string(), index))
                        .copied()
                        .unwrap_or(Resolution::NotTaken)
                } else {
                    Resolution::NotTaken
                }
            }
            EdgeKind::OnError => {
                if state == (StepState::Failed { escalated: true }) {
                    Resolution::Taken
                } else {
                    Resolution::NotTaken
                }
            }
        };
        Some(resolution)
    }

    /// `None` while any incoming edge is unresolved.
    fn activation(&self, step_id: &str) -> Option<Activation> {
        let mut gating = false;
        let mut failed = false;
        let mut taken = false;
        for (source, kind) in self.graph.incoming(step_id) {
            match self.resolve_edge(source, kind)? {
                Resolution::Neutral => {}
                Resolution::Taken => {
                    gating = true;
                    taken = true;
                }
                Resolution::NotTaken => gating = true,
                Resolution::Failed => {
                    gating = true;
                    failed = true;
                }
            }
        }
        Some(if !gating || (taken && !failed) {
            Activation::Run
        } else if failed {
            Activation::Block
        } else {
            Activation::Skip
        })
    }

    /// Dispatch every ready step, cascading skips until nothing changes.
    fn schedule(&mut self) {
        loop {
            let mut changed = false;
            let pending: Vec<&'a str> = self
                .graph
                .step_ids()
                .filter(|id| self.state(id) == StepState::Pending)
                .collect();
            for id in pending {
                match self.activation(id) {
                    None => {}
                    Some(Activation::Run) => {
                        self.start_step(id);
                        changed = true;
                    }
                    Some(Activation::Block) => {
                        self.record_not_reached(id, StepState::Blocked, "upstream failed");
                        changed = true;
                    }
                    Some(Activation::Skip) => {
                        self.record_not_reached(id, StepState::BranchSkipped, "branch not taken");
                        changed = true;
                    }
                }
                if self.stopping() {
                    return;
                }
            }
            if !changed {
                return;
            }
        }
    }

    fn record_not_reached(&mut self, step_id: &str, state: StepState, reason: &str) {
        self.states.insert(step_id.to_string(), state);
        self.execution
            .step_executions
            .push(StepExecution::skipped(step_id, reason));
        tracing::debug!(execution_id = %self.execution.id, step_id, reason, "step skipped");
        self.publish(WorkflowEvent::StepSkipped {
            execution_id: self.execution.id,
            step_id: step_id.to_string(),
            reason: reason.to_string(),
        });
        self.after_terminal(step_id);
    }

    fn start_step(&mut self, step_id: &str) {
        let Some(step) = self.steps.get(step_id).copied() else {
            return;
        };
        self.states.insert(step_id.to_string(), StepState::Running);
        self.attempts.insert(step_id.to_string(), 1);

        if let StepConfig::Parallel {
            branches,
            wait_for_all,
        } = &step.config
        {
            self.publish(WorkflowEvent::StepStarted {
                execution_id: self.execution.id,
                step_id: step_id.to_string(),
                step_type: step.kind().to_string(),
                attempt: 1,
            });
            self.parallels.insert(
                step_id.to_string(),
                ParallelRun {
                    started_at: Utc::now(),
                    branches: branches
                        .iter()
                        .filter(|b| self.graph.contains(b))
                        .cloned()
                        .collect(),
                    wait_for_all: *wait_for_all,
                },
            );
            self.check_parallel(step_id);
            return;
        }

        self.spawn_attempt(step, 1, None);
    }

    fn spawn_attempt(&mut self, step: &'a StepDefinition, attempt: u32, delay: Option<Duration>) {
        let input = StepInput {
            execution_id: self.execution.id,
            attempt,
            depth: self.depth,
            workflow_step_timeout_secs: self.def.config.step_timeout_secs,
            context: self.ctx_tx.subscribe(),
            signals: Some(self.signals_tx.clone()),
            cancel: self.run_token.clone(),
        };
        let plan = match &step.config {
            StepConfig::Loop {
                items,
                condition,
                max_iterations,
                body,
            } => Some(LoopPlan {
                items: items.clone(),
                condition: condition.clone(),
                max_iterations: max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS),
                body: body
                    .iter()
                    .filter_map(|id| self.steps.get(id.as_str()).map(|s| (*s).clone()))
                    .filter(|s| s.enabled)
                    .collect(),
                retry_defaults: self.def.config.retry.clone(),
            }),
            _ => None,
        };

        self.dispatched_at.insert(step.id.clone(), Utc::now());
        let runner = self.orch.runner.clone();
        let events = self.orch.events.clone();
        let pause = self.control.pause_receiver();
        let step = step.clone();
        self.tasks.spawn(async move {
            attempt_task(runner, events, step, input, delay, pause, plan).await
        });
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    fn handle_report(&mut self, report: AttemptReport) {
        // Finished just as the deadline passed; already recorded as failed.
        if self.timed_out && self.state(&report.step_id).is_terminal() {
            return;
        }
        self.clear_suspension(&report.step_id);
        self.execution.step_executions.extend(report.body);

        let Some(step) = self.steps.get(report.step_id.as_str()).copied() else {
            return;
        };
        let Some(started_at) = report.started_at else {
            // Cancelled during a retry delay.
            self.states
                .insert(step.id.clone(), StepState::Failed { escalated: false });
            self.after_terminal(&step.id);
            return;
        };

        let mut record = StepExecution::start(&step.id, report.attempt, report.input);
        record.started_at = Some(started_at);

        match report.result {
            Ok(output) => {
                let value = output.to_value();
                if let Err(e) = self.ctx.set_step_output(&step.id, value.clone()) {
                    self.handle_failure(step, record, StepError::Context(e.to_string()));
                    return;
                }
                self.publish_context();
                if let Some(result) = output.branch() {
                    self.branch_results.insert(step.id.clone(), result);
                }
                record.output = Some(value);
                record.finish(StepExecutionStatus::Completed);
                self.publish(WorkflowEvent::StepCompleted {
                    execution_id: self.execution.id,
                    step_id: step.id.clone(),
                    duration_ms: record.duration_ms.unwrap_or_default(),
                });
                tracing::debug!(
                    execution_id = %self.execution.id,
                    step_id = %step.id,
                    attempt = report.attempt,
                    "step completed"
                );
                self.execution.step_executions.push(record);
                self.settle(step, StepState::Succeeded);
            }
            Err(e) => self.handle_failure(step, record, e),
        }
    }

    fn handle_failure(&mut self, step: &'a StepDefinition, mut record: StepExecution, err: StepError) {
        let message = err.to_string();
        record.error = Some(message.clone());
        let attempt = record.attempt;

        tracing::warn!(
            execution_id = %self.execution.id,
            step_id = %step.id,
            attempt,
            error = %message,
            "step failed"
        );

        let on_error = if self.stopping() || matches!(err, StepError::Cancelled) {
            OnError::Continue
        } else if self.is_race_loser(&step.id) {
            OnError::Continue
        } else {
            step.error_handling.on_error
        };

        if on_error == OnError::Retry {
            let policy = RetryHandler::effective_policy(&self.def.config.retry, step);
            let retryable = !matches!(step.config, StepConfig::Parallel { .. });
            let decision = if retryable {
                RetryHandler::decide(&policy, attempt.saturating_sub(1))
            } else {
                RetryDecision::GiveUp
            };
            match decision {
                RetryDecision::RetryAfter(delay) => {
                    self.push_failed(record, StepExecutionStatus::Failed, true);
                    tracing::info!(
                        execution_id = %self.execution.id,
                        step_id = %step.id,
                        next_attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "retrying step"
                    );
                    self.attempts.insert(step.id.clone(), attempt + 1);
                    self.spawn_attempt(step, attempt + 1, Some(delay));
                }
                RetryDecision::GiveUp => {
                    let exhausted = StepError::RetryExhausted {
                        step_id: step.id.clone(),
                        retries: attempt.saturating_sub(1),
                        last: message,
                    };
                    match self.def.config.on_retry_exhausted {
                        ExhaustedPolicy::Stop => {
                            self.push_failed(record, StepExecutionStatus::Failed, false);
                            self.settle(step, StepState::Failed { escalated: false });
                            self.set_fatal(Some(&step.id), exhausted.to_string(), exhausted.is_transient());
                        }
                        ExhaustedPolicy::Skip => {
                            self.push_failed(record, StepExecutionStatus::Skipped, false);
                            self.publish_skipped(&step.id, "retries exhausted");
                            self.settle(step, StepState::PolicySkipped);
                        }
                        ExhaustedPolicy::Continue => {
                            self.push_failed(record, StepExecutionStatus::Failed, false);
                            self.settle(step, StepState::Failed { escalated: false });
                        }
                    }
                }
            }
            return;
        }

        match on_error {
            OnError::Stop => {
                self.push_failed(record, StepExecutionStatus::Failed, false);
                self.settle(step, StepState::Failed { escalated: false });
                self.set_fatal(Some(&step.id), message, err.is_transient());
            }
            OnError::Continue | OnError::Retry => {
                self.push_failed(record, StepExecutionStatus::Failed, false);
                self.settle(step, StepState::Failed { escalated: false });
            }
            OnError::Skip => {
                self.push_failed(record, StepExecutionStatus::Skipped, false);
                self.publish_skipped(&step.id, "skipped after failure");
                self.settle(step, StepState::PolicySkipped);
            }
            OnError::Escalate => {
                let routed = step
                    .error_handling
                    .error_step
                    .as_deref()
                    .is_some_and(|target| self.graph.contains(target));
                self.push_failed(record, StepExecutionStatus::Failed, false);
                if routed {
                    tracing::info!(
                        execution_id = %self.execution.id,
                        step_id = %step.id,
                        error_step = ?step.error_handling.error_step,
                        "escalating to error step"
                    );
                    self.settle(step, StepState::Failed { escalated: true });
                } else {
                    self.settle(step, StepState::Failed { escalated: false });
                    self.set_fatal(Some(&step.id), message, err.is_transient());
                }
            }
        }
    }

    fn push_failed(&mut self, mut record: StepExecution, status: StepExecutionStatus, will_retry: bool) {
        record.finish(status);
        self.publish(WorkflowEvent::StepFailed {
            execution_id: self.execution.id,
            step_id: record.step_id.clone(),
            error: record.error.clone().unwrap_or_default(),
            will_retry,
        });
        self.execution.step_executions.push(record);
    }

    fn publish_skipped(&self, step_id: &str, reason: &str) {
        self.publish(WorkflowEvent::StepSkipped {
            execution_id: self.execution.id,
            step_id: step_id.to_string(),
            reason: reason.to_string(),
        });
    }

    fn set_fatal(&mut self, step_id: Option<&str>, message: String, recoverable: bool) {
        if self.fatal.is_none() {
            self.fatal = Some(ExecutionError {
                message,
                step_id: step_id.map(str::to_string),
                recoverable,
            });
        }
    }

    /// Record a terminal state and resolve what depends on it.
    fn settle(&mut self, step: &'a StepDefinition, state: StepState) {
        self.states.insert(step.id.clone(), state);
        if state == StepState::Succeeded {
            self.steps_completed += 1;
        }
        if state.is_success() {
            self.evaluate_guards(step);
        }
        self.after_terminal(&step.id);
    }

    fn evaluate_guards(&mut self, step: &StepDefinition) {
        for (index, next) in step.next_steps.iter().enumerate() {
            let resolution = match &next.condition {
                None => Resolution::Taken,
                Some(cond) => match evaluate_condition(cond, &self.ctx) {
                    Ok(true) => Resolution::Taken,
                    Ok(false) => Resolution::NotTaken,
                    Err(e) => {
                        tracing::warn!(
                            execution_id = %self.execution.id,
                            step_id = %step.id,
                            target = %next.step_id,
                            error = %e,
                            "next-step guard failed"
                        );
                        Resolution::Failed
                    }
                },
            };
            self.guard_results.insert((step.id.clone(), index), resolution);
        }
    }

    fn after_terminal(&mut self, step_id: &str) {
        let owners: Vec<String> = self
            .parallels
            .iter()
            .filter(|(_, p)| p.branches.iter().any(|b| b == step_id))
            .map(|(id, _)| id.clone())
            .collect();
        for owner in owners {
            self.check_parallel(&owner);
        }
    }

    fn is_race_loser(&self, step_id: &str) -> bool {
        self.races_won.iter().any(|pid| {
            self.parallels
                .get(pid)
                .is_some_and(|p| p.branches.iter().any(|b| b == step_id))
        })
    }

    // -----------------------------------------------------------------------
    // Parallel steps
    // -----------------------------------------------------------------------

    fn check_parallel(&mut self, parallel_id: &str) {
        if self.state(parallel_id).is_terminal() {
            return;
        }
        let Some(run) = self.parallels.get(parallel_id) else {
            return;
        };
        let states: Vec<(String, StepState)> = run
            .branches
            .iter()
            .map(|b| (b.clone(), self.state(b)))
            .collect();
        let all_terminal = states.iter().all(|(_, s)| s.is_terminal());

        if run.wait_for_all {
            if !all_terminal {
                return;
            }
            let failed: Vec<&str> = states
                .iter()
                .filter(|(_, s)| matches!(s, StepState::Failed { .. } | StepState::Blocked))
                .map(|(id, _)| id.as_str())
                .collect();
            if failed.is_empty() {
                let outputs: Map<String, Value> = states
                    .iter()
                    .map(|(id, _)| (id.clone(), self.ctx.step_output(id).cloned().unwrap_or(Value::Null)))
                    .collect();
                self.complete_parallel(parallel_id, json!({ "branches": outputs }));
            } else {
                let err = StepError::BranchFailed(failed.join(", "));
                self.fail_parallel(parallel_id, err);
            }
            return;
        }

        if let Some((winner, _)) = states.iter().find(|(_, s)| s.is_success()) {
            let output = self.ctx.step_output(winner).cloned().unwrap_or(Value::Null);
            let winner = winner.clone();
            self.races_won.insert(parallel_id.to_string());
            tracing::debug!(execution_id = %self.execution.id, step_id = parallel_id, %winner, "race won");
            self.complete_parallel(parallel_id, json!({ "winner": winner, "output": output }));
        } else if all_terminal {
            self.fail_parallel(parallel_id, StepError::BranchFailed("no branch succeeded".to_string()));
        }
    }

    fn parallel_record(&self, parallel_id: &str) -> StepExecution {
        let mut record = StepExecution::start(parallel_id, 1, None);
        if let Some(run) = self.parallels.get(parallel_id) {
            record.started_at = Some(run.started_at);
        }
        record
    }

    fn complete_parallel(&mut self, parallel_id: &str, output: Value) {
        let Some(step) = self.steps.get(parallel_id).copied() else {
            return;
        };
        let mut record = self.parallel_record(parallel_id);
        if let Err(e) = self.ctx.set_step_output(parallel_id, output.clone()) {
            self.handle_failure(step, record, StepError::Context(e.to_string()));
            return;
        }
        self.publish_context();
        record.output = Some(output);
        record.finish(StepExecutionStatus::Completed);
        self.publish(WorkflowEvent::StepCompleted {
            execution_id: self.execution.id,
            step_id: parallel_id.to_string(),
            duration_ms: record.duration_ms.unwrap_or_default(),
        });
        self.execution.step_executions.push(record);
        self.settle(step, StepState::Succeeded);
    }

    fn fail_parallel(&mut self, parallel_id: &str, err: StepError) {
        let Some(step) = self.steps.get(parallel_id).copied() else {
            return;
        };
        let record = self.parallel_record(parallel_id);
        self.handle_failure(step, record, err);
    }

    // -----------------------------------------------------------------------
    // Context and suspensions
    // -----------------------------------------------------------------------

    fn publish_context(&self) {
        self.ctx_tx.send_replace(Arc::new(self.ctx.clone()));
    }

    fn handle_signal(&mut self, signal: StepSignal) {
        match signal {
            StepSignal::Suspended {
                step_id,
                reason,
                deadline,
            } => {
                // A late signal from a finished step is stale.
                if self.state(&step_id).is_terminal() {
                    return;
                }
                self.execution.suspensions.retain(|s| s.step_id != step_id);
                self.execution.suspensions.push(Suspension {
                    step_id: step_id.clone(),
                    reason: reason.clone(),
                    since: Utc::now(),
                    deadline,
                });
                self.publish(WorkflowEvent::StepSuspended {
                    execution_id: self.execution.id,
                    step_id,
                    reason,
                });
            }
            StepSignal::Escalated {
                step_id,
                task_id,
                escalate_to,
            } => {
                self.publish(WorkflowEvent::HumanTaskEscalated {
                    execution_id: self.execution.id,
                    step_id,
                    task_id,
                    escalate_to,
                });
            }
        }
    }

    fn clear_suspension(&mut self, step_id: &str) {
        self.execution.suspensions.retain(|s| s.step_id != step_id);
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Wait until the execution is not paused. Returns `false` on cancellation.
async fn wait_unpaused(pause: &mut watch::Receiver<bool>, cancel: &CancellationToken) -> bool {
    loop {
        if !*pause.borrow_and_update() {
            return true;
        }
        tokio::select! {
            changed = pause.changed() => {
                if changed.is_err() {
                    return true;
                }
            }
            _ = cancel.cancelled() => return false,
        }
    }
}

/// Sleep for a retry delay. Returns `false` on cancellation.
async fn backoff(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}

async fn attempt_task(
    runner: Arc<StepRunner>,
    events: EventBus,
    step: StepDefinition,
    input: StepInput,
    delay: Option<Duration>,
    mut pause: watch::Receiver<bool>,
    plan: Option<LoopPlan>,
) -> AttemptReport {
    let not_started = |step_id: String, attempt: u32| AttemptReport {
        step_id,
        attempt,
        started_at: None,
        input: None,
        result: Err(StepError::Cancelled),
        body: Vec::new(),
    };

    if let Some(delay) = delay {
        if !backoff(delay, &input.cancel).await || !wait_unpaused(&mut pause, &input.cancel).await {
            return not_started(step.id, input.attempt);
        }
    }

    events.publish(WorkflowEvent::StepStarted {
        execution_id: input.execution_id,
        step_id: step.id.clone(),
        step_type: step.kind().to_string(),
        attempt: input.attempt,
    });
    tracing::debug!(
        execution_id = %input.execution_id,
        step_id = %step.id,
        attempt = input.attempt,
        "step started"
    );

    let started_at = Utc::now();
    let snapshot = Value::Object(input.snapshot().variables.clone());
    let mut body = Vec::new();
    let result = match plan {
        Some(plan) => run_loop(&runner, &events, &step, &plan, &input, &mut body).await,
        None => runner.execute(&step, &input).await,
    };

    AttemptReport {
        step_id: step.id,
        attempt: input.attempt,
        started_at: Some(started_at),
        input: Some(snapshot),
        result,
        body,
    }
}

/// Resolve a loop's `items` reference to an array.
fn loop_items(ctx: &ExecutionContext, reference: &str) -> Result<Vec<Value>, StepError> {
    let path = reference
        .trim()
        .trim_start_matches("{{")
        .trim_end_matches("}}")
        .trim();
    let value = match ctx.lookup(path) {
        Some(v) => v,
        None => WorkflowEvaluator::new()
            .evaluate_value(path, &ctx.to_expression_context())
            .map_err(StepError::from)?,
    };
    match value {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        other => Err(StepError::Template(format!(
            "loop items '{reference}' is not an array (got {})",
            type_name(&other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Run a loop's body sequentially per iteration on a private copy of the
/// context. Body attempts are appended to `records`.
async fn run_loop(
    runner: &StepRunner,
    events: &EventBus,
    loop_step: &StepDefinition,
    plan: &LoopPlan,
    input: &StepInput,
    records: &mut Vec<StepExecution>,
) -> Result<StepOutput, StepError> {
    let mut ctx: ExecutionContext = (*input.snapshot()).clone();
    let items = plan.items.as_deref().map(|r| loop_items(&ctx, r)).transpose()?;
    let mut results = Vec::new();
    let mut index: u32 = 0;

    while index < plan.max_iterations {
        let item = match &items {
            Some(list) => match list.get(index as usize) {
                Some(item) => item.clone(),
                None => break,
            },
            None => Value::Null,
        };
        ctx.set_variable("loop", json!({ "index": index, "item": item }));
        if let Some(cond) = &plan.condition {
            if !evaluate_condition(cond, &ctx)? {
                break;
            }
        }

        let mut iteration = Map::new();
        for body_step in &plan.body {
            if input.cancel.is_cancelled() {
                return Err(StepError::Cancelled);
            }
            if let Some(output) = run_body_step(runner, events, body_step, plan, &ctx, input, index, records).await? {
                ctx.set_step_output(&body_step.id, output.clone())
                    .map_err(|e| StepError::Context(e.to_string()))?;
                iteration.insert(body_step.id.clone(), output);
            }
        }
        results.push(Value::Object(iteration));
        index += 1;
    }

    tracing::debug!(
        execution_id = %input.execution_id,
        step_id = %loop_step.id,
        iterations = index,
        "loop finished"
    );
    ctx.remove_variable("loop");
    Ok(StepOutput::Value(json!({
        "iterations": index,
        "results": results,
    })))
}

/// Run one body step with its own retry policy. `Ok(None)` means the step
/// failed but its policy lets the loop carry on.
#[allow(clippy::too_many_arguments)]
async fn run_body_step(
    runner: &StepRunner,
    events: &EventBus,
    step: &StepDefinition,
    plan: &LoopPlan,
    ctx: &ExecutionContext,
    input: &StepInput,
    iteration: u32,
    records: &mut Vec<StepExecution>,
) -> Result<Option<Value>, StepError> {
    let (_tx, rx) = watch::channel(Arc::new(ctx.clone()));
    let policy = RetryHandler::effective_policy(&plan.retry_defaults, step);
    let mut attempt = 1;

    loop {
        let body_input = StepInput {
            attempt,
            context: rx.clone(),
            ..input.clone()
        };
        events.publish(WorkflowEvent::StepStarted {
            execution_id: input.execution_id,
            step_id: step.id.clone(),
            step_type: step.kind().to_string(),
            attempt,
        });
        let mut record = StepExecution::start(&step.id, attempt, None);
        record.logs.push(format!("iteration {iteration}"));

        let err = match runner.execute(step, &body_input).await {
            Ok(output) => {
                let value = output.to_value();
                record.output = Some(value.clone());
                record.finish(StepExecutionStatus::Completed);
                events.publish(WorkflowEvent::StepCompleted {
                    execution_id: input.execution_id,
                    step_id: step.id.clone(),
                    duration_ms: record.duration_ms.unwrap_or_default(),
                });
                records.push(record);
                return Ok(Some(value));
            }
            Err(e) => e,
        };

        record.error = Some(err.to_string());
        let retry = match step.error_handling.on_error {
            OnError::Retry if !matches!(err, StepError::Cancelled) => {
                RetryHandler::decide(&policy, attempt - 1)
            }
            _ => RetryDecision::GiveUp,
        };
        let will_retry = matches!(retry, RetryDecision::RetryAfter(_));
        let status = match step.error_handling.on_error {
            OnError::Skip => StepExecutionStatus::Skipped,
            _ => StepExecutionStatus::Failed,
        };
        record.finish(status);
        events.publish(WorkflowEvent::StepFailed {
            execution_id: input.execution_id,
            step_id: step.id.clone(),
            error: err.to_string(),
            will_retry,
        });
        records.push(record);

        match (step.error_handling.on_error, retry) {
            (_, RetryDecision::RetryAfter(delay)) => {
                if !backoff(delay, &input.cancel).await {
                    return Err(StepError::Cancelled);
                }
                attempt += 1;
            }
            (_, RetryDecision::GiveUp) if matches!(err, StepError::Cancelled) => return Err(err),
            (OnError::Continue | OnError::Skip, _) => return Ok(None),
            (OnError::Retry, RetryDecision::GiveUp) => {
                return Err(StepError::RetryExhausted {
                    step_id: step.id.clone(),
                    retries: attempt - 1,
                    last: err.to_string(),
                });
            }
            (OnError::Stop | OnError::Escalate, _) => return Err(err),
        }
    }
}

/// Pull a value out of a step output by dotted path, for tests and callers
/// inspecting execution results.
pub fn output_field<'v>(execution: &'v Execution, step_id: &str, path: &str) -> Option<&'v Value> {
    let output = execution
        .step_executions
        .iter()
        .rev()
        .find(|s| s.step_id == step_id && s.status == StepExecutionStatus::Completed)?
        .output
        .as_ref()?;
    if path.is_empty() {
        Some(output)
    } else {
        lookup_path(output, path)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
