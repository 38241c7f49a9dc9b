//! Event types for the Stepwise event bus.
//!
//! `WorkflowEvent` is the unified event type broadcast while executions run.
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events emitted during workflow execution.
///
/// Subscribers (loggers, UIs, tests) receive these through the event bus.
/// Delivery is best-effort: slow subscribers may miss events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    // -- Trigger events --
    /// A trigger matched and produced a firing.
    TriggerFired {
        workflow_id: Uuid,
        trigger_id: String,
        trigger_type: String,
    },

    /// Trigger evaluation failed; no execution was started.
    TriggerFailed {
        workflow_id: Uuid,
        trigger_id: String,
        error: String,
    },

    // -- Execution lifecycle --
    /// An execution is waiting for a concurrency slot.
    ExecutionQueued {
        execution_id: Uuid,
        workflow_id: Uuid,
        position: usize,
    },

    /// An execution has started running.
    ExecutionStarted {
        execution_id: Uuid,
        workflow_id: Uuid,
        workflow_name: String,
        trigger_type: String,
    },

    /// An execution completed successfully.
    ExecutionCompleted {
        execution_id: Uuid,
        workflow_id: Uuid,
        duration_ms: u64,
        steps_completed: u32,
    },

    /// An execution failed.
    ExecutionFailed {
        execution_id: Uuid,
        workflow_id: Uuid,
        step_id: Option<String>,
        error: String,
        recoverable: bool,
    },

    /// An execution was cancelled.
    ExecutionCancelled {
        execution_id: Uuid,
        workflow_id: Uuid,
    },

    /// An execution was paused; no new steps are scheduled.
    ExecutionPaused {
        execution_id: Uuid,
        workflow_id: Uuid,
    },

    /// A paused execution resumed scheduling.
    ExecutionResumed {
        execution_id: Uuid,
        workflow_id: Uuid,
    },

    // -- Step lifecycle --
    /// A step attempt has started.
    StepStarted {
        execution_id: Uuid,
        step_id: String,
        step_type: String,
        attempt: u32,
    },

    /// A step attempt completed successfully.
    StepCompleted {
        execution_id: Uuid,
        step_id: String,
        duration_ms: u64,
    },

    /// A step attempt failed.
    StepFailed {
        execution_id: Uuid,
        step_id: String,
        error: String,
        will_retry: bool,
    },

    /// A step was skipped by policy or because it was not reached.
    StepSkipped {
        execution_id: Uuid,
        step_id: String,
        reason: String,
    },

    /// A step is parked on an external event (human task, wait).
    StepSuspended {
        execution_id: Uuid,
        step_id: String,
        reason: String,
    },

    /// A human task was reassigned after its escalation delay.
    HumanTaskEscalated {
        execution_id: Uuid,
        step_id: String,
        task_id: String,
        escalate_to: Vec<String>,
    },
}

impl WorkflowEvent {
    /// Returns the execution_id from variants that carry one, or None for
    /// trigger-scoped events.
    pub fn execution_id(&self) -> Option<Uuid> {
        match self {
            WorkflowEvent::ExecutionQueued { execution_id, .. }
            | WorkflowEvent::ExecutionStarted { execution_id, .. }
            | WorkflowEvent::ExecutionCompleted { execution_id, .. }
            | WorkflowEvent::ExecutionFailed { execution_id, .. }
            | WorkflowEvent::ExecutionCancelled { execution_id, .. }
            | WorkflowEvent::ExecutionPaused { execution_id, .. }
            | WorkflowEvent::ExecutionResumed { execution_id, .. }
            | WorkflowEvent::StepStarted { execution_id, .. }
            | WorkflowEvent::StepCompleted { execution_id, .. }
            | WorkflowEvent::StepFailed { execution_id, .. }
            | WorkflowEvent::StepSkipped { execution_id, .. }
            | WorkflowEvent::StepSuspended { execution_id, .. }
            | WorkflowEvent::HumanTaskEscalated { execution_id, .. } => Some(*execution_id),

            WorkflowEvent::TriggerFired { .. } | WorkflowEvent::TriggerFailed { .. } => None,
        }
    }

    /// Whether this event ends an execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowEvent::ExecutionCompleted { .. }
                | WorkflowEvent::ExecutionFailed { .. }
                | WorkflowEvent::ExecutionCancelled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_started_serde_tag() {
        let event = WorkflowEvent::ExecutionStarted {
            execution_id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            workflow_name: "daily-report".to_string(),
            trigger_type: "scheduled".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"execution_started\""));
        let parsed: WorkflowEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, WorkflowEvent::ExecutionStarted { .. }));
    }

    #[test]
    fn test_step_failed_carries_will_retry() {
        let event = WorkflowEvent::StepFailed {
            execution_id: Uuid::now_v7(),
            step_id: "call-api".to_string(),
            error: "connection timeout".to_string(),
            will_retry: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"step_failed\""));
        let parsed: WorkflowEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            parsed,
            WorkflowEvent::StepFailed {
                will_retry: true,
                ..
            }
        ));
    }

    #[test]
    fn test_execution_id_accessor() {
        let id = Uuid::now_v7();
        let event = WorkflowEvent::StepSkipped {
            execution_id: id,
            step_id: "b".to_string(),
            reason: "branch not taken".to_string(),
        };
        assert_eq!(event.execution_id(), Some(id));

        let trigger = WorkflowEvent::TriggerFailed {
            workflow_id: Uuid::now_v7(),
            trigger_id: "t".to_string(),
            error: "bad cron".to_string(),
        };
        assert_eq!(trigger.execution_id(), None);
    }

    #[test]
    fn test_terminal_events() {
        let completed = WorkflowEvent::ExecutionCompleted {
            execution_id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            duration_ms: 10,
            steps_completed: 1,
        };
        assert!(completed.is_terminal());
        let paused = WorkflowEvent::ExecutionPaused {
            execution_id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
        };
        assert!(!paused.is_terminal());
    }
}
