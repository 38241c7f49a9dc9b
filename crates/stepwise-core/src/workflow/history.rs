//! Execution history and analytics kept on the workflow aggregate.
//!
//! Terminal executions are appended to `WorkflowDefinition::executions`
//! (newest last) and folded into the workflow and per-step counters. History
//! is capped by count and, optionally, by age; pruning never touches the
//! definition's identity, configuration, or accumulated analytics.

use chrono::{DateTime, Duration, Utc};
use stepwise_types::config::HistoryRetention;
use stepwise_types::workflow::{
    Execution, ExecutionStatus, StepExecutionStatus, StepStats, WorkflowAnalytics,
    WorkflowDefinition,
};

/// Fold a terminal execution into the workflow's history and analytics.
///
/// Returns the number of executions pruned by retention. Recording the same
/// execution twice replaces the stored copy without counting it again.
pub fn record_execution(
    def: &mut WorkflowDefinition,
    execution: Execution,
    retention: &HistoryRetention,
    now: DateTime<Utc>,
) -> usize {
    if let Some(existing) = def.executions.iter_mut().find(|e| e.id == execution.id) {
        *existing = execution;
        return prune_history(def, retention, now);
    }

    if execution.status.is_terminal() {
        update_analytics(&mut def.analytics, &execution);
        for record in &execution.step_executions {
            if let Some(step) = def.steps.iter_mut().find(|s| s.id == record.step_id) {
                update_step_stats(&mut step.stats, record.status, record.duration_ms, record.completed_at);
            }
        }
    }

    tracing::debug!(
        workflow_id = %def.id,
        execution_id = %execution.id,
        status = %execution.status,
        "execution recorded"
    );
    def.executions.push(execution);
    def.updated_at = now;
    prune_history(def, retention, now)
}

/// Drop executions beyond the retention limits, oldest first.
pub fn prune_history(def: &mut WorkflowDefinition, retention: &HistoryRetention, now: DateTime<Utc>) -> usize {
    let before = def.executions.len();

    if let Some(days) = retention.max_age_days {
        let cutoff = now - Duration::days(i64::from(days));
        def.executions.retain(|e| {
            !e.status.is_terminal() || e.completed_at.unwrap_or(e.queued_at) >= cutoff
        });
    }

    let max = retention.max_executions;
    if def.executions.len() > max {
        let excess = def.executions.len() - max;
        def.executions.drain(..excess);
    }

    let pruned = before - def.executions.len();
    if pruned > 0 {
        tracing::debug!(workflow_id = %def.id, pruned, "execution history pruned");
    }
    pruned
}

fn update_analytics(analytics: &mut WorkflowAnalytics, execution: &Execution) {
    analytics.total_executions += 1;
    match execution.status {
        ExecutionStatus::Completed => analytics.successful_executions += 1,
        ExecutionStatus::Failed => analytics.failed_executions += 1,
        ExecutionStatus::Cancelled => analytics.cancelled_executions += 1,
        _ => {}
    }
    if let Some(duration) = execution.duration_ms {
        analytics.average_duration_ms = running_mean(
            analytics.average_duration_ms,
            analytics.total_executions,
            duration,
        );
    }
    analytics.last_executed_at = execution.completed_at.or(execution.started_at);
}

fn update_step_stats(
    stats: &mut StepStats,
    status: StepExecutionStatus,
    duration_ms: Option<u64>,
    at: Option<DateTime<Utc>>,
) {
    stats.total_executions += 1;
    match status {
        StepExecutionStatus::Completed => stats.successful_executions += 1,
        StepExecutionStatus::Failed => stats.failed_executions += 1,
        StepExecutionStatus::Skipped => stats.skipped_executions += 1,
        _ => {}
    }
    if matches!(status, StepExecutionStatus::Completed | StepExecutionStatus::Failed) {
        let attempted = stats.successful_executions + stats.failed_executions;
        stats.average_duration_ms = running_mean(stats.average_duration_ms, attempted, duration_ms.unwrap_or(0));
    }
    if at.is_some() {
        stats.last_executed_at = at;
    }
}

/// Mean after adding `sample` as the `count`-th observation.
fn running_mean(mean: u64, count: u64, sample: u64) -> u64 {
    if count <= 1 {
        return sample;
    }
    let total = u128::from(mean) * u128::from(count - 1) + u128::from(sample);
    (total / u128::from(count)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::testing::{action, workflow};
    use serde_json::json;
    use stepwise_types::workflow::{StepExecution, TriggerProvenance};

    fn finished(def: &WorkflowDefinition, status: ExecutionStatus, duration_ms: u64) -> Execution {
        let mut exec = Execution::new(def.id, def.version, TriggerProvenance::manual(), json!({}));
        exec.transition(ExecutionStatus::Running).unwrap();
        exec.transition(status).unwrap();
        exec.duration_ms = Some(duration_ms);
        exec
    }

    fn retention(max_executions: usize) -> HistoryRetention {
        HistoryRetention {
            max_executions,
            max_age_days: None,
        }
    }

    #[test]
    fn test_analytics_counts_by_status() {
        let mut def = workflow(vec![action("a", 1)]);
        let keep = retention(100);
        for (status, ms) in [
            (ExecutionStatus::Completed, 100),
            (ExecutionStatus::Failed, 200),
            (ExecutionStatus::Cancelled, 300),
        ] {
            let exec = finished(&def, status, ms);
            record_execution(&mut def, exec, &keep, Utc::now());
        }

        let a = &def.analytics;
        assert_eq!(a.total_executions, 3);
        assert_eq!(a.successful_executions, 1);
        assert_eq!(a.failed_executions, 1);
        assert_eq!(a.cancelled_executions, 1);
        assert_eq!(a.average_duration_ms, 200);
        assert!(a.last_executed_at.is_some());
        assert_eq!(def.executions.len(), 3);
    }

    #[test]
    fn test_recording_twice_does_not_double_count() {
        let mut def = workflow(vec![action("a", 1)]);
        let exec = finished(&def, ExecutionStatus::Completed, 10);
        record_execution(&mut def, exec.clone(), &retention(100), Utc::now());
        record_execution(&mut def, exec, &retention(100), Utc::now());
        assert_eq!(def.analytics.total_executions, 1);
        assert_eq!(def.executions.len(), 1);
    }

    #[test]
    fn test_retention_caps_count_oldest_first() {
        let mut def = workflow(vec![action("a", 1)]);
        let mut ids = Vec::new();
        for _ in 0..5 {
            let exec = finished(&def, ExecutionStatus::Completed, 1);
            ids.push(exec.id);
            record_execution(&mut def, exec, &retention(3), Utc::now());
        }
        let kept: Vec<_> = def.executions.iter().map(|e| e.id).collect();
        assert_eq!(kept, ids[2..].to_vec());
        // Analytics survive pruning.
        assert_eq!(def.analytics.total_executions, 5);
    }

    #[test]
    fn test_retention_by_age() {
        let mut def = workflow(vec![action("a", 1)]);
        let mut old = finished(&def, ExecutionStatus::Completed, 1);
        old.completed_at = Some(Utc::now() - Duration::days(40));
        def.executions.push(old);
        let fresh = finished(&def, ExecutionStatus::Completed, 1);
        let fresh_id = fresh.id;

        let pruned = record_execution(
            &mut def,
            fresh,
            &HistoryRetention {
                max_executions: 100,
                max_age_days: Some(30),
            },
            Utc::now(),
        );
        assert_eq!(pruned, 1);
        assert_eq!(def.executions.len(), 1);
        assert_eq!(def.executions[0].id, fresh_id);
    }

    #[test]
    fn test_step_stats_updated_per_attempt() {
        let mut def = workflow(vec![action("a", 1), action("b", 2)]);
        let mut exec = finished(&def, ExecutionStatus::Completed, 50);

        let mut failed = StepExecution::start("a", 1, None);
        failed.finish(StepExecutionStatus::Failed);
        failed.duration_ms = Some(30);
        let mut ok = StepExecution::start("a", 2, None);
        ok.finish(StepExecutionStatus::Completed);
        ok.duration_ms = Some(10);
        exec.step_executions = vec![failed, ok, StepExecution::skipped("b", "branch not taken")];

        record_execution(&mut def, exec, &retention(10), Utc::now());
        let a = &def.step("a").unwrap().stats;
        assert_eq!(a.total_executions, 2);
        assert_eq!(a.failed_executions, 1);
        assert_eq!(a.successful_executions, 1);
        assert_eq!(a.average_duration_ms, 20);
        let b = &def.step("b").unwrap().stats;
        assert_eq!(b.skipped_executions, 1);
        assert_eq!(b.average_duration_ms, 0);
    }

    #[test]
    fn test_running_mean() {
        assert_eq!(running_mean(0, 1, 40), 40);
        assert_eq!(running_mean(40, 2, 20), 30);
        assert_eq!(running_mean(u64::MAX, 2, u64::MAX), u64::MAX);
    }
}
