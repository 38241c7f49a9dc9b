//! Clock ticks for scheduled triggers, driven by `tokio-cron-scheduler`.
//!
//! The engine decides which scheduled triggers match a tick (cron
//! expression, timezone, date bounds, run limits) and dedupes per schedule
//! slot, so this source only has to deliver the wall clock at a steady
//! cadence. Each tick also flushes debounced trigger firings.

use std::sync::Arc;

use chrono::Utc;
use stepwise_core::repository::workflow::WorkflowRepository;
use stepwise_core::workflow::engine::WorkflowEngine;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// Errors that can occur while running the tick source.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Failed to create, start, or stop the underlying scheduler.
    #[error("scheduler error: {0}")]
    JobError(String),

    /// The tick cadence is not a valid cron expression.
    #[error("invalid tick cadence: {0}")]
    InvalidCadence(String),
}

/// Every second; six-field cron with seconds.
pub const EVERY_SECOND: &str = "* * * * * *";

/// Delivers `WorkflowEngine::tick` on a cron cadence.
pub struct CronTickSource {
    scheduler: JobScheduler,
    job_id: Uuid,
}

impl CronTickSource {
    /// Start ticking `engine` every second.
    pub async fn start<R: WorkflowRepository + 'static>(engine: Arc<WorkflowEngine<R>>) -> Result<Self, SchedulerError> {
        Self::start_with_cadence(engine, EVERY_SECOND).await
    }

    /// Start ticking `engine` on a custom six-field cron cadence.
    ///
    /// A cadence coarser than the finest trigger schedule makes those
    /// triggers miss slots.
    pub async fn start_with_cadence<R: WorkflowRepository + 'static>(
        engine: Arc<WorkflowEngine<R>>,
        cadence: &str,
    ) -> Result<Self, SchedulerError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| SchedulerError::JobError(e.to_string()))?;

        let job = Job::new_async(cadence, move |_uuid, _lock| {
            let engine = engine.clone();
            Box::pin(async move {
                let at = Utc::now();
                let report = engine.tick(at).await;
                if !report.started.is_empty() || !report.errors.is_empty() {
                    tracing::debug!(
                        %at,
                        started = report.started.len(),
                        errors = report.errors.len(),
                        "tick delivered"
                    );
                }
            })
        })
        .map_err(|e| SchedulerError::InvalidCadence(format!("{cadence}: {e}")))?;

        let job_id = job.guid();
        scheduler
            .add(job)
            .await
            .map_err(|e| SchedulerError::JobError(e.to_string()))?;
        scheduler
            .start()
            .await
            .map_err(|e| SchedulerError::JobError(e.to_string()))?;

        tracing::info!(%job_id, cadence, "tick source started");
        Ok(Self { scheduler, job_id })
    }

    /// Stop ticking. Executions already started keep running.
    pub async fn stop(mut self) -> Result<(), SchedulerError> {
        self.scheduler
            .remove(&self.job_id)
            .await
            .map_err(|e| SchedulerError::JobError(e.to_string()))?;
        self.scheduler
            .shutdown()
            .await
            .map_err(|e| SchedulerError::JobError(e.to_string()))?;
        tracing::info!(job_id = %self.job_id, "tick source stopped");
        Ok(())
    }
}
