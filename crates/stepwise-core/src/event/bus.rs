//! Lifecycle event fan-out.
//!
//! The engine and orchestrator publish every [`WorkflowEvent`] on one
//! `tokio::sync::broadcast` channel. Subscribers that fall behind lose the
//! oldest events (`Lagged`) instead of slowing executions down.

use stepwise_types::event::WorkflowEvent;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

/// Broadcast channel carrying workflow lifecycle events.
///
/// Clones share the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    /// A zero capacity is raised to 1.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    /// Follow one execution until its terminal event.
    ///
    /// Subscribe before starting the execution, or early events are missed.
    pub fn watch_execution(&self, execution_id: Uuid) -> ExecutionWatch {
        ExecutionWatch {
            execution_id,
            receiver: self.sender.subscribe(),
            finished: false,
        }
    }

    /// Dropped silently when nobody is listening.
    pub fn publish(&self, event: WorkflowEvent) {
        if let Err(err) = self.sender.send(event) {
            tracing::trace!(event = ?err.0, "no event subscribers");
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

/// Events of a single execution, ending after its terminal event.
pub struct ExecutionWatch {
    execution_id: Uuid,
    receiver: broadcast::Receiver<WorkflowEvent>,
    finished: bool,
}

impl ExecutionWatch {
    /// Next event for the watched execution, or `None` once the execution
    /// ended or the bus was dropped. Lag is logged and skipped.
    pub async fn next(&mut self) -> Option<WorkflowEvent> {
        if self.finished {
            return None;
        }
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.execution_id() == Some(self.execution_id) => {
                    self.finished = event.is_terminal();
                    return Some(event);
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(execution_id = %self.execution_id, missed, "execution watch lagged");
                }
                Err(RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skipped(execution_id: Uuid, step_id: &str) -> WorkflowEvent {
        WorkflowEvent::StepSkipped {
            execution_id,
            step_id: step_id.to_string(),
            reason: "branch not taken".to_string(),
        }
    }

    fn completed(execution_id: Uuid) -> WorkflowEvent {
        WorkflowEvent::ExecutionCompleted {
            execution_id,
            workflow_id: Uuid::now_v7(),
            duration_ms: 5,
            steps_completed: 1,
        }
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_the_event() {
        let bus = EventBus::new(16);
        let mut first = bus.subscribe();
        let mut second = bus.clone().subscribe();

        bus.publish(skipped(Uuid::now_v7(), "notify"));

        assert!(matches!(first.recv().await.unwrap(), WorkflowEvent::StepSkipped { .. }));
        assert!(second.recv().await.is_ok());
        assert_eq!(bus.receiver_count(), 2);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(0);
        bus.publish(skipped(Uuid::now_v7(), "notify"));
        assert_eq!(bus.receiver_count(), 0);
        assert!(format!("{bus:?}").contains("receiver_count"));
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        let execution_id = Uuid::now_v7();
        for i in 0..10 {
            bus.publish(skipped(execution_id, &format!("s{i}")));
        }
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(n)) if n > 0
        ));
    }

    #[tokio::test]
    async fn test_watch_filters_and_stops_at_terminal_event() {
        let bus = EventBus::new(16);
        let mine = Uuid::now_v7();
        let mut watch = bus.watch_execution(mine);

        bus.publish(skipped(Uuid::now_v7(), "other"));
        bus.publish(skipped(mine, "review"));
        bus.publish(completed(mine));
        bus.publish(skipped(mine, "late"));

        assert!(matches!(
            watch.next().await,
            Some(WorkflowEvent::StepSkipped { step_id, .. }) if step_id == "review"
        ));
        assert!(matches!(watch.next().await, Some(WorkflowEvent::ExecutionCompleted { .. })));
        assert!(watch.next().await.is_none());
        assert_eq!(watch.execution_id(), mine);
    }

    #[tokio::test]
    async fn test_watch_ends_when_bus_dropped() {
        let bus = EventBus::new(4);
        let mut watch = bus.watch_execution(Uuid::now_v7());
        drop(bus);
        assert!(watch.next().await.is_none());
    }
}
