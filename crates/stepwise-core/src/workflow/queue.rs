//! Per-workflow admission queue bounding concurrent executions.
//!
//! Executions beyond `max_concurrent` wait instead of being rejected. When a
//! running execution drops its [`QueuePermit`], the slot is handed directly
//! to the next waiter chosen by the workflow's [`QueueDiscipline`].

use std::sync::{Arc, Mutex, MutexGuard};

use stepwise_types::workflow::QueueDiscipline;
use tokio::sync::oneshot;
use uuid::Uuid;

/// The waiter was removed before it was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("execution {0} was withdrawn from the queue")]
pub struct QueueWithdrawn(pub Uuid);

#[derive(Debug)]
struct Waiter {
    execution_id: Uuid,
    priority: i32,
    seq: u64,
    tx: oneshot::Sender<()>,
}

#[derive(Debug)]
struct QueueState {
    max_concurrent: Option<usize>,
    discipline: QueueDiscipline,
    running: usize,
    seq: u64,
    waiters: Vec<Waiter>,
}

impl QueueState {
    fn has_capacity(&self) -> bool {
        self.max_concurrent.is_none_or(|max| self.running < max)
    }

    /// Index of the waiter that should be admitted next.
    fn next_index(&self) -> Option<usize> {
        let iter = self.waiters.iter().enumerate();
        let picked = match self.discipline {
            QueueDiscipline::Fifo => iter.min_by_key(|(_, w)| w.seq),
            QueueDiscipline::Lifo => iter.max_by_key(|(_, w)| w.seq),
            QueueDiscipline::Priority => {
                iter.max_by(|(_, a), (_, b)| a.priority.cmp(&b.priority).then(b.seq.cmp(&a.seq)))
            }
        };
        picked.map(|(i, _)| i)
    }

    /// 1-based position of a queued execution in admission order.
    fn position_of(&self, execution_id: Uuid) -> usize {
        let mut order: Vec<&Waiter> = self.waiters.iter().collect();
        match self.discipline {
            QueueDiscipline::Fifo => order.sort_by_key(|w| w.seq),
            QueueDiscipline::Lifo => order.sort_by_key(|w| std::cmp::Reverse(w.seq)),
            QueueDiscipline::Priority => {
                order.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)))
            }
        }
        order
            .iter()
            .position(|w| w.execution_id == execution_id)
            .map(|p| p + 1)
            .unwrap_or(0)
    }
}

/// Admission queue shared by all executions of one workflow.
#[derive(Debug, Clone)]
pub struct ExecutionQueue {
    state: Arc<Mutex<QueueState>>,
}

/// Result of asking for a slot.
#[derive(Debug)]
pub enum Admission {
    /// A slot was free.
    Ready(QueuePermit),
    /// All slots are busy; await the ticket.
    Queued { position: usize, ticket: QueueTicket },
}

impl ExecutionQueue {
    pub fn new(max_concurrent: Option<u32>, discipline: QueueDiscipline) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                max_concurrent: max_concurrent.map(|m| m.max(1) as usize),
                discipline,
                running: 0,
                seq: 0,
                waiters: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        lock_state(&self.state)
    }

    /// Apply new limits from an updated definition; extra capacity is
    /// handed to waiters immediately.
    pub fn reconfigure(&self, max_concurrent: Option<u32>, discipline: QueueDiscipline) {
        let mut state = self.lock();
        state.max_concurrent = max_concurrent.map(|m| m.max(1) as usize);
        state.discipline = discipline;
        while state.has_capacity() && admit_next(&mut state) {}
    }

    /// Request a slot for an execution.
    pub fn admit(&self, execution_id: Uuid, priority: i32) -> Admission {
        let mut state = self.lock();
        if state.has_capacity() && state.waiters.is_empty() {
            state.running += 1;
            return Admission::Ready(QueuePermit {
                state: Some(self.state.clone()),
            });
        }

        let (tx, rx) = oneshot::channel();
        state.seq += 1;
        let seq = state.seq;
        state.waiters.push(Waiter {
            execution_id,
            priority,
            seq,
            tx,
        });
        let position = state.position_of(execution_id);
        tracing::debug!(%execution_id, position, "execution queued");
        Admission::Queued {
            position,
            ticket: QueueTicket {
                execution_id,
                rx: Some(rx),
                state: self.state.clone(),
            },
        }
    }

    pub fn running(&self) -> usize {
        self.lock().running
    }

    pub fn waiting(&self) -> usize {
        self.lock().waiters.len()
    }
}

fn lock_state(state: &Mutex<QueueState>) -> MutexGuard<'_, QueueState> {
    // A panic while holding the lock leaves counters intact; keep going.
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Hand a free slot to the next live waiter. Returns `true` if one took it.
fn admit_next(state: &mut QueueState) -> bool {
    while let Some(index) = state.next_index() {
        let waiter = state.waiters.remove(index);
        if waiter.tx.send(()).is_ok() {
            state.running += 1;
            return true;
        }
    }
    false
}

fn release(state: &Mutex<QueueState>) {
    let mut state = lock_state(state);
    state.running = state.running.saturating_sub(1);
    if state.has_capacity() {
        admit_next(&mut state);
    }
}

/// A held execution slot; dropping it admits the next waiter.
#[derive(Debug)]
pub struct QueuePermit {
    state: Option<Arc<Mutex<QueueState>>>,
}

impl QueuePermit {
    /// A permit not backed by any queue.
    pub fn detached() -> Self {
        Self { state: None }
    }
}

impl Drop for QueuePermit {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            release(&state);
        }
    }
}

/// A place in the queue.
#[derive(Debug)]
pub struct QueueTicket {
    execution_id: Uuid,
    rx: Option<oneshot::Receiver<()>>,
    state: Arc<Mutex<QueueState>>,
}

impl QueueTicket {
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// Wait until a slot is handed over.
    pub async fn wait(mut self) -> Result<QueuePermit, QueueWithdrawn> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(QueueWithdrawn(self.execution_id));
        };
        match rx.await {
            Ok(()) => {
                self.rx = None;
                Ok(QueuePermit {
                    state: Some(self.state.clone()),
                })
            }
            Err(_) => {
                self.rx = None;
                Err(QueueWithdrawn(self.execution_id))
            }
        }
    }
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else { return };
        // Hand-off happens under the lock, so once it is held the waiter is
        // either still queued or its slot has already been sent.
        let mut state = lock_state(&self.state);
        let before = state.waiters.len();
        state.waiters.retain(|w| w.execution_id != self.execution_id);
        if state.waiters.len() != before {
            return;
        }
        if rx.try_recv().is_ok() {
            state.running = state.running.saturating_sub(1);
            if state.has_capacity() {
                admit_next(&mut state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(admission: Admission) -> QueuePermit {
        match admission {
            Admission::Ready(p) => p,
            Admission::Queued { .. } => panic!("expected a free slot"),
        }
    }

    fn queued(admission: Admission) -> (usize, QueueTicket) {
        match admission {
            Admission::Queued { position, ticket } => (position, ticket),
            Admission::Ready(_) => panic!("expected to queue"),
        }
    }

    #[tokio::test]
    async fn test_unbounded_never_queues() {
        let q = ExecutionQueue::new(None, QueueDiscipline::Fifo);
        let _a = ready(q.admit(Uuid::now_v7(), 0));
        let _b = ready(q.admit(Uuid::now_v7(), 0));
        assert_eq!(q.running(), 2);
    }

    #[tokio::test]
    async fn test_fifo_hands_off_in_arrival_order() {
        let q = ExecutionQueue::new(Some(1), QueueDiscipline::Fifo);
        let first = ready(q.admit(Uuid::now_v7(), 0));
        let (p1, t1) = queued(q.admit(Uuid::now_v7(), 0));
        let (p2, t2) = queued(q.admit(Uuid::now_v7(), 0));
        assert_eq!((p1, p2), (1, 2));

        drop(first);
        let second = t1.wait().await.unwrap();
        assert_eq!(q.running(), 1);
        assert_eq!(q.waiting(), 1);
        drop(second);
        let _third = t2.wait().await.unwrap();
        assert_eq!(q.waiting(), 0);
    }

    #[tokio::test]
    async fn test_lifo_admits_newest_first() {
        let q = ExecutionQueue::new(Some(1), QueueDiscipline::Lifo);
        let first = ready(q.admit(Uuid::now_v7(), 0));
        let (_, old) = queued(q.admit(Uuid::now_v7(), 0));
        let (pos, new) = queued(q.admit(Uuid::now_v7(), 0));
        assert_eq!(pos, 1);

        drop(first);
        let _p = new.wait().await.unwrap();
        assert_eq!(q.waiting(), 1);
        drop(old);
        assert_eq!(q.waiting(), 0);
    }

    #[tokio::test]
    async fn test_priority_then_fifo_among_equals() {
        let q = ExecutionQueue::new(Some(1), QueueDiscipline::Priority);
        let first = ready(q.admit(Uuid::now_v7(), 0));
        let low = Uuid::now_v7();
        let high_a = Uuid::now_v7();
        let high_b = Uuid::now_v7();
        let (_, t_low) = queued(q.admit(low, 1));
        let (_, t_a) = queued(q.admit(high_a, 5));
        let (pos_b, t_b) = queued(q.admit(high_b, 5));
        assert_eq!(pos_b, 2);

        drop(first);
        let pa = t_a.wait().await.unwrap();
        drop(pa);
        let pb = t_b.wait().await.unwrap();
        drop(pb);
        let _pl = t_low.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_waiter_is_skipped() {
        let q = ExecutionQueue::new(Some(1), QueueDiscipline::Fifo);
        let first = ready(q.admit(Uuid::now_v7(), 0));
        let (_, t_gone) = queued(q.admit(Uuid::now_v7(), 0));
        let (_, t_next) = queued(q.admit(Uuid::now_v7(), 0));

        drop(t_gone);
        assert_eq!(q.waiting(), 1);

        drop(first);
        let _p = t_next.wait().await.unwrap();
        assert_eq!(q.running(), 1);
    }

    #[test]
    fn test_concurrent_release_and_abandon_keep_count() {
        for _ in 0..2000 {
            let q = ExecutionQueue::new(Some(1), QueueDiscipline::Fifo);
            let permit = ready(q.admit(Uuid::now_v7(), 0));
            let (_, ticket) = queued(q.admit(Uuid::now_v7(), 0));

            let barrier = Arc::new(std::sync::Barrier::new(2));
            let b1 = barrier.clone();
            let releaser = std::thread::spawn(move || {
                b1.wait();
                drop(permit);
            });
            let b2 = barrier.clone();
            let abandoner = std::thread::spawn(move || {
                b2.wait();
                drop(ticket);
            });
            releaser.join().unwrap();
            abandoner.join().unwrap();

            assert_eq!(q.running(), 0);
            assert_eq!(q.waiting(), 0);
        }
    }

    #[tokio::test]
    async fn test_dropped_ticket_returns_slot() {
        let q = ExecutionQueue::new(Some(1), QueueDiscipline::Fifo);
        let first = ready(q.admit(Uuid::now_v7(), 0));
        let (_, abandoned) = queued(q.admit(Uuid::now_v7(), 0));
        drop(first);
        // The slot was handed to the ticket; dropping it releases it again.
        drop(abandoned);
        assert_eq!(q.running(), 0);
        let _p = ready(q.admit(Uuid::now_v7(), 0));
    }

    #[tokio::test]
    async fn test_reconfigure_admits_waiters() {
        let q = ExecutionQueue::new(Some(1), QueueDiscipline::Fifo);
        let _first = ready(q.admit(Uuid::now_v7(), 0));
        let (_, t) = queued(q.admit(Uuid::now_v7(), 0));
        q.reconfigure(Some(2), QueueDiscipline::Fifo);
        let _p = t.wait().await.unwrap();
        assert_eq!(q.running(), 2);
    }
}
