//! Task queue: pending and delayed tasks, no failure policy.
//!
//! Tasks live in an id-addressed map; the pending and delayed lists hold ids
//! only, so parent/child links never form object cycles. A task is tracked
//! from `enqueue` until `complete`, including while it is in flight, so
//! `is_empty` only reports true once every task reached a terminal state.
//!
//! Delays use `tokio::time::Instant`, which keeps backoff testable under a
//! paused clock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::domain::Task;
use crate::error::QueueError;

#[derive(Default)]
struct QueueState {
    tasks: HashMap<String, Task>,
    pending: VecDeque<String>,
    /// Ids waiting for their eligibility time, kept sorted by time.
    delayed: Vec<(Instant, String)>,
    in_flight: HashSet<String>,
    /// Every id ever enqueued in this run.
    seen: HashSet<String>,
}

impl QueueState {
    fn promote(&mut self, now: Instant) {
        let due = self.delayed.partition_point(|(at, _)| *at <= now);
        for (_, id) in self.delayed.drain(..due) {
            self.pending.push_back(id);
        }
    }
}

/// Shared task queue for one directive run.
#[derive(Default)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
    ready: Notify,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a task to the pending set.
    ///
    /// Rejects empty ids, empty roles and ids already used in this run.
    pub fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        if task.id.trim().is_empty() {
            return Err(QueueError::EmptyId);
        }
        if task.role.trim().is_empty() {
            return Err(QueueError::EmptyRole { id: task.id });
        }
        {
            let mut state = self.lock();
            if !state.seen.insert(task.id.clone()) {
                return Err(QueueError::DuplicateId(task.id));
            }
            state.pending.push_back(task.id.clone());
            state.tasks.insert(task.id.clone(), task);
        }
        self.ready.notify_one();
        Ok(())
    }

    /// Whether `id` was ever enqueued in this run.
    pub fn contains_id(&self, id: &str) -> bool {
        self.lock().seen.contains(id)
    }

    /// Next task eligible now, moved to the in-flight set.
    pub fn dequeue_ready(&self) -> Option<Task> {
        let mut state = self.lock();
        state.promote(Instant::now());
        while let Some(id) = state.pending.pop_front() {
            if let Some(task) = state.tasks.get(&id).cloned() {
                state.in_flight.insert(id);
                return Some(task);
            }
        }
        None
    }

    /// Reinsert an in-flight task, eligible again after `delay`.
    ///
    /// The stored copy is replaced by `task`, which carries the updated
    /// retry counter.
    pub fn requeue(&self, task: Task, delay: Duration) -> Result<(), QueueError> {
        {
            let mut state = self.lock();
            if !state.in_flight.remove(&task.id) {
                return Err(QueueError::NotInFlight(task.id));
            }
            let at = Instant::now() + delay;
            let pos = state.delayed.partition_point(|(t, _)| *t <= at);
            state.delayed.insert(pos, (at, task.id.clone()));
            state.tasks.insert(task.id.clone(), task);
        }
        self.ready.notify_one();
        Ok(())
    }

    /// Mark an in-flight task terminal and drop it from the queue.
    pub fn complete(&self, id: &str) -> Result<Task, QueueError> {
        let mut state = self.lock();
        if !state.in_flight.remove(id) {
            return Err(QueueError::NotInFlight(id.to_string()));
        }
        state
            .tasks
            .remove(id)
            .ok_or_else(|| QueueError::NotInFlight(id.to_string()))
    }

    /// Remove every task that is not in flight, in eligibility order.
    pub fn drain_waiting(&self) -> Vec<Task> {
        let mut state = self.lock();
        let mut ids: Vec<String> = state.pending.drain(..).collect();
        ids.extend(state.delayed.drain(..).map(|(_, id)| id));
        ids.into_iter()
            .filter_map(|id| state.tasks.remove(&id))
            .collect()
    }

    /// True when no task is pending, delayed or in flight.
    pub fn is_empty(&self) -> bool {
        self.lock().tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Earliest eligibility time among delayed tasks.
    pub fn next_ready_at(&self) -> Option<Instant> {
        self.lock().delayed.first().map(|(at, _)| *at)
    }

    /// Resolve once a task is eligible now.
    ///
    /// Wakes on `enqueue`/`requeue` or when the earliest delay elapses; never
    /// polls. Pending forever while nothing is waiting.
    pub async fn wait_ready(&self) {
        loop {
            let notified = self.ready.notified();
            let next_at = {
                let mut state = self.lock();
                state.promote(Instant::now());
                if !state.pending.is_empty() {
                    return;
                }
                state.delayed.first().map(|(at, _)| *at)
            };
            match next_at {
                Some(at) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str) -> Task {
        Task::new(id, format!("title {id}"), "worker")
    }

    #[test]
    fn fifo_order_and_in_flight_tracking() {
        let q = TaskQueue::new();
        q.enqueue(task("a")).unwrap();
        q.enqueue(task("b")).unwrap();

        let a = q.dequeue_ready().unwrap();
        assert_eq!(a.id, "a");
        assert_eq!(q.in_flight(), 1);
        assert!(!q.is_empty());

        q.complete("a").unwrap();
        assert_eq!(q.dequeue_ready().unwrap().id, "b");
        assert!(q.dequeue_ready().is_none());
        q.complete("b").unwrap();
        assert!(q.is_empty());
    }

    #[test]
    fn rejects_invalid_tasks() {
        let q = TaskQueue::new();
        assert_eq!(q.enqueue(task("")), Err(QueueError::EmptyId));

        let mut no_role = task("x");
        no_role.role = " ".to_string();
        assert!(matches!(q.enqueue(no_role), Err(QueueError::EmptyRole { .. })));

        q.enqueue(task("dup")).unwrap();
        assert_eq!(
            q.enqueue(task("dup")),
            Err(QueueError::DuplicateId("dup".to_string()))
        );
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn completed_id_cannot_be_reused() {
        let q = TaskQueue::new();
        q.enqueue(task("a")).unwrap();
        q.dequeue_ready().unwrap();
        q.complete("a").unwrap();
        assert!(q.contains_id("a"));
        assert!(q.enqueue(task("a")).is_err());
    }

    #[test]
    fn complete_requires_in_flight() {
        let q = TaskQueue::new();
        q.enqueue(task("a")).unwrap();
        assert_eq!(
            q.complete("a").unwrap_err(),
            QueueError::NotInFlight("a".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn requeued_task_waits_for_delay() {
        let q = TaskQueue::new();
        q.enqueue(task("a")).unwrap();
        let mut a = q.dequeue_ready().unwrap();
        a.retries = 1;
        q.requeue(a, Duration::from_secs(5)).unwrap();

        assert!(q.dequeue_ready().is_none());
        assert!(!q.is_empty());

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(q.dequeue_ready().is_none());

        tokio::time::advance(Duration::from_secs(1)).await;
        let again = q.dequeue_ready().unwrap();
        assert_eq!(again.retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_ready_sleeps_until_delay_elapses() {
        let q = TaskQueue::new();
        q.enqueue(task("a")).unwrap();
        let a = q.dequeue_ready().unwrap();
        q.requeue(a, Duration::from_millis(5_000)).unwrap();

        let start = Instant::now();
        q.wait_ready().await;
        assert!(start.elapsed() >= Duration::from_millis(5_000));
        assert_eq!(q.dequeue_ready().unwrap().id, "a");
    }

    #[tokio::test]
    async fn wait_ready_wakes_on_enqueue() {
        let q = std::sync::Arc::new(TaskQueue::new());
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.wait_ready().await })
        };
        tokio::task::yield_now().await;
        q.enqueue(task("late")).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[test]
    fn drain_waiting_leaves_in_flight() {
        let q = TaskQueue::new();
        q.enqueue(task("a")).unwrap();
        q.enqueue(task("b")).unwrap();
        q.dequeue_ready().unwrap();
        let drained = q.drain_waiting();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].id, "b");
        assert_eq!(q.len(), 1);
    }
}
