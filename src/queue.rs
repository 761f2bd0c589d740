//! Per-occurrence task/thought queue.
//!
//! Replaces the source's generator-based processing loop with a
//! restartable lazy sequence: [`TaskQueue::next_round`] pops up to
//! `max_active_thoughts` thoughts per call rather than holding an open
//! coroutine, matching the teacher's `AgentDaemon` interval-tick shape.

use std::collections::{HashMap, VecDeque};

use crate::clock::{TaskId, ThoughtId};
use crate::error::DispatchError;
use crate::task::{ChannelRef, Task, TaskStatus};
use crate::thought::Thought;

/// Bounded FIFO of tasks plus each task's nested bounded thought queue,
/// scoped to one `occurrence_id`.
pub struct TaskQueue {
    occurrence_id: String,
    max_active_tasks: usize,
    max_active_thoughts: usize,
    order: VecDeque<TaskId>,
    tasks: HashMap<TaskId, Task>,
    thoughts: HashMap<TaskId, VecDeque<Thought>>,
    /// Channel -> currently active task on that channel, for same-channel
    /// coalescing (spec §4.5).
    active_by_channel: HashMap<String, TaskId>,
}

impl TaskQueue {
    pub fn new(occurrence_id: impl Into<String>, max_active_tasks: usize, max_active_thoughts: usize) -> Self {
        Self {
            occurrence_id: occurrence_id.into(),
            max_active_tasks,
            max_active_thoughts,
            order: VecDeque::new(),
            tasks: HashMap::new(),
            thoughts: HashMap::new(),
            active_by_channel: HashMap::new(),
        }
    }

    pub fn occurrence_id(&self) -> &str {
        &self.occurrence_id
    }

    pub fn active_task_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Active)
            .count()
    }

    /// Submit a fresh observation. If a task is already active on the same
    /// channel, coalesce into it (sets `updated_info_available`) instead of
    /// creating a new task.
    pub fn submit(&mut self, task: Task, initial_thought: Thought) -> Result<TaskId, DispatchError> {
        if let Some(existing_id) = self.active_by_channel.get(&task.channel.0).cloned() {
            if let Some(existing) = self.tasks.get_mut(&existing_id) {
                existing.mark_updated_info(task.created_at);
                return Ok(existing_id);
            }
        }

        if self.order.len() >= self.max_active_tasks {
            return Err(DispatchError::Validation {
                message: format!("max_active_tasks ({}) exceeded", self.max_active_tasks),
            });
        }

        let task_id = task.task_id.clone();
        let channel = task.channel.clone();
        self.order.push_back(task_id.clone());
        self.tasks.insert(task_id.clone(), task);
        self.thoughts.entry(task_id.clone()).or_default().push_back(initial_thought);
        self.active_by_channel.insert(channel.0, task_id.clone());
        Ok(task_id)
    }

    pub fn task(&self, task_id: &TaskId) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    pub fn task_mut(&mut self, task_id: &TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(task_id)
    }

    pub fn push_thought(&mut self, task_id: &TaskId, thought: Thought) {
        self.thoughts.entry(task_id.clone()).or_default().push_back(thought);
    }

    /// Pop up to `max_active_thoughts` thoughts across all tasks, in
    /// task-insertion order then per-task FIFO order.
    pub fn next_round(&mut self) -> Vec<Thought> {
        let mut batch = Vec::new();
        for task_id in self.order.clone() {
            if batch.len() >= self.max_active_thoughts {
                break;
            }
            if let Some(queue) = self.thoughts.get_mut(&task_id) {
                while batch.len() < self.max_active_thoughts {
                    match queue.pop_front() {
                        Some(t) => batch.push(t),
                        None => break,
                    }
                }
            }
        }
        batch
    }

    /// Remove a task once it reaches a terminal status, freeing its channel
    /// slot and any remaining thought queue.
    pub fn retire_if_terminal(&mut self, task_id: &TaskId) {
        if let Some(task) = self.tasks.get(task_id) {
            if matches!(
                task.status,
                TaskStatus::Completed | TaskStatus::Rejected | TaskStatus::Deferred
            ) {
                self.active_by_channel.retain(|_, id| id != task_id);
                if task.status != TaskStatus::Deferred {
                    self.order.retain(|id| id != task_id);
                    self.tasks.remove(task_id);
                    self.thoughts.remove(task_id);
                }
            }
        }
    }

    pub fn channel_for(&self, channel: &ChannelRef) -> Option<&TaskId> {
        self.active_by_channel.get(&channel.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn task(id: &str, channel: &str) -> Task {
        Task::new(TaskId(id.into()), "occ-a", ChannelRef(channel.into()), Utc::now())
    }

    fn thought(id: &str, task_id: &str) -> Thought {
        Thought::initial(ThoughtId(id.into()), TaskId(task_id.into()), "hi", Utc::now())
    }

    #[test]
    fn same_channel_observation_coalesces_into_active_task() {
        let mut q = TaskQueue::new("occ-a", 10, 50);
        let id1 = q.submit(task("t1", "api:c1"), thought("th1", "t1")).unwrap();
        let id2 = q.submit(task("t2", "api:c1"), thought("th2", "t2")).unwrap();
        assert_eq!(id1, id2);
        assert!(q.task(&id1).unwrap().updated_info_available);
    }

    #[test]
    fn different_channels_create_distinct_tasks() {
        let mut q = TaskQueue::new("occ-a", 10, 50);
        let id1 = q.submit(task("t1", "api:c1"), thought("th1", "t1")).unwrap();
        let id2 = q.submit(task("t2", "api:c2"), thought("th2", "t2")).unwrap();
        assert_ne!(id1, id2);
    }

    #[test]
    fn next_round_respects_max_active_thoughts() {
        let mut q = TaskQueue::new("occ-a", 10, 1);
        q.submit(task("t1", "api:c1"), thought("th1", "t1")).unwrap();
        q.push_thought(&TaskId("t1".into()), thought("th2", "t1"));
        let batch = q.next_round();
        assert_eq!(batch.len(), 1);
        let batch2 = q.next_round();
        assert_eq!(batch2.len(), 1);
    }

    #[test]
    fn max_active_tasks_rejects_overflow() {
        let mut q = TaskQueue::new("occ-a", 1, 50);
        q.submit(task("t1", "api:c1"), thought("th1", "t1")).unwrap();
        q.task_mut(&TaskId("t1".into())).unwrap().status = TaskStatus::Active;
        let err = q.submit(task("t2", "api:c2"), thought("th2", "t2"));
        assert!(err.is_err());
    }

    /// Distinct-channel submissions stay `Pending` until a round promotes
    /// them — the queue must still bound on total queued tasks, not just
    /// the `Active` subset, or an unbounded burst between rounds slips
    /// past `max_active_tasks` entirely.
    #[test]
    fn pending_tasks_alone_still_bound_the_queue() {
        let mut q = TaskQueue::new("occ-a", 2, 50);
        q.submit(task("t1", "api:c1"), thought("th1", "t1")).unwrap();
        q.submit(task("t2", "api:c2"), thought("th2", "t2")).unwrap();
        assert_eq!(q.active_task_count(), 0, "neither task has been promoted yet");
        let err = q.submit(task("t3", "api:c3"), thought("th3", "t3"));
        assert!(err.is_err(), "a third distinct-channel submission must be rejected while two are still pending");
    }
}
