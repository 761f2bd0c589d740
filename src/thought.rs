//! Thought: one reasoning step inside a [`crate::task::Task`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{TaskId, ThoughtId};

/// One reasoning step. Thoughts never hold back-pointers to their task's
/// other thoughts — only IDs, resolved through the queue (spec §9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thought {
    pub thought_id: ThoughtId,
    pub task_id: TaskId,
    pub parent_thought_id: Option<ThoughtId>,
    pub content: String,
    pub depth: u32,
    pub ponder_notes: Vec<String>,
    pub conscience_feedback: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Thought {
    /// The initial thought for a task: depth 0, no parent.
    pub fn initial(thought_id: ThoughtId, task_id: TaskId, content: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            thought_id,
            task_id,
            parent_thought_id: None,
            content: content.into(),
            depth: 0,
            ponder_notes: Vec::new(),
            conscience_feedback: Vec::new(),
            created_at: now,
        }
    }

    /// A follow-up thought chained from a non-terminal handler: depth+1,
    /// parented to `self`.
    pub fn follow_up(&self, thought_id: ThoughtId, content: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            thought_id,
            task_id: self.task_id.clone(),
            parent_thought_id: Some(self.thought_id.clone()),
            content: content.into(),
            depth: self.depth + 1,
            ponder_notes: Vec::new(),
            conscience_feedback: Vec::new(),
            created_at: now,
        }
    }

    pub fn is_at_max_depth(&self, max_depth: u32) -> bool {
        self.depth >= max_depth
    }

    pub fn append_conscience_feedback(&mut self, feedback: impl Into<String>) {
        self.conscience_feedback.push(feedback.into());
    }
}
