//! Task: the outer unit of work representing one request's lifecycle.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::TaskId;
use crate::error::DispatchError;

/// A task's position in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Active,
    Deferred,
    Completed,
    Rejected,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Active => "active",
            TaskStatus::Deferred => "deferred",
            TaskStatus::Completed => "completed",
            TaskStatus::Rejected => "rejected",
        };
        write!(f, "{s}")
    }
}

impl TaskStatus {
    /// Whether moving from `self` to `next` is an allowed transition.
    ///
    /// `pending -> active -> (completed | deferred | rejected)`;
    /// `deferred -> pending` is only reachable via authority resolution,
    /// which calls [`Task::resolve_deferral`] directly rather than this
    /// generic check.
    fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Active)
                | (TaskStatus::Active, TaskStatus::Completed)
                | (TaskStatus::Active, TaskStatus::Deferred)
                | (TaskStatus::Active, TaskStatus::Rejected)
        )
    }
}

/// An opaque `<platform>:<scope>[:subscope]` channel reference. The runtime
/// never parses it beyond taking the first `:`-delimited segment as the
/// platform prefix (used for coalescing and display only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRef(pub String);

impl ChannelRef {
    pub fn platform(&self) -> &str {
        self.0.split(':').next().unwrap_or("")
    }
}

impl std::fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The unit of work: one external request's lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub occurrence_id: String,
    pub channel: ChannelRef,
    pub status: TaskStatus,
    pub context: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub images: Vec<String>,
    /// Set when a new observation arrives on the same channel while this
    /// task is already active (spec §4.5); read by the conscience's
    /// updated-info structural check.
    pub updated_info_available: bool,
}

impl Task {
    pub fn new(
        task_id: TaskId,
        occurrence_id: impl Into<String>,
        channel: ChannelRef,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            occurrence_id: occurrence_id.into(),
            channel,
            status: TaskStatus::Pending,
            context: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            images: Vec::new(),
            updated_info_available: false,
        }
    }

    pub fn transition(&mut self, next: TaskStatus, now: DateTime<Utc>) -> Result<(), DispatchError> {
        if !self.status.can_transition_to(next) {
            return Err(DispatchError::Validation {
                message: format!("illegal task transition {} -> {}", self.status, next),
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// The only legal route from `deferred` back to `pending`.
    pub fn resolve_deferral(&mut self, now: DateTime<Utc>) -> Result<(), DispatchError> {
        if self.status != TaskStatus::Deferred {
            return Err(DispatchError::Validation {
                message: format!("cannot resolve deferral on task in status {}", self.status),
            });
        }
        self.status = TaskStatus::Pending;
        self.updated_at = now;
        Ok(())
    }

    /// Mark that a fresh observation arrived on this task's channel while
    /// it was already active.
    pub fn mark_updated_info(&mut self, now: DateTime<Utc>) {
        self.updated_info_available = true;
        self.updated_at = now;
    }
}
