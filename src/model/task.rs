//! Task record and its lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{NodeId, ProjectId, TaskId};
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted and queued, worker not yet acknowledged.
    Pending,
    /// Worker acknowledged and is producing progress.
    Running,
    /// Worker finished successfully. Terminal.
    Completed,
    /// Worker reported an error or timed out. Terminal.
    Failed,
    /// Cancelled on request. Terminal.
    Cancelled,
}

impl TaskStatus {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(crate::error::Error::Other(format!(
                "unknown task status: {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// One unit of dispatched work, as tracked by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: TaskId,
    pub project_id: ProjectId,
    pub node_id: Option<NodeId>,

    /// Resolved tier name (after fallback).
    pub quality_tier: String,

    pub status: TaskStatus,

    /// 0-100. Non-decreasing while running.
    pub progress: u8,

    /// Most recent step reported by the worker.
    pub step_description: Option<String>,

    /// Opaque pointer to the output. Present only once completed.
    pub result_ref: Option<String>,

    /// Error message. Present only once failed.
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        task_id: TaskId,
        project_id: ProjectId,
        node_id: Option<NodeId>,
        quality_tier: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            project_id,
            node_id,
            quality_tier: quality_tier.into(),
            status: TaskStatus::Pending,
            progress: 0,
            step_description: None,
            result_ref: None,
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Move to `to` if the state machine allows it. Otherwise the record is
    /// left untouched.
    pub fn transition(&mut self, to: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        let now = Utc::now();
        self.status = to;
        self.updated_at = now;
        if to.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(())
    }

    /// Record a progress report. A value lower than the current one leaves
    /// the recorded progress unchanged and returns false.
    pub fn record_progress(&mut self, progress: u8, step: Option<String>) -> bool {
        let progress = progress.min(100);
        self.updated_at = Utc::now();
        if step.is_some() {
            self.step_description = step;
        }
        if progress < self.progress {
            return false;
        }
        self.progress = progress;
        true
    }
}
