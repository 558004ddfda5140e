//! Worker contract.
//!
//! A worker turns a [`Job`] into a result reference. It reports progress
//! through the [`ProgressReporter`] it is handed and must stop when its
//! [`CancelSignal`] fires. The dispatcher also drops the worker's future on
//! cancellation, so in-process work stops at its next suspension point.

pub mod command;
pub mod simulated;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use crate::config::TierProfile;
use crate::error::Result;
use crate::model::{NodeId, ProjectId, TaskId};

pub use crate::dispatcher::ProgressReporter;
pub use command::CommandWorker;
pub use simulated::SimulatedWorker;

/// Everything a worker needs to run one task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub task_id: TaskId,
    pub project_id: ProjectId,
    pub node_id: Option<NodeId>,
    /// Resolved tier name.
    pub tier: String,
    pub profile: TierProfile,
    pub parameters: Value,
}

#[async_trait]
pub trait Worker: Send + Sync {
    /// Run the job. Returns the result reference on success.
    async fn execute(
        &self,
        job: Job,
        progress: ProgressReporter,
        cancel: CancelSignal,
    ) -> Result<String>;
}

/// Cancellation side channel for one task.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the task is cancelled or otherwise finished.
    pub async fn cancelled(&mut self) {
        // An error means the dispatcher dropped the task, which is final too.
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}
