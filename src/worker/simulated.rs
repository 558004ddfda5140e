//! In-process worker that walks through the tier's sampling steps.
//!
//! Used when no generation backend is configured, and in tests. The job's
//! parameters may carry `"failAt": <percent>` to simulate a backend error.

use std::time::Duration;

use async_trait::async_trait;

use super::{CancelSignal, Job, ProgressReporter, Worker};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct SimulatedWorker {
    step_delay: Duration,
    /// Overrides the tier's step count.
    steps: Option<u32>,
}

impl SimulatedWorker {
    pub fn new(step_delay: Duration) -> Self {
        Self {
            step_delay,
            steps: None,
        }
    }

    pub fn with_steps(mut self, steps: u32) -> Self {
        self.steps = Some(steps.max(1));
        self
    }
}

impl Default for SimulatedWorker {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

#[async_trait]
impl Worker for SimulatedWorker {
    async fn execute(
        &self,
        job: Job,
        progress: ProgressReporter,
        cancel: CancelSignal,
    ) -> Result<String> {
        let steps = self.steps.unwrap_or(job.profile.steps).max(1);
        let fail_at = job
            .parameters
            .get("failAt")
            .and_then(|v| v.as_u64())
            .map(|v| v.min(100) as u8);

        if !progress.started().await {
            return Err(Error::Worker("task finished before it started".into()));
        }

        for step in 1..=steps {
            tokio::time::sleep(self.step_delay).await;
            if cancel.is_cancelled() {
                return Err(Error::Worker("cancelled".into()));
            }

            let pct = (step as u64 * 100 / steps as u64) as u8;
            if let Some(limit) = fail_at {
                if pct >= limit {
                    return Err(Error::Worker(format!("simulated failure at {pct}%")));
                }
            }
            let label = format!("step {step}/{steps} ({})", job.tier);
            if !progress.progress(pct, Some(label)).await {
                return Err(Error::Worker("task no longer active".into()));
            }
        }

        Ok(format!("sim://{}/{}.png", job.project_id, job.task_id))
    }
}
