//! Worker that runs an external executable per task.
//!
//! The job is written to the child's stdin as JSON, and the task context is
//! also exported as `STUDIO_*` environment variables. The child reports on
//! stdout, one JSON object per line:
//!
//! ```text
//! {"progress": 40.5, "step": "denoising"}
//! {"result": "s3://renders/P1/frame.png"}
//! {"error": "out of memory"}
//! ```
//!
//! Progress may be fractional; it is rounded and clamped to 0..=100. Other
//! stdout lines are logged at debug level. A non-zero exit fails the
//! task. Cancellation kills the child.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{CancelSignal, Job, ProgressReporter, Worker};
use crate::error::{Error, Result};
use crate::event::clamp_percent;
use crate::model::NodeId;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ReportLine {
    Progress {
        progress: f64,
        #[serde(default)]
        step: Option<String>,
    },
    Result {
        result: String,
    },
    Error {
        error: String,
    },
}

#[derive(Debug, Clone)]
pub struct CommandWorker {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandWorker {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn command(&self, job: &Job) -> Result<Command> {
        let program = if self.program.is_relative() && self.program.components().count() > 1 {
            std::env::current_dir()?.join(&self.program)
        } else {
            self.program.clone()
        };

        let mut cmd = Command::new(program);
        cmd.args(&self.args)
            .env("STUDIO_TASK_ID", job.task_id.to_string())
            .env("STUDIO_PROJECT_ID", job.project_id.as_str())
            .env(
                "STUDIO_NODE_ID",
                job.node_id.as_ref().map(NodeId::as_str).unwrap_or(""),
            )
            .env("STUDIO_TIER", &job.tier)
            .env("STUDIO_MAX_VRAM_GB", job.profile.max_vram_gb.to_string())
            .env("STUDIO_STEPS", job.profile.steps.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

#[async_trait]
impl Worker for CommandWorker {
    async fn execute(
        &self,
        job: Job,
        progress: ProgressReporter,
        mut cancel: CancelSignal,
    ) -> Result<String> {
        debug!(program = %self.program.display(), task_id = %job.task_id, "spawning worker process");
        let mut child = self.command(&job)?.spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(&job)?;
            stdin.write_all(&payload).await?;
            stdin.shutdown().await?;
        }
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Worker("worker stdout not captured".into()))?;
        let mut lines = BufReader::new(stdout).lines();

        progress.started().await;

        let mut result = None;
        let mut reported_error = None;
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!("failed to kill worker process: {e}");
                    }
                    return Err(Error::Worker("cancelled".into()));
                }
                line = lines.next_line() => line?,
            };
            let Some(line) = line else { break };

            match serde_json::from_str::<ReportLine>(&line) {
                Ok(ReportLine::Progress { progress: pct, step }) => {
                    progress.progress(clamp_percent(pct), step).await;
                }
                Ok(ReportLine::Result { result: r }) => result = Some(r),
                Ok(ReportLine::Error { error }) => reported_error = Some(error),
                Err(_) => debug!(output = %line, "worker output"),
            }
        }

        let status = child.wait().await?;
        if let Some(error) = reported_error {
            return Err(Error::Worker(error));
        }
        if !status.success() {
            return Err(Error::Worker(format!(
                "worker exited with status {}",
                status.code().unwrap_or(-1)
            )));
        }
        result.ok_or_else(|| Error::Worker("worker exited without a result".into()))
    }
}
