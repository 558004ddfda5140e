//! Task dispatcher: resolves a quality tier, hands work to a worker and
//! publishes every lifecycle transition to the task's project channel.
//!
//! Each task owns a publish lane (an async mutex). A record update and the
//! broker publish that announces it happen under the same lane guard, so
//! subscribers see `queued -> started -> progress* -> terminal` in order even
//! when a cancel races the worker. Once a task is terminal its record is
//! frozen and later reports are logged and dropped.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use opentelemetry::KeyValue;
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tracing::{Instrument, Span, debug, info, warn};

use crate::broker::Publisher;
use crate::config::TierTable;
use crate::error::{Error, Result};
use crate::event::{
    Envelope, EventKind, TaskFailed, TaskLifecycle, TaskProgress, TaskQueued, TaskSuccess,
};
use crate::model::{NodeId, ProjectId, Task, TaskId, TaskStatus};
use crate::telemetry::metrics;
use crate::telemetry::task::{record_state_transition, start_task_span};
use crate::worker::{CancelSignal, Job, Worker};

/// A request to run one task.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub project_id: ProjectId,
    pub node_id: Option<NodeId>,
    /// Requested tier name. Missing or unknown names use the default tier.
    pub quality_tier: Option<String>,
    /// Worker parameters. Must be a JSON object.
    pub parameters: Value,
    pub correlation_id: Option<String>,
}

impl DispatchRequest {
    pub fn new(project_id: ProjectId) -> Self {
        Self {
            project_id,
            node_id: None,
            quality_tier: None,
            parameters: Value::Object(serde_json::Map::new()),
            correlation_id: None,
        }
    }

    pub fn node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(NodeId::new(node_id));
        self
    }

    pub fn tier(mut self, tier: impl Into<String>) -> Self {
        self.quality_tier = Some(tier.into());
        self
    }

    pub fn parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

struct TaskSlot {
    lane: Mutex<()>,
    record: RwLock<Task>,
    cancel: watch::Sender<bool>,
    correlation_id: Option<String>,
    span: Span,
}

impl TaskSlot {
    fn snapshot(&self) -> Task {
        self.record
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn status(&self) -> TaskStatus {
        self.record
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .status
    }

    fn record(&self) -> RwLockWriteGuard<'_, Task> {
        self.record.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A worker-side report, applied under the task's lane.
#[derive(Debug)]
enum Update {
    Started,
    Progress { progress: u8, step: Option<String> },
    Succeeded(String),
    Failed(String),
    Cancelled,
}

impl Update {
    fn label(&self) -> &'static str {
        match self {
            Update::Started => "started",
            Update::Progress { .. } => "progress",
            Update::Succeeded(_) => "success",
            Update::Failed(_) => "failed",
            Update::Cancelled => "cancelled",
        }
    }
}

pub struct TaskDispatcher {
    tasks: Arc<RwLock<HashMap<TaskId, Arc<TaskSlot>>>>,
    tiers: Arc<TierTable>,
    worker: Arc<dyn Worker>,
    publisher: Publisher,
}

impl Clone for TaskDispatcher {
    fn clone(&self) -> Self {
        Self {
            tasks: Arc::clone(&self.tasks),
            tiers: Arc::clone(&self.tiers),
            worker: Arc::clone(&self.worker),
            publisher: self.publisher.clone(),
        }
    }
}

impl TaskDispatcher {
    pub fn new(tiers: TierTable, worker: Arc<dyn Worker>, publisher: Publisher) -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            tiers: Arc::new(tiers),
            worker,
            publisher,
        }
    }

    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    fn tasks(&self) -> RwLockReadGuard<'_, HashMap<TaskId, Arc<TaskSlot>>> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, task_id: &TaskId) -> Option<Arc<TaskSlot>> {
        self.tasks().get(task_id).cloned()
    }

    /// Accept a task and start it in the background. Returns once
    /// `task.queued` has been published; never waits for the worker.
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<TaskId> {
        if !request.parameters.is_object() {
            return Err(Error::InvalidParameters(
                "parameters must be a JSON object".to_string(),
            ));
        }

        let tier = self.tiers.resolve(request.quality_tier.as_deref());
        let task_id = TaskId::new();
        let task = Task::new(
            task_id,
            request.project_id.clone(),
            request.node_id.clone(),
            tier.name.clone(),
        );
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let slot = Arc::new(TaskSlot {
            lane: Mutex::new(()),
            record: RwLock::new(task),
            cancel: cancel_tx,
            correlation_id: request.correlation_id.clone(),
            span: start_task_span(&request.project_id, &task_id, &tier.name),
        });

        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id, Arc::clone(&slot));

        metrics::tasks_dispatched().add(
            1,
            &[
                KeyValue::new("tier", tier.name.clone()),
                KeyValue::new("fell_back", tier.fell_back.to_string()),
            ],
        );
        slot.span.in_scope(|| {
            info!(
                node_id = request.node_id.as_ref().map(NodeId::as_str),
                requested = tier.requested.as_deref(),
                fell_back = tier.fell_back,
                "task dispatched"
            );
        });

        {
            let _lane = slot.lane.lock().await;
            self.publish(
                &slot,
                EventKind::TaskQueued(TaskQueued {
                    task_id,
                    node_id: request.node_id.clone(),
                    quality_tier: tier.name.clone(),
                    requested_tier: tier.requested.clone().filter(|_| tier.fell_back),
                }),
            )
            .await;
        }

        let job = Job {
            task_id,
            project_id: request.project_id,
            node_id: request.node_id,
            tier: tier.name,
            profile: tier.profile,
            parameters: request.parameters,
        };
        let span = slot.span.clone();
        let dispatcher = self.clone();
        tokio::spawn(dispatcher.run_task(slot, job, cancel_rx).instrument(span));

        Ok(task_id)
    }

    async fn run_task(self, slot: Arc<TaskSlot>, job: Job, cancel_rx: watch::Receiver<bool>) {
        let timeout = job.profile.timeout();
        let reporter = ProgressReporter {
            dispatcher: self.clone(),
            slot: Arc::clone(&slot),
        };
        let mut cancelled = CancelSignal::new(cancel_rx.clone());
        let work = self
            .worker
            .execute(job, reporter, CancelSignal::new(cancel_rx));

        let outcome = tokio::select! {
            _ = cancelled.cancelled() => {
                // Dropping the worker future stops in-process work and kills
                // child processes.
                debug!("worker stopped after cancellation");
                return;
            }
            outcome = tokio::time::timeout(timeout, work) => outcome,
        };

        let update = match outcome {
            Ok(Ok(result_ref)) => Update::Succeeded(result_ref),
            Ok(Err(e)) => Update::Failed(e.to_string()),
            Err(_) => Update::Failed(format!("timed out after {}s", timeout.as_secs())),
        };
        self.apply(&slot, update).await;
    }

    /// Cancel a task. `Ok(false)` when it is already terminal.
    pub async fn cancel(&self, task_id: &TaskId) -> Result<bool> {
        let slot = self
            .slot(task_id)
            .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;
        Ok(self.apply(&slot, Update::Cancelled).await)
    }

    /// Current snapshot of a task. Never waits on a publish in flight.
    pub fn get_status(&self, task_id: &TaskId) -> Result<Task> {
        self.slot(task_id)
            .map(|slot| slot.snapshot())
            .ok_or_else(|| Error::NotFound(format!("task {task_id}")))
    }

    /// Tasks of one project, oldest first.
    pub fn list(&self, project_id: &ProjectId) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks()
            .values()
            .map(|slot| slot.snapshot())
            .filter(|task| &task.project_id == project_id)
            .collect();
        tasks.sort_by_key(|task| task.created_at);
        tasks
    }

    /// Number of tasks not yet terminal.
    pub fn active_count(&self) -> usize {
        self.tasks()
            .values()
            .filter(|slot| !slot.status().is_terminal())
            .count()
    }

    /// Forget terminal tasks that finished more than `older_than` ago.
    pub fn prune_finished(&self, older_than: Duration) -> usize {
        let retention = chrono::Duration::from_std(older_than)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = Utc::now() - retention;
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        let before = tasks.len();
        tasks.retain(|_, slot| {
            let task = slot.record.read().unwrap_or_else(PoisonError::into_inner);
            !matches!(task.finished_at, Some(finished) if finished < cutoff)
        });
        let pruned = before - tasks.len();
        if pruned > 0 {
            debug!(pruned, "pruned finished tasks");
        }
        pruned
    }

    // -----------------------------------------------------------------------
    // Lane
    // -----------------------------------------------------------------------

    /// Apply one update under the task's lane. Returns false when the update
    /// was rejected because the task is already terminal.
    async fn apply(&self, slot: &TaskSlot, update: Update) -> bool {
        let _lane = slot.lane.lock().await;
        let status = slot.status();
        if status.is_terminal() {
            slot.span.in_scope(|| {
                warn!(status = %status, update = update.label(), "ignoring update for finished task");
            });
            return false;
        }

        let Task {
            task_id, node_id, ..
        } = slot.snapshot();
        let lifecycle = || TaskLifecycle {
            task_id,
            node_id: node_id.clone(),
        };

        // Results reported before the worker acknowledged still pass
        // through running.
        let needs_start = status == TaskStatus::Pending
            && !matches!(update, Update::Cancelled);
        if needs_start && self.transition(slot, TaskStatus::Running) {
            self.publish(slot, EventKind::TaskStarted(lifecycle())).await;
        }

        match update {
            Update::Started => {}
            Update::Progress { progress, step } => {
                let advanced = slot.record().record_progress(progress, step.clone());
                if !advanced {
                    slot.span.in_scope(|| {
                        warn!(reported = progress, "progress went backwards, not republished");
                    });
                    return true;
                }
                let progress = progress.min(100);
                self.publish(
                    slot,
                    EventKind::TaskProgress(TaskProgress {
                        task_id,
                        node_id: node_id.clone(),
                        progress,
                        step_description: step,
                    }),
                )
                .await;
            }
            Update::Succeeded(result_ref) => {
                {
                    let mut record = slot.record();
                    record.result_ref = Some(result_ref.clone());
                    record.progress = 100;
                }
                self.finish(slot, TaskStatus::Completed);
                self.publish(
                    slot,
                    EventKind::TaskSuccess(TaskSuccess {
                        task_id,
                        node_id: node_id.clone(),
                        result_ref,
                    }),
                )
                .await;
            }
            Update::Failed(error) => {
                slot.record().error = Some(error.clone());
                self.finish(slot, TaskStatus::Failed);
                self.publish(
                    slot,
                    EventKind::TaskFailed(TaskFailed {
                        task_id,
                        node_id: node_id.clone(),
                        error,
                    }),
                )
                .await;
            }
            Update::Cancelled => {
                self.finish(slot, TaskStatus::Cancelled);
                self.publish(slot, EventKind::TaskCancelled(lifecycle()))
                    .await;
            }
        }
        true
    }

    fn transition(&self, slot: &TaskSlot, to: TaskStatus) -> bool {
        let from = {
            let mut record = slot.record();
            let from = record.status;
            if let Err(e) = record.transition(to) {
                debug!(task_id = %record.task_id, "{e}");
                return false;
            }
            from
        };
        record_state_transition(&slot.span, from, to);
        true
    }

    /// Terminal transition: freeze the record, stop the worker, record the
    /// task's duration.
    fn finish(&self, slot: &TaskSlot, to: TaskStatus) {
        if !self.transition(slot, to) {
            return;
        }
        slot.cancel.send_replace(true);
        let task = slot.snapshot();
        let elapsed = task.finished_at.unwrap_or_else(Utc::now) - task.created_at;
        metrics::task_duration_ms().record(
            elapsed.num_milliseconds() as f64,
            &[
                KeyValue::new("tier", task.quality_tier.clone()),
                KeyValue::new("status", to.to_string()),
            ],
        );
    }

    /// Publish failures are logged; the task's own state is authoritative.
    async fn publish(&self, slot: &TaskSlot, kind: EventKind) {
        let project_id = slot.snapshot().project_id;
        let envelope = Envelope::new(kind)
            .for_project(project_id)
            .with_correlation(slot.correlation_id.clone());
        if let Err(e) = self.publisher.publish(&envelope).await {
            slot.span.in_scope(|| {
                warn!(kind = envelope.type_tag(), "failed to publish task event: {e}");
            });
        }
    }
}

/// Handed to a worker to report on its task. Cheap to clone.
#[derive(Clone)]
pub struct ProgressReporter {
    dispatcher: TaskDispatcher,
    slot: Arc<TaskSlot>,
}

impl ProgressReporter {
    pub fn task_id(&self) -> TaskId {
        self.slot.snapshot().task_id
    }

    /// Acknowledge the task: `pending -> running`. Returns false once the
    /// task is terminal.
    pub async fn started(&self) -> bool {
        self.dispatcher.apply(&self.slot, Update::Started).await
    }

    /// Report progress (0-100). Returns false once the task is terminal;
    /// the report is then dropped.
    pub async fn progress(&self, progress: u8, step: Option<String>) -> bool {
        self.dispatcher
            .apply(&self.slot, Update::Progress { progress, step })
            .await
    }

    pub fn is_finished(&self) -> bool {
        self.slot.status().is_terminal()
    }
}
