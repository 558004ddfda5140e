//! Task execution span helpers.
//!
//! Provides span creation and state-transition recording for tasks flowing
//! through the dispatcher.

use opentelemetry::KeyValue;
use tracing::Span;

use super::metrics;
use crate::model::{ProjectId, TaskId, TaskStatus};

/// Start a span for one task's execution.
///
/// The `task.state` field is declared empty and is updated by
/// [`record_state_transition`].
pub fn start_task_span(project_id: &ProjectId, task_id: &TaskId, tier: &str) -> Span {
    tracing::info_span!(
        "task.execute",
        "task.project" = %project_id,
        "task.id" = %task_id,
        "task.tier" = tier,
        "task.state" = tracing::field::Empty,
    )
}

/// Record a state transition on the span and in the transition counter.
pub fn record_state_transition(span: &Span, from: TaskStatus, to: TaskStatus) {
    span.record("task.state", tracing::field::display(to));
    span.in_scope(|| {
        tracing::info!(from = %from, to = %to, "state_transition");
    });
    metrics::task_transitions().add(
        1,
        &[
            KeyValue::new("from", from.to_string()),
            KeyValue::new("to", to.to_string()),
        ],
    );
}
