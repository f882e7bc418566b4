//! Task execution span helpers.
//!
//! One span per task a worker executes, with the outcome recorded on it
//! once the runner returns.

use tracing::Span;

use crate::model::{TaskId, WorkerId};

/// Start a span for one task execution.
///
/// The `task.outcome` field is declared empty and filled in by
/// [`record_outcome`].
pub fn start_task_span(worker: WorkerId, task: TaskId) -> Span {
    tracing::info_span!(
        "task.execute",
        "task.worker" = %worker,
        "task.id" = task.0,
        "task.outcome" = tracing::field::Empty,
    )
}

/// Record how the task ended and emit an event scoped to its span.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("task.outcome", outcome);
    span.in_scope(|| {
        tracing::debug!(outcome, "task finished");
    });
}
